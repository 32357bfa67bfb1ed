pub mod config;
pub mod error;
pub mod telemetry;

pub use config::{CommissionMode, CommissionSettings, Settings};
pub use error::AppError;
