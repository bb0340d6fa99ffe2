// Core modules
pub mod api;
pub mod config;
pub mod error;
pub mod execution;
pub mod indicators;
pub mod models;
pub mod persistence;

// Re-export commonly used types
pub use config::Settings;
pub use error::{Error, Result};
pub use models::*;
