pub mod okx;
pub mod taapi;

pub use okx::{OkxClient, OkxCredentials};
pub use taapi::{RetryPolicy, TaapiClient};
