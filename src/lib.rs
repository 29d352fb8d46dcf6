pub mod client;
pub mod config;
pub mod error;
pub mod keys;
pub mod logging;
pub mod swap;

pub use error::SwapError;
