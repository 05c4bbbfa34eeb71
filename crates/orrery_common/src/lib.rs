pub mod cancel;
pub mod config;
pub mod error;
pub mod escape;
pub mod types;
