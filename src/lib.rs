pub mod api;
pub mod catalog;
pub mod config;
pub mod error;
pub mod inference;
pub mod models;
pub mod security;

pub use config::Config;
pub use error::{Error, Result};
