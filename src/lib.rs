pub mod app;
pub mod cli;
pub mod client;
pub mod error;
pub mod logging;
pub mod server;
pub mod service;
pub mod version;
pub mod waiter;

pub use error::{Error, Result};
