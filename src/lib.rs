pub mod codec;
pub mod config;
pub mod constants;
pub mod error;
pub mod fleet;
pub mod net;
pub mod registry;
pub mod relay;
pub mod supervisor;

pub use error::{Error, Result};
