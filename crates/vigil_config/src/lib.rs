//! Parsing and validation of `vigil.toml` harness configuration files.
//!
//! Every section and field is optional. A missing file section falls back to
//! the defaults documented on each type, so an empty file is a valid
//! configuration.

#![warn(missing_docs)]

pub mod error;
pub mod loader;
pub mod types;

pub use error::ConfigError;
pub use loader::{load_config, load_config_file, load_config_from_str, CONFIG_FILE_NAME};
pub use types::*;
