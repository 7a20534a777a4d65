pub mod args;
pub mod ca;
pub mod certs;
pub mod config;
pub mod control;
pub mod error;
pub mod fs_util;
pub mod identity;
pub mod kv;
pub mod passwd;
pub mod paths;
pub mod proxy;
pub mod replicate;
pub mod router;
pub mod server;
pub mod token;

pub use args::{CheckTokenArgs, Cli, Command, DataDirArgs, ServerArgs};
pub use error::{BootstrapError, Result};
