pub mod action;
pub mod cluster;
pub mod config;
pub mod descriptor;
pub mod environment;
pub mod error;
pub mod expand;
pub mod io;
pub mod log;
pub mod node;
pub mod role;
pub mod scheduler;
pub mod shutdown;
pub mod uplink;

pub use error::{CastleError, Result};
