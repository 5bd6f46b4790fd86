pub mod block;
pub mod blockstore;
pub mod chunker;
pub mod client;
pub mod config;
pub mod dpth;
pub mod error;
pub mod hashstore;
pub mod logging;
pub mod manifest;
pub mod protocol;
pub mod records;
pub mod remote;
pub mod scorer;
pub mod server;
pub mod service;
pub mod session;
pub mod sparse;
pub mod transport;

pub use error::{Error, Result};
