//! Multi-source file transfer between the nodes of a small, fixed swarm.
//!
//! Every node serves its local catalog over a line-oriented TCP protocol and
//! can pull a file from several holders at once, fetching disjoint chunks
//! from each of them in parallel.

pub mod client;
pub mod downloader;
pub mod error;
pub mod progress;
pub mod protocol;
pub mod server;
pub mod utils;

pub use error::{Error, Result};
