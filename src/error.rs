use std::io;
use std::result;

use thiserror::Error;

use crate::utils::multierr::MultiError;

pub type Result<T> = result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to connect to peer {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("peer {addr} closed the connection after {received} of {expected} bytes")]
    ShortRead {
        addr: String,
        expected: u64,
        received: u64,
    },
    #[error("no peer advertises file [{file_id}] {name}")]
    NoSources { file_id: u64, name: String },
    #[error("no local file with id {0}")]
    NotFound(u64),
    #[error("file [{0}] is already being downloaded")]
    AlreadyDownloading(u64),
    #[error("every swarm endpoint failed: {0}")]
    Unreachable(MultiError<Error>),
    #[error(transparent)]
    Io(#[from] io::Error),
}

