mod fs;
mod svr;

pub use fs::LocalCatalog;
pub use svr::{AppState, Server, ServerConfig};
