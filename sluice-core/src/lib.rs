// Core library for the Sluice servlet container
// Request/response model, valve pipeline, connector and the shared runtime pieces

pub mod chunked;
pub mod cluster;
pub mod config;
pub mod connector;
pub mod date_cache;
pub mod error;
pub mod http;
pub mod logging;
pub mod mapper;
pub mod object_pool;
pub mod pipeline;
pub mod realm;
pub mod request_line;
pub mod status;

// Re-export commonly used types
pub use chunked::ChunkedOutputStream;
pub use cluster::Cluster;
pub use config::ServerConfig;
pub use connector::{Connector, ConnectorStats};
pub use date_cache::HttpDateCache;
pub use error::*;
pub use http::*;
pub use mapper::{Mapper, PrefixMapper, SingleTargetMapper};
pub use object_pool::{ObjectPool, PoolStats};
pub use pipeline::*;
pub use realm::{Callback, CredentialCallbackHandler};
pub use request_line::RequestLineBuffer;
pub use status::*;

// Re-export async_trait so valves can be written without a direct dependency
pub use async_trait::async_trait;
