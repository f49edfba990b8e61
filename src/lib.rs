// Sluice - servlet container core for Rust
//
// Valve pipelines, an HTTP/1.x connector with chunked output, pooled request
// buffers, an asynchronous log drain and an on-demand page runtime.

// Re-export core functionality
pub use sluice_core::*;

// Re-export member crates
pub use sluice_log;

#[cfg(feature = "jsp")]
pub use sluice_jsp;

// Re-export the runtime so applications can start a connector without a direct dependency
pub use tokio;

// Prelude for common imports
pub mod prelude {
    pub use crate::{
        Connector, Error, Mapper, Pipeline, PrefixMapper, Request, Response, Result,
        ServerConfig, SingleTargetMapper, Valve, ValveContext, async_trait,
    };
    pub use sluice_log::{Level, LogConfig, LogQueue};

    #[cfg(feature = "jsp")]
    pub use sluice_jsp::{
        JspOptions, JspRuntimeContext, JspValve, Page, PageCompiler, TemplateCompiler,
    };
}
