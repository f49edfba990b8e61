//! Sluice page runtime
//!
//! Compiles page sources on demand, caches one wrapper per page URI, reloads
//! pages whose sources change and serves them from a pipeline valve.
//!
//! # Usage
//!
//! ```rust,no_run
//! use sluice_core::Pipeline;
//! use sluice_jsp::{JspOptions, JspRuntimeContext, JspValve, TemplateCompiler};
//! use std::sync::Arc;
//!
//! let compiler = Arc::new(TemplateCompiler::from_dir("/srv/pages"));
//! let context = Arc::new(JspRuntimeContext::new(JspOptions::production(), compiler));
//!
//! let mut pipeline = Pipeline::new();
//! pipeline.set_basic(JspValve::new(context));
//! ```

pub mod compiler;
pub mod error;
pub mod options;
pub mod runtime_context;
pub mod template;
pub mod valve;
pub mod wrapper;

pub use compiler::{
    CompilationContext, CompileOutcome, DirectorySource, Page, PageCompiler, PageConfig,
    PageSource,
};
pub use error::{JspError, JspResult};
pub use options::JspOptions;
pub use runtime_context::JspRuntimeContext;
pub use template::{Template, TemplateCompiler, TemplatePage};
pub use valve::{JspValve, PRECOMPILE_PARAM};
pub use wrapper::{JspWrapper, MAX_UNAVAILABLE_SECS, WrapperState};
