//! Terminal valve dispatching requests to pages.

use crate::{JspError, JspResult, JspRuntimeContext};
use sluice_core::{
    DispatchType, INCLUDE_REQUEST_URI, Request, Response, Result, Valve, ValveContext, async_trait,
};
use std::sync::Arc;
use tracing::debug;

/// Query parameter asking for compilation without execution
pub const PRECOMPILE_PARAM: &str = "jsp_precompile";

/// Serves page requests through a [`JspRuntimeContext`].
///
/// Install it as the basic valve of a pipeline. Requests whose source does
/// not exist get a 404 without a wrapper being created.
pub struct JspValve {
    context: Arc<JspRuntimeContext>,
}

impl JspValve {
    pub fn new(context: Arc<JspRuntimeContext>) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &Arc<JspRuntimeContext> {
        &self.context
    }

    /// The page URI a request targets.
    ///
    /// An included request targets the URI recorded by the including
    /// request, not its own path.
    pub fn jsp_uri(req: &Request) -> &str {
        if req.is_include()
            && let Some(uri) = req.attribute(INCLUDE_REQUEST_URI)
        {
            return uri;
        }
        &req.path
    }

    /// Whether `req` only asks for the page to be compiled.
    ///
    /// Absent or `false` means serve; empty or `true` means precompile.
    pub fn precompile_requested(req: &Request) -> JspResult<bool> {
        match req.query_param(PRECOMPILE_PARAM) {
            None | Some("false") => Ok(false),
            Some("") | Some("true") => Ok(true),
            Some(other) => Err(JspError::InvalidPrecompile(other.to_string())),
        }
    }

    /// Resolve the page for `req` and run it.
    pub async fn dispatch(&self, req: &mut Request, res: &mut Response) -> JspResult<()> {
        let raw = Self::jsp_uri(req).to_string();
        let Some(uri) = JspRuntimeContext::normalize_uri(&raw) else {
            return missing(req, res, raw);
        };
        let precompile = Self::precompile_requested(req)?;

        let wrapper = match self.context.get_wrapper(&uri) {
            Some(wrapper) => wrapper,
            None => {
                if !self.context.source_exists(&uri).await {
                    return missing(req, res, uri);
                }
                self.context.get_or_create(&uri)
            }
        };

        debug!(uri = %uri, precompile, include = req.is_include(), "Dispatching page");
        wrapper.service(req, res, precompile).await
    }

    /// Run the page at `uri` as an include of `req`, appending its output to `res`.
    pub async fn include(&self, uri: &str, req: &mut Request, res: &mut Response) -> JspResult<()> {
        let dispatch = std::mem::replace(&mut req.dispatch, DispatchType::Include);
        let previous = req.remove_attribute(INCLUDE_REQUEST_URI);
        req.set_attribute(INCLUDE_REQUEST_URI, uri);

        let result = self.dispatch(req, res).await;

        req.dispatch = dispatch;
        match previous {
            Some(previous) => req.set_attribute(INCLUDE_REQUEST_URI, previous),
            None => {
                req.remove_attribute(INCLUDE_REQUEST_URI);
            }
        }
        result
    }
}

/// 404 for a source that does not exist, or an error for the including request.
fn missing(req: &Request, res: &mut Response, uri: String) -> JspResult<()> {
    if req.is_include() {
        return Err(JspError::SourceNotFound(uri));
    }
    if res.send_error(404, &uri).is_err() {
        tracing::error!(uri = %uri, "Page not found but the response was already committed");
    }
    Ok(())
}

#[async_trait]
impl Valve for JspValve {
    fn name(&self) -> &str {
        "JspValve"
    }

    async fn invoke(
        &self,
        req: &mut Request,
        res: &mut Response,
        _next: ValveContext<'_>,
    ) -> Result<()> {
        self.dispatch(req, res).await.map_err(Into::into)
    }
}
