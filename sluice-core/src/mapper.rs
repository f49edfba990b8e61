// Request to pipeline mapping

use crate::{Pipeline, Request};
use std::sync::Arc;

/// Selects the pipeline that should process a request.
///
/// Implementations are shared across connection tasks.
pub trait Mapper: Send + Sync {
    /// Protocol this mapper handles, `None` for any
    fn protocol(&self) -> Option<&str> {
        None
    }

    /// Pipeline for `req`, or `None` when nothing is mapped
    fn map(&self, req: &Request) -> Option<Arc<Pipeline>>;
}

/// Maps every request to the same pipeline.
#[derive(Clone)]
pub struct SingleTargetMapper {
    pipeline: Arc<Pipeline>,
}

impl SingleTargetMapper {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
        }
    }
}

impl Mapper for SingleTargetMapper {
    fn map(&self, _req: &Request) -> Option<Arc<Pipeline>> {
        Some(self.pipeline.clone())
    }
}

/// Maps requests by longest matching path prefix.
#[derive(Clone, Default)]
pub struct PrefixMapper {
    routes: Vec<(String, Arc<Pipeline>)>,
}

impl PrefixMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route paths under `prefix` (segment-aligned) to `pipeline`
    pub fn route(mut self, prefix: impl Into<String>, pipeline: Pipeline) -> Self {
        let prefix = prefix.into();
        let prefix = prefix.trim_end_matches('/').to_string();
        self.routes.push((prefix, Arc::new(pipeline)));
        self.routes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        self
    }
}

impl Mapper for PrefixMapper {
    fn map(&self, req: &Request) -> Option<Arc<Pipeline>> {
        self.routes
            .iter()
            .find(|(prefix, _)| {
                req.path.strip_prefix(prefix.as_str()).is_some_and(|rest| {
                    rest.is_empty() || rest.starts_with('/') || prefix.is_empty()
                })
            })
            .map(|(_, pipeline)| pipeline.clone())
    }
}
