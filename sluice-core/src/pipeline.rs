// Valve pipeline for request/response processing

use crate::logging::{debug, trace, warn};
use crate::{Error, Request, Response, Result};
use async_trait::async_trait;
use sluice_log::{Level, LogQueue};
use std::sync::Arc;
use std::time::Instant;

/// A single stage of request processing.
///
/// A valve either completes the response itself or hands off to the rest of
/// the pipeline by consuming `next`. The context is moved into
/// [`ValveContext::invoke_next`], so a valve can advance the traversal at most
/// once.
#[async_trait]
pub trait Valve: Send + Sync {
    /// Short name used in diagnostics
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn invoke(
        &self,
        req: &mut Request,
        res: &mut Response,
        next: ValveContext<'_>,
    ) -> Result<()>;
}

/// Cursor over the remaining stages of one traversal.
///
/// Created fresh for every request and never shared between requests.
pub struct ValveContext<'a> {
    stages: &'a [Arc<dyn Valve>],
    index: usize,
}

impl<'a> ValveContext<'a> {
    fn new(stages: &'a [Arc<dyn Valve>]) -> Self {
        Self { stages, index: 0 }
    }

    /// Invoke the next stage.
    ///
    /// Errors raised downstream are returned unchanged. Calling this after the
    /// last stage fails with [`Error::NoFurtherValves`].
    pub async fn invoke_next(self, req: &mut Request, res: &mut Response) -> Result<()> {
        let Some(valve) = self.stages.get(self.index) else {
            return Err(Error::NoFurtherValves);
        };
        trace!(valve = valve.name(), index = self.index, "Invoking valve");
        let next = ValveContext {
            stages: self.stages,
            index: self.index + 1,
        };
        valve.invoke(req, res, next).await
    }

    /// Number of stages not yet invoked
    pub fn remaining(&self) -> usize {
        self.stages.len().saturating_sub(self.index)
    }
}

/// Ordered chain of valves, terminated by an optional basic valve.
///
/// Build it once, then share it behind an `Arc`; every call to
/// [`Pipeline::invoke`] runs with its own [`ValveContext`].
#[derive(Clone, Default)]
pub struct Pipeline {
    valves: Vec<Arc<dyn Valve>>,
    basic: Option<Arc<dyn Valve>>,
    stages: Vec<Arc<dyn Valve>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a valve ahead of the basic valve
    pub fn add_valve<V: Valve + 'static>(&mut self, valve: V) -> &mut Self {
        self.valves.push(Arc::new(valve));
        self.rebuild();
        self
    }

    /// Set the terminal valve that runs after every other valve
    pub fn set_basic<V: Valve + 'static>(&mut self, valve: V) -> &mut Self {
        self.basic = Some(Arc::new(valve));
        self.rebuild();
        self
    }

    /// Remove every non-basic valve with the given name. Returns how many were removed.
    pub fn remove_valve(&mut self, name: &str) -> usize {
        let before = self.valves.len();
        self.valves.retain(|v| v.name() != name);
        let removed = before - self.valves.len();
        if removed > 0 {
            self.rebuild();
        }
        removed
    }

    pub fn basic(&self) -> Option<&Arc<dyn Valve>> {
        self.basic.as_ref()
    }

    /// All stages in invocation order
    pub fn valves(&self) -> &[Arc<dyn Valve>] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    fn rebuild(&mut self) {
        self.stages = self.valves.iter().chain(self.basic.iter()).cloned().collect();
    }

    /// Run the request through every stage starting from the first.
    pub async fn invoke(&self, req: &mut Request, res: &mut Response) -> Result<()> {
        debug!(
            valve_count = self.stages.len(),
            path = %req.path,
            method = %req.method,
            "Executing pipeline"
        );
        ValveContext::new(&self.stages).invoke_next(req, res).await
    }
}

// ========== Built-in Valves ==========

/// Writes one access log line per request to a [`LogQueue`].
pub struct AccessLogValve {
    queue: Arc<LogQueue>,
}

impl AccessLogValve {
    pub fn new(queue: Arc<LogQueue>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl Valve for AccessLogValve {
    fn name(&self) -> &str {
        "AccessLogValve"
    }

    async fn invoke(
        &self,
        req: &mut Request,
        res: &mut Response,
        next: ValveContext<'_>,
    ) -> Result<()> {
        let start = Instant::now();
        let result = next.invoke_next(req, res).await;
        let elapsed = start.elapsed();

        match &result {
            Ok(()) => self.queue.log(
                Level::Info,
                format!(
                    "{} {} {} {} {}b {:?}",
                    req.method,
                    req.uri,
                    req.protocol,
                    res.status,
                    res.body().len(),
                    elapsed
                ),
            ),
            Err(e) => self.queue.log(
                Level::Warn,
                format!(
                    "{} {} {} {} error=\"{}\" {:?}",
                    req.method,
                    req.uri,
                    req.protocol,
                    e.status_code(),
                    e,
                    elapsed
                ),
            ),
        }

        result
    }
}

/// Converts downstream errors into error responses while the response is
/// still uncommitted.
#[derive(Default)]
pub struct ErrorReportValve;

#[async_trait]
impl Valve for ErrorReportValve {
    fn name(&self) -> &str {
        "ErrorReportValve"
    }

    async fn invoke(
        &self,
        req: &mut Request,
        res: &mut Response,
        next: ValveContext<'_>,
    ) -> Result<()> {
        let Err(e) = next.invoke_next(req, res).await else {
            return Ok(());
        };
        if res.is_committed() {
            warn!(path = %req.path, error = %e, "Error after response was committed");
            return Err(e);
        }
        res.send_error(e.status_code(), &e.to_string())?;
        if let Some(seconds) = e.retry_after() {
            res.set_retry_after(seconds);
        }
        Ok(())
    }
}
