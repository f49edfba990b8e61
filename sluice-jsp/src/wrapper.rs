//! Per-page runtime record.
//!
//! A [`JspWrapper`] owns the loaded [`Page`] for one source URI and moves it
//! through its lifecycle:
//!
//! ```text
//! Unloaded -> Compiling -> Loaded -> (ReloadPending | Unavailable) -> Removed
//! ```
//!
//! Compiling and reloading are serialized by a lock owned by the wrapper, so
//! different pages compile in parallel while one page never compiles twice at
//! once. Service calls on a loaded page run concurrently unless the page says
//! it is not thread safe. `Removed` is terminal.

use crate::compiler::{CompilationContext, CompileOutcome, Page, PageCompiler, PageConfig};
use crate::{JspError, JspOptions, JspResult};
use parking_lot::RwLock;
use sluice_core::{Request, Response};
use sluice_log::{Level, LogQueue};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Longest unavailability window a page can ask for, one year
pub const MAX_UNAVAILABLE_SECS: u64 = 365 * 24 * 60 * 60;

/// Where a wrapper is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrapperState {
    /// No page loaded yet
    Unloaded,
    /// A compile step is running
    Compiling,
    /// Page loaded and current
    Loaded,
    /// Out of service until the unavailability window ends
    Unavailable,
    /// A newer artifact exists; the page is reloaded on the next request
    ReloadPending,
    /// The source disappeared; every request answers not found
    Removed,
}

pub struct JspWrapper {
    ctx: CompilationContext,
    config: PageConfig,
    options: Arc<JspOptions>,
    compiler: Arc<dyn PageCompiler>,
    page: RwLock<Option<Arc<dyn Page>>>,
    /// Serializes compile, reload and non-thread-safe service calls
    lock: Mutex<()>,
    reload: AtomicBool,
    first_time: AtomicBool,
    compiling: AtomicBool,
    /// Epoch millis until which the page is unavailable, 0 when available
    available: AtomicU64,
    removed: AtomicU32,
    compile_count: AtomicU64,
    reloads: Arc<AtomicU64>,
    log: Option<Arc<LogQueue>>,
}

impl JspWrapper {
    pub fn new(uri: &str, options: Arc<JspOptions>, compiler: Arc<dyn PageCompiler>) -> Self {
        Self {
            ctx: CompilationContext::new(&options.scratch_dir, uri),
            config: PageConfig::new(uri),
            options,
            compiler,
            page: RwLock::new(None),
            lock: Mutex::new(()),
            reload: AtomicBool::new(true),
            first_time: AtomicBool::new(true),
            compiling: AtomicBool::new(false),
            available: AtomicU64::new(0),
            removed: AtomicU32::new(0),
            compile_count: AtomicU64::new(0),
            reloads: Arc::new(AtomicU64::new(0)),
            log: None,
        }
    }

    /// Count successful reloads into a shared counter.
    pub fn with_reload_counter(mut self, counter: Arc<AtomicU64>) -> Self {
        self.reloads = counter;
        self
    }

    /// Also report lifecycle events to a container log queue.
    pub fn with_log_queue(mut self, queue: Arc<LogQueue>) -> Self {
        self.log = Some(queue);
        self
    }

    pub fn with_config(mut self, config: PageConfig) -> Self {
        self.config = config;
        self
    }

    pub fn uri(&self) -> &str {
        self.ctx.uri()
    }

    pub fn compilation_context(&self) -> &CompilationContext {
        &self.ctx
    }

    pub fn state(&self) -> WrapperState {
        if self.is_removed() {
            WrapperState::Removed
        } else if self.available_at().is_some_and(|at| at > SystemTime::now()) {
            WrapperState::Unavailable
        } else if self.compiling.load(Ordering::Acquire) {
            WrapperState::Compiling
        } else if self.page.read().is_none() {
            WrapperState::Unloaded
        } else if self.reload.load(Ordering::Acquire) {
            WrapperState::ReloadPending
        } else {
            WrapperState::Loaded
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.page.read().is_some()
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire) > 0
    }

    /// How many times the source was found missing
    pub fn removed_count(&self) -> u32 {
        self.removed.load(Ordering::Acquire)
    }

    /// How many compile steps have run
    pub fn compile_count(&self) -> u64 {
        self.compile_count.load(Ordering::Acquire)
    }

    /// End of the current unavailability window, if one was ever set and not yet cleared
    pub fn available_at(&self) -> Option<SystemTime> {
        match self.available.load(Ordering::Acquire) {
            0 => None,
            millis => Some(UNIX_EPOCH + Duration::from_millis(millis)),
        }
    }

    /// Serve `req`, compiling and loading the page first when needed.
    ///
    /// With `precompile` set the page is brought up to date but not
    /// executed. Unavailability and missing sources are answered with 503
    /// and 404 responses, or returned as errors when `req` is an include.
    pub async fn service(
        &self,
        req: &mut Request,
        res: &mut Response,
        precompile: bool,
    ) -> JspResult<()> {
        if self.is_removed() {
            return self.not_found(req, res, self.uri().to_string());
        }
        if let Some(seconds) = self.unavailable_for() {
            let message = format!("{} is unavailable", self.uri());
            return self.unavailable(req, res, message, seconds);
        }

        match self.try_service(req, res, precompile).await {
            Err(JspError::Unavailable { message, seconds }) => {
                let seconds = match u64::try_from(seconds) {
                    Ok(s) if s > 0 => s,
                    _ => self.options.default_unavailable_secs.max(1),
                }
                .min(MAX_UNAVAILABLE_SECS);
                self.available.store(
                    now_millis().saturating_add(seconds.saturating_mul(1000)),
                    Ordering::Release,
                );
                self.log(
                    Level::Warn,
                    format!("{} unavailable for {}s: {}", self.uri(), seconds, message),
                );
                self.unavailable(req, res, message, seconds)
            }
            Err(JspError::SourceNotFound(uri)) => {
                self.removed.fetch_add(1, Ordering::AcqRel);
                self.not_found(req, res, uri)
            }
            other => other,
        }
    }

    async fn try_service(
        &self,
        req: &mut Request,
        res: &mut Response,
        precompile: bool,
    ) -> JspResult<()> {
        self.prepare().await?;
        if precompile {
            debug!(uri = %self.uri(), "Precompiled page");
            return Ok(());
        }

        let page = self
            .page
            .read()
            .clone()
            .ok_or_else(|| JspError::compile(self.uri(), "page is not loaded"))?;
        if page.is_thread_safe() {
            page.service(req, res).await
        } else {
            let _guard = self.lock.lock().await;
            page.service(req, res).await
        }
    }

    /// Seconds left in the unavailability window. An elapsed window is cleared.
    fn unavailable_for(&self) -> Option<u64> {
        let available = self.available.load(Ordering::Acquire);
        if available == 0 {
            return None;
        }
        let now = now_millis();
        if available > now {
            return Some((available - now).div_ceil(1000));
        }
        let _ = self
            .available
            .compare_exchange(available, 0, Ordering::AcqRel, Ordering::Acquire);
        None
    }

    /// Answer 404, or hand the condition to the including request.
    fn not_found(&self, req: &Request, res: &mut Response, uri: String) -> JspResult<()> {
        if req.is_include() {
            return Err(JspError::SourceNotFound(uri));
        }
        if res.send_error(404, &uri).is_err() {
            self.log(
                Level::Error,
                format!("{} not found but the response was already committed", uri),
            );
        }
        Ok(())
    }

    /// Answer 503, or hand the condition to the including request.
    fn unavailable(
        &self,
        req: &Request,
        res: &mut Response,
        message: String,
        seconds: u64,
    ) -> JspResult<()> {
        if req.is_include() {
            return Err(JspError::Unavailable {
                message,
                seconds: i64::try_from(seconds).unwrap_or(i64::MAX),
            });
        }
        if res.send_error(503, &message).is_ok() {
            res.set_retry_after(seconds);
        } else {
            self.log(
                Level::Error,
                format!("{} unavailable but the response was already committed", self.uri()),
            );
        }
        Ok(())
    }

    /// Run the compile step when required and load the page if it is stale.
    async fn prepare(&self) -> JspResult<()> {
        let needs_compile = self.options.development || self.first_time.load(Ordering::Acquire);
        if !needs_compile && !self.needs_reload() {
            return Ok(());
        }

        let _guard = self.lock.lock().await;
        if self.options.development || self.first_time.load(Ordering::Acquire) {
            self.compile_locked().await?;
            self.first_time.store(false, Ordering::Release);
        }
        if self.needs_reload() {
            self.reload_locked().await?;
        }
        Ok(())
    }

    fn needs_reload(&self) -> bool {
        self.reload.load(Ordering::Acquire) || self.page.read().is_none()
    }

    async fn compile_locked(&self) -> JspResult<()> {
        self.compiling.store(true, Ordering::Release);
        let result = self.run_compiler().await;
        self.compiling.store(false, Ordering::Release);
        if let Err(e) = &result {
            warn!(uri = %self.uri(), error = %e, "Page compilation failed");
        }
        result
    }

    async fn run_compiler(&self) -> JspResult<()> {
        tokio::fs::create_dir_all(self.ctx.output_dir()).await?;
        self.compile_count.fetch_add(1, Ordering::AcqRel);
        if self.compiler.compile(&self.ctx).await? == CompileOutcome::Compiled {
            self.reload.store(true, Ordering::Release);
        }
        Ok(())
    }

    /// Load and init the new page, then swap it in. The previous page keeps
    /// serving until the swap and is destroyed after it.
    async fn reload_locked(&self) -> JspResult<()> {
        let page: Arc<dyn Page> = Arc::from(self.compiler.load(&self.ctx).await?);
        page.init(&self.config).await?;
        let previous = self.page.write().replace(page);
        self.reload.store(false, Ordering::Release);
        self.reloads.fetch_add(1, Ordering::AcqRel);
        if let Some(previous) = previous {
            previous.destroy().await;
        }

        info!(uri = %self.uri(), "Loaded page");
        Ok(())
    }

    /// Re-run the compile step for a loaded page so a changed source is
    /// picked up on the next request. A missing source marks the wrapper
    /// removed.
    pub async fn check_compile(&self) -> JspResult<()> {
        if !self.is_loaded() || self.is_removed() {
            return Ok(());
        }
        let _guard = self.lock.lock().await;
        match self.compile_locked().await {
            Err(JspError::SourceNotFound(uri)) => {
                self.removed.fetch_add(1, Ordering::AcqRel);
                self.log(Level::Info, format!("{} was removed", uri));
                Err(JspError::SourceNotFound(uri))
            }
            other => other,
        }
    }

    /// Tear down the loaded page.
    pub async fn destroy(&self) {
        let _guard = self.lock.lock().await;
        let page = self.page.write().take();
        if let Some(page) = page {
            page.destroy().await;
            debug!(uri = %self.uri(), "Destroyed page");
        }
    }

    fn log(&self, level: Level, message: String) {
        match level {
            Level::Error => error!(uri = %self.uri(), "{}", message),
            Level::Warn => warn!(uri = %self.uri(), "{}", message),
            _ => info!(uri = %self.uri(), "{}", message),
        }
        if let Some(queue) = &self.log {
            queue.log(level, message);
        }
    }
}

impl std::fmt::Debug for JspWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JspWrapper")
            .field("uri", &self.uri())
            .field("state", &self.state())
            .field("compile_count", &self.compile_count())
            .finish()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
