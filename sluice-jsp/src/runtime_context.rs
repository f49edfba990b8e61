//! Registry of page wrappers, one per normalized source URI.

use crate::compiler::PageCompiler;
use crate::wrapper::JspWrapper;
use crate::{JspError, JspOptions};
use parking_lot::{Mutex, RwLock};
use sluice_log::LogQueue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Maps page URIs to their wrappers.
///
/// Lookups take a shared lock. Creation re-checks under the exclusive lock,
/// so two requests racing on an unseen URI end up with the same wrapper.
pub struct JspRuntimeContext {
    options: Arc<JspOptions>,
    compiler: Arc<dyn PageCompiler>,
    wrappers: RwLock<HashMap<String, Arc<JspWrapper>>>,
    reloads: Arc<AtomicU64>,
    log: Option<Arc<LogQueue>>,
    background: Mutex<Option<JoinHandle<()>>>,
}

impl JspRuntimeContext {
    pub fn new(options: JspOptions, compiler: Arc<dyn PageCompiler>) -> Self {
        info!(
            development = options.development,
            scratch_dir = %options.scratch_dir.display(),
            "Page runtime starting"
        );
        Self {
            options: Arc::new(options),
            compiler,
            wrappers: RwLock::new(HashMap::new()),
            reloads: Arc::new(AtomicU64::new(0)),
            log: None,
            background: Mutex::new(None),
        }
    }

    /// Report wrapper lifecycle events to a container log queue.
    pub fn with_log_queue(mut self, queue: Arc<LogQueue>) -> Self {
        self.log = Some(queue);
        self
    }

    pub fn options(&self) -> &JspOptions {
        &self.options
    }

    /// Normalize a request path into a page URI.
    ///
    /// Collapses repeated slashes and `.` segments and resolves `..`.
    /// Returns `None` for paths that climb above the root or contain
    /// backslashes or NUL bytes.
    pub fn normalize_uri(uri: &str) -> Option<String> {
        if uri.contains('\\') || uri.contains('\0') {
            return None;
        }
        let mut segments: Vec<&str> = Vec::new();
        for segment in uri.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    segments.pop()?;
                }
                segment => segments.push(segment),
            }
        }
        Some(format!("/{}", segments.join("/")))
    }

    pub fn get_wrapper(&self, uri: &str) -> Option<Arc<JspWrapper>> {
        self.wrappers.read().get(uri).cloned()
    }

    /// Cheap existence probe for a page source.
    pub async fn source_exists(&self, uri: &str) -> bool {
        self.compiler.source_exists(uri).await
    }

    /// Return the wrapper for `uri`, creating it if absent.
    ///
    /// Callers should probe [`source_exists`](Self::source_exists) first so
    /// no wrapper is created for a request that will answer 404.
    pub fn get_or_create(&self, uri: &str) -> Arc<JspWrapper> {
        if let Some(wrapper) = self.get_wrapper(uri) {
            return wrapper;
        }

        let mut wrappers = self.wrappers.write();
        if let Some(wrapper) = wrappers.get(uri) {
            return wrapper.clone();
        }
        let mut wrapper = JspWrapper::new(uri, self.options.clone(), self.compiler.clone())
            .with_reload_counter(self.reloads.clone());
        if let Some(queue) = &self.log {
            wrapper = wrapper.with_log_queue(queue.clone());
        }
        let wrapper = Arc::new(wrapper);
        wrappers.insert(uri.to_string(), wrapper.clone());
        debug!(uri = %uri, "Created page wrapper");
        wrapper
    }

    /// Forget the wrapper for `uri`. The next request starts from scratch.
    pub fn remove_wrapper(&self, uri: &str) -> Option<Arc<JspWrapper>> {
        self.wrappers.write().remove(uri)
    }

    pub fn wrapper_count(&self) -> usize {
        self.wrappers.read().len()
    }

    /// URIs with a wrapper, sorted
    pub fn uris(&self) -> Vec<String> {
        let mut uris: Vec<String> = self.wrappers.read().keys().cloned().collect();
        uris.sort();
        uris
    }

    /// Pages (re)loaded since startup
    pub fn reload_count(&self) -> u64 {
        self.reloads.load(Ordering::Acquire)
    }

    /// Run the compile step of every loaded page so changed sources are
    /// reloaded on their next request.
    pub async fn check_compile(&self) {
        let wrappers: Vec<Arc<JspWrapper>> = self.wrappers.read().values().cloned().collect();
        for wrapper in wrappers {
            match wrapper.check_compile().await {
                Ok(()) | Err(JspError::SourceNotFound(_)) => {}
                Err(e) => warn!(uri = %wrapper.uri(), error = %e, "Background compile failed"),
            }
        }
    }

    /// Start the periodic [`check_compile`](Self::check_compile) task.
    ///
    /// Does nothing in development mode, where every request compiles, or
    /// when the task is already running. Returns whether a task was started.
    pub fn start_background_check(self: &Arc<Self>) -> bool {
        if self.options.development {
            return false;
        }
        let mut background = self.background.lock();
        if background.as_ref().is_some_and(|task| !task.is_finished()) {
            return false;
        }

        let interval = self.options.check_interval_duration();
        let context: Weak<Self> = Arc::downgrade(self);
        *background = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(context) = context.upgrade() else {
                    break;
                };
                context.check_compile().await;
            }
        }));
        debug!(interval = ?interval, "Background compile check started");
        true
    }

    /// Stop the background task and destroy every page.
    pub async fn destroy(&self) {
        if let Some(task) = self.background.lock().take() {
            task.abort();
        }
        let wrappers: Vec<Arc<JspWrapper>> =
            self.wrappers.write().drain().map(|(_, w)| w).collect();
        for wrapper in &wrappers {
            wrapper.destroy().await;
        }
        info!(pages = wrappers.len(), "Page runtime stopped");
    }
}

impl Drop for JspRuntimeContext {
    fn drop(&mut self) {
        if let Some(task) = self.background.get_mut().take() {
            task.abort();
        }
    }
}
