//! Page runtime behavior: compile-once, reload, removal and availability.

use parking_lot::Mutex;
use sluice_core::{Pipeline, Request, Response};
use sluice_jsp::{
    CompilationContext, CompileOutcome, JspError, JspOptions, JspResult, JspRuntimeContext,
    JspValve, MAX_UNAVAILABLE_SECS, Page, PageCompiler, WrapperState,
};
use sluice_log::{LogConfig, LogQueue};
use std::collections::HashSet;
use std::io::{self, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

// ========== Test doubles ==========

type Factory = Box<dyn Fn() -> Box<dyn Page> + Send + Sync>;

/// Compiler over an in-memory set of source URIs.
struct MockCompiler {
    sources: Mutex<HashSet<String>>,
    compiles: AtomicUsize,
    failures: AtomicUsize,
    delay: Duration,
    load_delay: Duration,
    factory: Factory,
}

impl MockCompiler {
    fn new(factory: impl Fn() -> Box<dyn Page> + Send + Sync + 'static) -> Self {
        Self {
            sources: Mutex::new(HashSet::new()),
            compiles: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
            delay: Duration::ZERO,
            load_delay: Duration::ZERO,
            factory: Box::new(factory),
        }
    }

    fn with_source(self, uri: &str) -> Self {
        self.add_source(uri);
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    fn add_source(&self, uri: &str) {
        self.sources.lock().insert(uri.to_string());
    }

    fn remove_source(&self, uri: &str) {
        self.sources.lock().remove(uri);
    }

    fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    fn compiles(&self) -> usize {
        self.compiles.load(Ordering::SeqCst)
    }
}

#[sluice_core::async_trait]
impl PageCompiler for MockCompiler {
    async fn source_exists(&self, uri: &str) -> bool {
        self.sources.lock().contains(uri)
    }

    async fn compile(&self, ctx: &CompilationContext) -> JspResult<CompileOutcome> {
        if !self.source_exists(ctx.uri()).await {
            return Err(JspError::SourceNotFound(ctx.uri().to_string()));
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.compiles.fetch_add(1, Ordering::SeqCst);
        let fail = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(JspError::compile(ctx.uri(), "syntax error"));
        }
        Ok(CompileOutcome::Compiled)
    }

    async fn load(&self, _ctx: &CompilationContext) -> JspResult<Box<dyn Page>> {
        if !self.load_delay.is_zero() {
            tokio::time::sleep(self.load_delay).await;
        }
        Ok((self.factory)())
    }
}

/// Writes `page:<path>` and counts calls.
#[derive(Clone, Default)]
struct Echo {
    calls: Arc<AtomicUsize>,
    destroyed: Arc<AtomicUsize>,
}

#[sluice_core::async_trait]
impl Page for Echo {
    async fn service(&self, req: &mut Request, res: &mut Response) -> JspResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        res.write_str(&format!("page:{}", req.path));
        Ok(())
    }

    async fn destroy(&self) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Reports itself unavailable once, then serves.
#[derive(Clone)]
struct FlakyPage {
    seconds: i64,
    tripped: Arc<AtomicBool>,
    calls: Arc<AtomicUsize>,
}

impl FlakyPage {
    fn new(seconds: i64) -> Self {
        Self {
            seconds,
            tripped: Arc::new(AtomicBool::new(false)),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[sluice_core::async_trait]
impl Page for FlakyPage {
    async fn service(&self, _req: &mut Request, res: &mut Response) -> JspResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.tripped.swap(true, Ordering::SeqCst) {
            return Err(JspError::unavailable("warming up", self.seconds));
        }
        res.write_str("ready");
        Ok(())
    }
}

/// Records the highest number of overlapping service calls.
#[derive(Clone, Default)]
struct SlowPage {
    thread_safe: bool,
    current: Arc<AtomicUsize>,
    max: Arc<AtomicUsize>,
}

#[sluice_core::async_trait]
impl Page for SlowPage {
    async fn service(&self, _req: &mut Request, _res: &mut Response) -> JspResult<()> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_thread_safe(&self) -> bool {
        self.thread_safe
    }
}

#[derive(Clone, Default)]
struct Capture(Arc<Mutex<Vec<u8>>>);

impl Write for Capture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn runtime(
    compiler: Arc<MockCompiler>,
    options: JspOptions,
) -> (tempfile::TempDir, Arc<JspRuntimeContext>) {
    let scratch = tempfile::tempdir().unwrap();
    let options = options.scratch_dir(scratch.path());
    (scratch, Arc::new(JspRuntimeContext::new(options, compiler)))
}

async fn get(valve: &JspValve, uri: &str) -> JspResult<Response> {
    let mut req = Request::new("GET", uri);
    let mut res = Response::ok();
    valve.dispatch(&mut req, &mut res).await?;
    Ok(res)
}

// ========== Compile and reload ==========

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_requests_compile_once() {
    let compiler = Arc::new(
        MockCompiler::new(|| Box::new(Echo::default()))
            .with_source("/a.jsp")
            .with_delay(Duration::from_millis(50)),
    );
    let (_scratch, context) = runtime(compiler.clone(), JspOptions::production());

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let context = context.clone();
        tasks.push(tokio::spawn(async move {
            let wrapper = context.get_or_create("/a.jsp");
            let mut req = Request::new("GET", "/a.jsp");
            let mut res = Response::ok();
            wrapper.service(&mut req, &mut res, false).await.unwrap();
            assert_eq!(res.body(), b"page:/a.jsp");
            wrapper
        }));
    }

    let mut wrappers = Vec::new();
    for task in tasks {
        wrappers.push(task.await.unwrap());
    }
    assert!(wrappers.iter().all(|w| Arc::ptr_eq(w, &wrappers[0])));
    assert_eq!(compiler.compiles(), 1);
    assert_eq!(context.wrapper_count(), 1);
    assert_eq!(context.reload_count(), 1);
}

#[tokio::test]
async fn test_development_mode_recompiles_each_request() {
    let compiler = Arc::new(MockCompiler::new(|| Box::new(Echo::default())).with_source("/dev.jsp"));
    let (_scratch, context) = runtime(compiler.clone(), JspOptions::new().development(true));
    let valve = JspValve::new(context.clone());

    get(&valve, "/dev.jsp").await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    get(&valve, "/dev.jsp").await.unwrap();

    let wrapper = context.get_wrapper("/dev.jsp").unwrap();
    assert_eq!(wrapper.compile_count(), 2);
    assert_eq!(compiler.compiles(), 2);
}

#[tokio::test]
async fn test_production_mode_compiles_once() {
    let compiler = Arc::new(MockCompiler::new(|| Box::new(Echo::default())).with_source("/p.jsp"));
    let (_scratch, context) = runtime(compiler.clone(), JspOptions::production());
    let valve = JspValve::new(context.clone());

    for _ in 0..3 {
        get(&valve, "/p.jsp").await.unwrap();
    }
    assert_eq!(compiler.compiles(), 1);
    assert_eq!(
        context.get_wrapper("/p.jsp").unwrap().state(),
        WrapperState::Loaded
    );
}

#[tokio::test]
async fn test_compile_error_does_not_poison_wrapper() {
    let compiler = Arc::new(MockCompiler::new(|| Box::new(Echo::default())).with_source("/c.jsp"));
    compiler.fail_next(1);
    let (_scratch, context) = runtime(compiler.clone(), JspOptions::production());
    let valve = JspValve::new(context.clone());

    let err = get(&valve, "/c.jsp").await.unwrap_err();
    assert!(matches!(err, JspError::Compile { .. }));
    assert_eq!(
        context.get_wrapper("/c.jsp").unwrap().state(),
        WrapperState::Unloaded
    );

    let res = get(&valve, "/c.jsp").await.unwrap();
    assert_eq!(res.body(), b"page:/c.jsp");
    assert_eq!(compiler.compiles(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_previous_page_serves_while_reloading() {
    let echo = Echo::default();
    let destroyed = echo.destroyed.clone();
    let compiler = Arc::new(
        MockCompiler::new(move || Box::new(echo.clone()))
            .with_source("/swap.jsp")
            .with_load_delay(Duration::from_millis(200)),
    );
    let (_scratch, context) = runtime(compiler, JspOptions::new().development(true));
    let wrapper = context.get_or_create("/swap.jsp");

    let mut req = Request::new("GET", "/swap.jsp");
    let mut res = Response::ok();
    wrapper.service(&mut req, &mut res, false).await.unwrap();

    let reloading = tokio::spawn({
        let wrapper = wrapper.clone();
        async move {
            let mut req = Request::new("GET", "/swap.jsp");
            let mut res = Response::ok();
            wrapper.service(&mut req, &mut res, false).await.unwrap();
            res.status
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The old page stays in place while the new one loads
    assert!(wrapper.is_loaded());
    assert_eq!(wrapper.state(), WrapperState::ReloadPending);
    assert_eq!(destroyed.load(Ordering::SeqCst), 0);

    assert_eq!(reloading.await.unwrap(), 200);
    assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    assert_eq!(context.reload_count(), 2);
}

#[tokio::test]
async fn test_compile_creates_output_directory() {
    let compiler =
        Arc::new(MockCompiler::new(|| Box::new(Echo::default())).with_source("/deep/dir/a.jsp"));
    let (scratch, context) = runtime(compiler, JspOptions::production());
    let valve = JspValve::new(context);

    get(&valve, "/deep/dir/a.jsp").await.unwrap();
    assert!(scratch.path().join("deep/dir").is_dir());
}

#[tokio::test]
async fn test_precompile_does_not_execute_page() {
    let page = Echo::default();
    let calls = page.calls.clone();
    let compiler = Arc::new(MockCompiler::new(move || Box::new(page.clone())).with_source("/pre.jsp"));
    let (_scratch, context) = runtime(compiler.clone(), JspOptions::production());
    let valve = JspValve::new(context.clone());

    let res = get(&valve, "/pre.jsp?jsp_precompile").await.unwrap();
    assert!(res.body().is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(compiler.compiles(), 1);
    assert_eq!(
        context.get_wrapper("/pre.jsp").unwrap().state(),
        WrapperState::Loaded
    );

    let res = get(&valve, "/pre.jsp?jsp_precompile=false").await.unwrap();
    assert_eq!(res.body(), b"page:/pre.jsp");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_invalid_precompile_value_is_server_error() {
    let compiler = Arc::new(MockCompiler::new(|| Box::new(Echo::default())).with_source("/a.jsp"));
    let (_scratch, context) = runtime(compiler, JspOptions::production());
    let mut pipeline = Pipeline::new();
    pipeline.set_basic(JspValve::new(context));

    let mut req = Request::new("GET", "/a.jsp?jsp_precompile=soon");
    let mut res = Response::ok();
    let err = pipeline.invoke(&mut req, &mut res).await.unwrap_err();
    assert_eq!(err.status_code(), 500);
}

// ========== Removal ==========

#[tokio::test]
async fn test_missing_source_is_not_found_without_wrapper() {
    let compiler = Arc::new(MockCompiler::new(|| Box::new(Echo::default())));
    let (_scratch, context) = runtime(compiler.clone(), JspOptions::production());
    let valve = JspValve::new(context.clone());

    let res = get(&valve, "/nothing.jsp").await.unwrap();
    assert_eq!(res.status, 404);
    assert!(res.is_error());
    assert_eq!(context.wrapper_count(), 0);
    assert_eq!(compiler.compiles(), 0);

    let res = get(&valve, "/../escape.jsp").await.unwrap();
    assert_eq!(res.status, 404);
}

#[tokio::test]
async fn test_removed_wrapper_stays_removed() {
    let compiler = Arc::new(MockCompiler::new(|| Box::new(Echo::default())).with_source("/gone.jsp"));
    let (_scratch, context) = runtime(compiler.clone(), JspOptions::new().development(true));
    let valve = JspValve::new(context.clone());

    assert_eq!(get(&valve, "/gone.jsp").await.unwrap().status, 200);

    compiler.remove_source("/gone.jsp");
    let res = get(&valve, "/gone.jsp").await.unwrap();
    assert_eq!(res.status, 404);
    let wrapper = context.get_wrapper("/gone.jsp").unwrap();
    assert_eq!(wrapper.state(), WrapperState::Removed);
    assert_eq!(wrapper.removed_count(), 1);

    // The source coming back does not revive the wrapper
    compiler.add_source("/gone.jsp");
    let res = get(&valve, "/gone.jsp").await.unwrap();
    assert_eq!(res.status, 404);
    assert_eq!(wrapper.state(), WrapperState::Removed);
    assert_eq!(compiler.compiles(), 1);

    // Dropping the wrapper is the only way back
    context.remove_wrapper("/gone.jsp");
    assert_eq!(get(&valve, "/gone.jsp").await.unwrap().status, 200);
}

#[tokio::test]
async fn test_not_found_after_commit_is_logged_only() {
    let capture = Capture::default();
    let queue = Arc::new(
        LogQueue::start(
            LogConfig::new().custom(true).with_timestamps(false),
            capture.clone(),
        )
        .unwrap(),
    );
    let compiler = Arc::new(MockCompiler::new(|| Box::new(Echo::default())).with_source("/x.jsp"));
    let scratch = tempfile::tempdir().unwrap();
    let context = Arc::new(
        JspRuntimeContext::new(
            JspOptions::new().development(true).scratch_dir(scratch.path()),
            compiler.clone(),
        )
        .with_log_queue(queue.clone()),
    );
    let wrapper = context.get_or_create("/x.jsp");
    compiler.remove_source("/x.jsp");

    let mut req = Request::new("GET", "/x.jsp");
    let mut res = Response::ok();
    res.write_str("partial");
    res.commit();
    wrapper.service(&mut req, &mut res, false).await.unwrap();

    assert_eq!(res.status, 200);
    assert_eq!(res.body(), b"partial");
    assert!(wrapper.is_removed());

    queue.shutdown().unwrap();
    let log = String::from_utf8(capture.0.lock().clone()).unwrap();
    assert!(log.contains("/x.jsp not found but the response was already committed"), "{}", log);
}

// ========== Availability ==========

#[tokio::test]
async fn test_unavailable_page_self_heals() {
    let page = FlakyPage::new(1);
    let calls = page.calls.clone();
    let compiler = Arc::new(MockCompiler::new(move || Box::new(page.clone())).with_source("/busy.jsp"));
    let (_scratch, context) = runtime(compiler, JspOptions::production());
    let valve = JspValve::new(context.clone());

    let res = get(&valve, "/busy.jsp").await.unwrap();
    assert_eq!(res.status, 503);
    assert_eq!(res.header("Retry-After"), Some("1"));

    let wrapper = context.get_wrapper("/busy.jsp").unwrap();
    assert_eq!(wrapper.state(), WrapperState::Unavailable);
    assert!(wrapper.available_at().is_some());

    // Still inside the window: the page is not called
    let res = get(&valve, "/busy.jsp").await.unwrap();
    assert_eq!(res.status, 503);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let res = get(&valve, "/busy.jsp").await.unwrap();
    assert_eq!(res.status, 200);
    assert_eq!(res.body(), b"ready");
    assert_eq!(wrapper.state(), WrapperState::Loaded);
    assert_eq!(wrapper.available_at(), None);
}

#[tokio::test]
async fn test_unavailable_without_duration_uses_default() {
    let page = FlakyPage::new(0);
    let compiler = Arc::new(MockCompiler::new(move || Box::new(page.clone())).with_source("/d.jsp"));
    let (_scratch, context) = runtime(
        compiler,
        JspOptions::production().default_unavailable(Duration::from_secs(45)),
    );
    let valve = JspValve::new(context);

    let res = get(&valve, "/d.jsp").await.unwrap();
    assert_eq!(res.status, 503);
    assert_eq!(res.header("Retry-After"), Some("45"));
}

#[tokio::test]
async fn test_removed_page_is_not_found_inside_unavailability_window() {
    let page = FlakyPage::new(60);
    let calls = page.calls.clone();
    let compiler = Arc::new(MockCompiler::new(move || Box::new(page.clone())).with_source("/busy.jsp"));
    let (_scratch, context) = runtime(compiler.clone(), JspOptions::production());
    let valve = JspValve::new(context.clone());

    assert_eq!(get(&valve, "/busy.jsp").await.unwrap().status, 503);
    let wrapper = context.get_wrapper("/busy.jsp").unwrap();

    compiler.remove_source("/busy.jsp");
    assert!(wrapper.check_compile().await.is_err());
    assert_eq!(wrapper.state(), WrapperState::Removed);

    let res = get(&valve, "/busy.jsp").await.unwrap();
    assert_eq!(res.status, 404);
    assert_eq!(res.header("Retry-After"), None);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let mut req = Request::new("GET", "/outer.jsp");
    let mut res = Response::ok();
    let err = valve.include("/busy.jsp", &mut req, &mut res).await.unwrap_err();
    assert!(matches!(err, JspError::SourceNotFound(_)));
}

#[tokio::test]
async fn test_huge_unavailability_is_clamped() {
    let page = FlakyPage::new(i64::MAX);
    let compiler = Arc::new(MockCompiler::new(move || Box::new(page.clone())).with_source("/long.jsp"));
    let (_scratch, context) = runtime(compiler, JspOptions::production());
    let valve = JspValve::new(context.clone());

    let res = get(&valve, "/long.jsp").await.unwrap();
    assert_eq!(res.status, 503);
    let expected = MAX_UNAVAILABLE_SECS.to_string();
    assert_eq!(res.header("Retry-After"), Some(expected.as_str()));

    let wrapper = context.get_wrapper("/long.jsp").unwrap();
    assert_eq!(wrapper.state(), WrapperState::Unavailable);
    let until = wrapper.available_at().unwrap();
    assert!(until > std::time::SystemTime::now() + Duration::from_secs(MAX_UNAVAILABLE_SECS - 60));

    let res = get(&valve, "/long.jsp").await.unwrap();
    assert_eq!(res.status, 503);
}

#[tokio::test]
async fn test_include_rethrows_instead_of_writing() {
    let page = FlakyPage::new(30);
    let compiler = Arc::new(
        MockCompiler::new(move || Box::new(page.clone()))
            .with_source("/outer.jsp")
            .with_source("/busy.jsp"),
    );
    let (_scratch, context) = runtime(compiler, JspOptions::production());
    let valve = JspValve::new(context);

    let mut req = Request::new("GET", "/outer.jsp");
    let mut res = Response::ok();

    let err = valve.include("/busy.jsp", &mut req, &mut res).await.unwrap_err();
    assert!(matches!(err, JspError::Unavailable { seconds: 30, .. }));

    let err = valve.include("/missing.jsp", &mut req, &mut res).await.unwrap_err();
    assert!(matches!(err, JspError::SourceNotFound(ref uri) if uri == "/missing.jsp"));

    assert_eq!(res.status, 200);
    assert!(!res.is_error());
    assert!(!req.is_include());
    assert_eq!(req.attribute(sluice_core::INCLUDE_REQUEST_URI), None);

    // While the window is open an include keeps getting the error
    let err = valve.include("/busy.jsp", &mut req, &mut res).await.unwrap_err();
    assert!(matches!(err, JspError::Unavailable { .. }));
}

// ========== Concurrency ==========

async fn max_overlap(thread_safe: bool) -> usize {
    let page = SlowPage {
        thread_safe,
        ..SlowPage::default()
    };
    let max = page.max.clone();
    let compiler = Arc::new(MockCompiler::new(move || Box::new(page.clone())).with_source("/slow.jsp"));
    let (_scratch, context) = runtime(compiler, JspOptions::production());
    let valve = Arc::new(JspValve::new(context));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let valve = valve.clone();
        tasks.push(tokio::spawn(async move {
            get(&valve, "/slow.jsp").await.unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    max.load(Ordering::SeqCst)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_threaded_page_is_serialized() {
    assert_eq!(max_overlap(false).await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_thread_safe_page_runs_concurrently() {
    assert!(max_overlap(true).await > 1);
}

// ========== Context lifecycle ==========

#[tokio::test]
async fn test_background_check_marks_pages_for_reload() {
    let compiler = Arc::new(MockCompiler::new(|| Box::new(Echo::default())).with_source("/bg.jsp"));
    let (_scratch, context) = runtime(
        compiler.clone(),
        JspOptions::production().check_interval(Duration::from_secs(1)),
    );
    let valve = JspValve::new(context.clone());
    get(&valve, "/bg.jsp").await.unwrap();

    assert!(context.start_background_check());
    assert!(!context.start_background_check());

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(compiler.compiles() >= 2);
    let wrapper = context.get_wrapper("/bg.jsp").unwrap();
    assert_eq!(wrapper.state(), WrapperState::ReloadPending);

    get(&valve, "/bg.jsp").await.unwrap();
    assert_eq!(wrapper.state(), WrapperState::Loaded);
    assert_eq!(context.reload_count(), 2);
    context.destroy().await;
}

#[tokio::test]
async fn test_no_background_check_in_development() {
    let compiler = Arc::new(MockCompiler::new(|| Box::new(Echo::default())));
    let (_scratch, context) = runtime(compiler, JspOptions::new().development(true));
    assert!(!context.start_background_check());
}

#[tokio::test]
async fn test_destroy_tears_down_every_page() {
    let page = Echo::default();
    let destroyed = page.destroyed.clone();
    let compiler = Arc::new(
        MockCompiler::new(move || Box::new(page.clone()))
            .with_source("/one.jsp")
            .with_source("/two.jsp"),
    );
    let (_scratch, context) = runtime(compiler, JspOptions::production());
    let valve = JspValve::new(context.clone());

    get(&valve, "/two.jsp").await.unwrap();
    get(&valve, "/one.jsp").await.unwrap();
    assert_eq!(context.uris(), vec!["/one.jsp".to_string(), "/two.jsp".to_string()]);

    context.destroy().await;
    assert_eq!(context.wrapper_count(), 0);
    assert_eq!(destroyed.load(Ordering::SeqCst), 2);
}
