//! Compiler, page and source contracts.
//!
//! A [`PageCompiler`] turns a page source URI into an artifact under the
//! scratch directory and loads that artifact as a [`Page`]. The runtime never
//! looks inside either; it only drives the compile, load, init, service and
//! destroy lifecycle.

use crate::{JspError, JspResult};
use async_trait::async_trait;
use sluice_core::{Request, Response};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

/// Where the artifacts for one page URI live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilationContext {
    uri: String,
    output_dir: PathBuf,
    artifact_path: PathBuf,
}

impl CompilationContext {
    /// Lay out the artifact for `uri` under `scratch_dir`.
    ///
    /// `/admin/index.jsp` compiles to `<scratch>/admin/index_jsp.page`. Every
    /// path segment is mangled with [`mangle_segment`], so distinct URIs never
    /// share an artifact and `..` cannot leave the scratch directory.
    pub fn new(scratch_dir: &Path, uri: &str) -> Self {
        let mut segments: Vec<String> = uri
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(mangle_segment)
            .collect();
        let name = if uri.ends_with('/') {
            None
        } else {
            segments.pop()
        };
        let output_dir = segments
            .iter()
            .fold(scratch_dir.to_path_buf(), |dir, segment| dir.join(segment));
        let artifact_path = output_dir.join(format!(
            "{}.page",
            name.as_deref().unwrap_or(DIRECTORY_ARTIFACT)
        ));
        Self {
            uri: uri.to_string(),
            output_dir,
            artifact_path,
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Directory the artifact is written to
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn artifact_path(&self) -> &Path {
        &self.artifact_path
    }
}

/// Artifact name for a URI naming a directory. No mangled segment is a lone `-`.
const DIRECTORY_ARTIFACT: &str = "-";

/// Turn one URI segment into a file name.
///
/// ASCII alphanumerics are kept, `.` becomes `_` and every other byte is
/// written as `-` followed by two hex digits. The mapping is reversible, so
/// `a.jsp`, `a.html` and `a_jsp` land on `a_jsp`, `a_html` and `a-5fjsp`.
pub fn mangle_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b if b.is_ascii_alphanumeric() => out.push(char::from(b)),
            b'.' => out.push('_'),
            b => out.push_str(&format!("-{:02x}", b)),
        }
    }
    out
}

/// Result of a compile step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileOutcome {
    /// A new artifact was produced; the loaded page is stale.
    Compiled,
    /// The existing artifact is current.
    UpToDate,
}

/// Per-page settings passed to [`Page::init`].
#[derive(Debug, Clone, Default)]
pub struct PageConfig {
    pub uri: String,
    pub init_params: HashMap<String, String>,
}

impl PageConfig {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            init_params: HashMap::new(),
        }
    }

    pub fn init_param(&self, name: &str) -> Option<&str> {
        self.init_params.get(name).map(String::as_str)
    }
}

/// A loaded, executable page.
#[async_trait]
pub trait Page: Send + Sync {
    /// Called once after loading, before the first service call.
    async fn init(&self, _config: &PageConfig) -> JspResult<()> {
        Ok(())
    }

    /// Handle a request.
    ///
    /// Returning [`JspError::Unavailable`] takes the page out of service for
    /// the given number of seconds.
    async fn service(&self, req: &mut Request, res: &mut Response) -> JspResult<()>;

    /// Called when the page is replaced or the runtime shuts down.
    async fn destroy(&self) {}

    /// Pages returning `false` are never serviced concurrently.
    fn is_thread_safe(&self) -> bool {
        true
    }
}

/// Turns page sources into loadable pages.
#[async_trait]
pub trait PageCompiler: Send + Sync {
    /// Cheap probe for whether a source exists for `uri`.
    async fn source_exists(&self, uri: &str) -> bool;

    /// Bring the artifact for `ctx` up to date.
    ///
    /// Fails with [`JspError::SourceNotFound`] if the source is gone and
    /// with [`JspError::Compile`] if it cannot be translated.
    async fn compile(&self, ctx: &CompilationContext) -> JspResult<CompileOutcome>;

    /// Load the current artifact for `ctx`.
    async fn load(&self, ctx: &CompilationContext) -> JspResult<Box<dyn Page>>;
}

/// Read access to page sources.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn exists(&self, uri: &str) -> bool;

    async fn last_modified(&self, uri: &str) -> JspResult<SystemTime>;

    async fn read(&self, uri: &str) -> JspResult<String>;
}

/// Page sources stored under a document root.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map `uri` to a file under the root. Anything other than plain path
    /// segments (`..`, drive prefixes) resolves to nothing.
    pub fn resolve(&self, uri: &str) -> Option<PathBuf> {
        let relative = Path::new(uri.trim_start_matches('/'));
        let mut path = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(segment) => path.push(segment),
                Component::CurDir => {}
                _ => return None,
            }
        }
        (path != self.root).then_some(path)
    }

    fn resolve_existing(&self, uri: &str) -> JspResult<PathBuf> {
        self.resolve(uri)
            .ok_or_else(|| JspError::SourceNotFound(uri.to_string()))
    }
}

#[async_trait]
impl PageSource for DirectorySource {
    async fn exists(&self, uri: &str) -> bool {
        match self.resolve(uri) {
            Some(path) => tokio::fs::metadata(path)
                .await
                .is_ok_and(|meta| meta.is_file()),
            None => false,
        }
    }

    async fn last_modified(&self, uri: &str) -> JspResult<SystemTime> {
        let path = self.resolve_existing(uri)?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| not_found_or_io(uri, e))?;
        Ok(meta.modified()?)
    }

    async fn read(&self, uri: &str) -> JspResult<String> {
        let path = self.resolve_existing(uri)?;
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| not_found_or_io(uri, e))
    }
}

fn not_found_or_io(uri: &str, err: std::io::Error) -> JspError {
    if err.kind() == std::io::ErrorKind::NotFound {
        JspError::SourceNotFound(uri.to_string())
    } else {
        JspError::Io(err)
    }
}
