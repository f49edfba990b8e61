//! Built-in template page engine.
//!
//! Pages are text with two kinds of markup:
//!
//! - `${uri}` and `${param.NAME}` expressions, replaced per request
//!   (parameter values are HTML-escaped)
//! - `<%@ page isThreadSafe="false" contentType="..." %>` directives
//!
//! Compiling validates the source and copies it into the scratch directory;
//! loading parses the copy.

use crate::compiler::{
    CompilationContext, CompileOutcome, DirectorySource, Page, PageCompiler, PageSource,
};
use crate::{JspError, JspResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use sluice_core::{Request, Response};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::debug;

const DEFAULT_CONTENT_TYPE: &str = "text/html; charset=utf-8";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Uri,
    Param(String),
}

/// A parsed page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    segments: Vec<Segment>,
    thread_safe: bool,
    content_type: String,
}

impl Template {
    /// Parse `text`, reporting errors against `uri`.
    pub fn parse(uri: &str, text: &str) -> JspResult<Self> {
        let mut template = Self {
            segments: Vec::new(),
            thread_safe: true,
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
        };
        let mut rest = text;

        loop {
            let expr = rest.find("${");
            let directive = rest.find("<%@");
            let (start, is_directive) = match (expr, directive) {
                (Some(e), Some(d)) if d < e => (d, true),
                (Some(e), _) => (e, false),
                (None, Some(d)) => (d, true),
                (None, None) => break,
            };
            template.push_text(&rest[..start]);

            if is_directive {
                let body = &rest[start + 3..];
                let end = body
                    .find("%>")
                    .ok_or_else(|| JspError::compile(uri, "unterminated directive"))?;
                template.apply_directive(uri, body[..end].trim())?;
                rest = &body[end + 2..];
            } else {
                let body = &rest[start + 2..];
                let end = body
                    .find('}')
                    .ok_or_else(|| JspError::compile(uri, "unclosed ${ expression"))?;
                template.segments.push(parse_expression(uri, body[..end].trim())?);
                rest = &body[end + 1..];
            }
        }
        template.push_text(rest);
        Ok(template)
    }

    fn push_text(&mut self, text: &str) {
        if !text.is_empty() {
            self.segments.push(Segment::Text(text.to_string()));
        }
    }

    fn apply_directive(&mut self, uri: &str, body: &str) -> JspResult<()> {
        let Some(attrs) = body.strip_prefix("page") else {
            return Err(JspError::compile(
                uri,
                format!("unsupported directive: {}", body),
            ));
        };
        for (name, value) in parse_attributes(uri, attrs)? {
            match name {
                "isThreadSafe" => self.thread_safe = value != "false",
                "contentType" => self.content_type = value.to_string(),
                other => {
                    return Err(JspError::compile(
                        uri,
                        format!("unknown page attribute: {}", other),
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn is_thread_safe(&self) -> bool {
        self.thread_safe
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Render the page for `req`
    pub fn render(&self, req: &Request) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Uri => out.push_str(&req.path),
                Segment::Param(name) => {
                    escape_into(&mut out, req.query_param(name).unwrap_or(""))
                }
            }
        }
        out
    }
}

fn parse_expression(uri: &str, expr: &str) -> JspResult<Segment> {
    if expr == "uri" {
        return Ok(Segment::Uri);
    }
    match expr.strip_prefix("param.") {
        Some(name) if !name.is_empty() => Ok(Segment::Param(name.to_string())),
        _ => Err(JspError::compile(
            uri,
            format!("unknown expression: ${{{}}}", expr),
        )),
    }
}

/// Parse `name="value"` pairs separated by whitespace.
fn parse_attributes<'a>(uri: &str, mut input: &'a str) -> JspResult<Vec<(&'a str, &'a str)>> {
    let mut attrs = Vec::new();
    loop {
        input = input.trim_start();
        if input.is_empty() {
            return Ok(attrs);
        }
        let malformed = || JspError::compile(uri, format!("malformed attribute: {}", input));
        let (name, after) = input.split_once('=').ok_or_else(malformed)?;
        let after = after.trim_start().strip_prefix('"').ok_or_else(malformed)?;
        let (value, after) = after.split_once('"').ok_or_else(malformed)?;
        attrs.push((name.trim(), value));
        input = after;
    }
}

fn escape_into(out: &mut String, value: &str) {
    for c in value.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
}

/// A loaded [`Template`].
pub struct TemplatePage {
    template: Template,
}

impl TemplatePage {
    pub fn new(template: Template) -> Self {
        Self { template }
    }

    pub fn template(&self) -> &Template {
        &self.template
    }
}

#[async_trait]
impl Page for TemplatePage {
    async fn service(&self, req: &mut Request, res: &mut Response) -> JspResult<()> {
        res.set_content_type(self.template.content_type());
        res.write_str(&self.template.render(req));
        Ok(())
    }

    fn is_thread_safe(&self) -> bool {
        self.template.is_thread_safe()
    }
}

/// Compiles template pages read from a [`PageSource`].
///
/// A page is recompiled when its source modification time differs from the
/// one recorded at the last compile, or when its artifact is missing.
pub struct TemplateCompiler {
    source: Arc<dyn PageSource>,
    compiled_at: Mutex<HashMap<String, SystemTime>>,
}

impl TemplateCompiler {
    pub fn new(source: impl PageSource + 'static) -> Self {
        Self {
            source: Arc::new(source),
            compiled_at: Mutex::new(HashMap::new()),
        }
    }

    /// Compiler for sources under a document root
    pub fn from_dir(root: impl Into<PathBuf>) -> Self {
        Self::new(DirectorySource::new(root))
    }

    pub fn source(&self) -> &Arc<dyn PageSource> {
        &self.source
    }

    async fn is_current(&self, ctx: &CompilationContext, modified: SystemTime) -> bool {
        let recorded = self.compiled_at.lock().get(ctx.uri()).copied();
        recorded == Some(modified) && tokio::fs::metadata(ctx.artifact_path()).await.is_ok()
    }
}

#[async_trait]
impl PageCompiler for TemplateCompiler {
    async fn source_exists(&self, uri: &str) -> bool {
        self.source.exists(uri).await
    }

    async fn compile(&self, ctx: &CompilationContext) -> JspResult<CompileOutcome> {
        let uri = ctx.uri();
        let modified = self.source.last_modified(uri).await?;
        if self.is_current(ctx, modified).await {
            return Ok(CompileOutcome::UpToDate);
        }

        let text = self.source.read(uri).await?;
        Template::parse(uri, &text)?;
        tokio::fs::create_dir_all(ctx.output_dir()).await?;
        tokio::fs::write(ctx.artifact_path(), &text).await?;
        self.compiled_at.lock().insert(uri.to_string(), modified);

        debug!(uri = %uri, artifact = %ctx.artifact_path().display(), "Compiled page");
        Ok(CompileOutcome::Compiled)
    }

    async fn load(&self, ctx: &CompilationContext) -> JspResult<Box<dyn Page>> {
        let text = tokio::fs::read_to_string(ctx.artifact_path())
            .await
            .map_err(|e| {
                JspError::compile(
                    ctx.uri(),
                    format!("cannot read {}: {}", ctx.artifact_path().display(), e),
                )
            })?;
        let template = Template::parse(ctx.uri(), &text)?;
        Ok(Box::new(TemplatePage::new(template)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_render_expressions() {
        let template = Template::parse("/t.jsp", "<p>${uri}: ${ param.name }</p>").unwrap();
        let req = Request::new("GET", "/t.jsp?name=<b>&x=1");
        assert_eq!(template.render(&req), "<p>/t.jsp: &lt;b&gt;</p>");

        let req = Request::new("GET", "/t.jsp");
        assert_eq!(template.render(&req), "<p>/t.jsp: </p>");
    }

    #[test]
    fn test_page_directive() {
        let template = Template::parse(
            "/t.jsp",
            "<%@ page isThreadSafe=\"false\" contentType=\"text/plain; charset=utf-8\" %>body",
        )
        .unwrap();
        assert!(!template.is_thread_safe());
        assert_eq!(template.content_type(), "text/plain; charset=utf-8");
        assert_eq!(template.render(&Request::new("GET", "/t.jsp")), "body");
    }

    #[test]
    fn test_parse_errors() {
        for bad in [
            "Hello ${uri",
            "${session.user}",
            "${param.}",
            "<%@ page isThreadSafe=\"false\"",
            "<%@ include file=\"x\" %>",
            "<%@ page buffer=\"none\" %>",
            "<%@ page isThreadSafe=false %>",
        ] {
            let err = Template::parse("/bad.jsp", bad).unwrap_err();
            assert!(
                matches!(err, JspError::Compile { ref uri, .. } if uri == "/bad.jsp"),
                "{}: {}",
                bad,
                err
            );
        }
    }

    #[tokio::test]
    async fn test_compile_and_load() {
        let docs = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        std::fs::create_dir(docs.path().join("app")).unwrap();
        let source_path = docs.path().join("app/hello.jsp");
        std::fs::write(&source_path, "Hello ${param.who}").unwrap();

        let compiler = TemplateCompiler::from_dir(docs.path());
        let ctx = CompilationContext::new(scratch.path(), "/app/hello.jsp");

        assert!(compiler.source_exists("/app/hello.jsp").await);
        assert_eq!(compiler.compile(&ctx).await.unwrap(), CompileOutcome::Compiled);
        assert!(ctx.artifact_path().exists());
        assert_eq!(compiler.compile(&ctx).await.unwrap(), CompileOutcome::UpToDate);

        let page = compiler.load(&ctx).await.unwrap();
        let mut req = Request::new("GET", "/app/hello.jsp?who=world");
        let mut res = Response::ok();
        page.service(&mut req, &mut res).await.unwrap();
        assert_eq!(res.body(), b"Hello world");
        assert_eq!(res.header("Content-Type"), Some(DEFAULT_CONTENT_TYPE));

        // A changed modification time makes the artifact stale
        std::fs::write(&source_path, "Bye ${param.who}").unwrap();
        let file = std::fs::File::options().write(true).open(&source_path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(10))
            .unwrap();
        assert_eq!(compiler.compile(&ctx).await.unwrap(), CompileOutcome::Compiled);
    }

    #[tokio::test]
    async fn test_same_stem_pages_keep_their_own_artifacts() {
        let docs = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        std::fs::write(docs.path().join("a.jsp"), "JSP PAGE").unwrap();
        std::fs::write(docs.path().join("a.html"), "HTML PAGE").unwrap();
        let compiler = TemplateCompiler::from_dir(docs.path());

        let jsp = CompilationContext::new(scratch.path(), "/a.jsp");
        let html = CompilationContext::new(scratch.path(), "/a.html");
        compiler.compile(&jsp).await.unwrap();
        compiler.compile(&html).await.unwrap();

        for (ctx, body) in [(&jsp, "JSP PAGE"), (&html, "HTML PAGE")] {
            let page = compiler.load(ctx).await.unwrap();
            let mut req = Request::new("GET", ctx.uri());
            let mut res = Response::ok();
            page.service(&mut req, &mut res).await.unwrap();
            assert_eq!(res.body(), body.as_bytes());
        }
    }

    #[tokio::test]
    async fn test_compile_missing_source() {
        let docs = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let compiler = TemplateCompiler::from_dir(docs.path());
        let ctx = CompilationContext::new(scratch.path(), "/nope.jsp");

        assert!(!compiler.source_exists("/nope.jsp").await);
        assert!(matches!(
            compiler.compile(&ctx).await,
            Err(JspError::SourceNotFound(uri)) if uri == "/nope.jsp"
        ));
    }

    #[tokio::test]
    async fn test_compile_error_writes_no_artifact() {
        let docs = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        std::fs::write(docs.path().join("broken.jsp"), "${uri").unwrap();
        let compiler = TemplateCompiler::from_dir(docs.path());
        let ctx = CompilationContext::new(scratch.path(), "/broken.jsp");

        assert!(matches!(
            compiler.compile(&ctx).await,
            Err(JspError::Compile { .. })
        ));
        assert!(!ctx.artifact_path().exists());
        assert!(matches!(compiler.load(&ctx).await, Err(JspError::Compile { .. })));
    }
}
