//! HTTP/1.x connector.
//!
//! Accepts connections, parses requests into pooled [`RequestLineBuffer`]s,
//! hands each request to the pipeline selected by a [`Mapper`] and writes the
//! response through a [`ChunkedOutputStream`]. Connections are kept alive
//! until the client asks to close, the idle timeout passes, or the
//! per-connection request limit is reached.

use crate::chunked::ChunkedOutputStream;
use crate::logging::{debug, info, trace, warn};
use crate::{
    Error, HttpDateCache, Mapper, ObjectPool, Request, RequestLineBuffer, Response, Result,
    ServerConfig,
};
use memchr::memchr;
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio::time::timeout;

/// Value of the `Server` response header
pub const SERVER_HEADER: &str = concat!("Sluice/", env!("CARGO_PKG_VERSION"));

/// Connector counters
#[derive(Debug, Default)]
pub struct ConnectorStats {
    connections: AtomicU64,
    requests: AtomicU64,
    errors: AtomicU64,
}

impl ConnectorStats {
    /// Connections accepted
    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    /// Requests dispatched to a pipeline
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Requests answered with an error status by the connector
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

enum LineRead {
    Line,
    Eof,
    TooLong,
}

/// HTTP/1.x front end shared by every connection task.
pub struct Connector {
    config: ServerConfig,
    mapper: Arc<dyn Mapper>,
    dates: Arc<HttpDateCache>,
    line_buffers: ObjectPool<RequestLineBuffer>,
    body_buffers: ObjectPool<Vec<u8>>,
    stats: ConnectorStats,
}

impl Connector {
    pub fn new(config: ServerConfig, mapper: Arc<dyn Mapper>) -> Self {
        Self::with_date_cache(config, mapper, Arc::new(HttpDateCache::new()))
    }

    /// Use a date cache shared with other components
    pub fn with_date_cache(
        config: ServerConfig,
        mapper: Arc<dyn Mapper>,
        dates: Arc<HttpDateCache>,
    ) -> Self {
        Self {
            line_buffers: ObjectPool::new(config.line_buffer_pool),
            body_buffers: ObjectPool::new(config.body_buffer_pool),
            config,
            mapper,
            dates,
            stats: ConnectorStats::default(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn stats(&self) -> &ConnectorStats {
        &self.stats
    }

    pub fn line_buffer_pool(&self) -> &ObjectPool<RequestLineBuffer> {
        &self.line_buffers
    }

    pub fn body_buffer_pool(&self) -> &ObjectPool<Vec<u8>> {
        &self.body_buffers
    }

    /// Bind a listener on the configured address
    pub async fn bind(&self) -> Result<TcpListener> {
        Ok(TcpListener::bind(&self.config.bind_addr).await?)
    }

    /// Accept connections until `shutdown` resolves, then wait for in-flight
    /// connections for at most the keep-alive timeout.
    pub async fn serve<F>(self: Arc<Self>, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);
        info!(addr = %listener.local_addr()?, "Connector listening");

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(error = %e, "Accept failed");
                            continue;
                        }
                    };
                    if let Err(e) = stream.set_nodelay(true) {
                        trace!(error = %e, "TCP_NODELAY not set");
                    }
                    let connector = self.clone();
                    connections.spawn(async move {
                        if let Err(e) = connector.handle_connection(stream).await {
                            debug!(peer = %peer, error = %e, "Connection closed with error");
                        }
                    });
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }
        drop(listener);

        info!(in_flight = connections.len(), "Connector draining connections");
        let drain = async { while connections.join_next().await.is_some() {} };
        if timeout(self.config.keep_alive_timeout_duration(), drain).await.is_err() {
            connections.abort_all();
        }
        Ok(())
    }

    /// Serve every request on one connection.
    pub async fn handle_connection<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.stats.connections.fetch_add(1, Ordering::Relaxed);
        let mut stream = BufReader::new(stream);
        let mut line = self.line_buffers.get_or_else(RequestLineBuffer::new);
        let mut raw = Vec::with_capacity(256);
        let idle = self.config.keep_alive_timeout_duration();
        let mut served = 0u32;

        let result = loop {
            let read = timeout(idle, self.read_request(&mut stream, &mut raw, &mut line)).await;
            let mut req = match read {
                Err(_) => {
                    trace!("Keep-alive timeout");
                    break Ok(());
                }
                Ok(Ok(None)) => break Ok(()),
                Ok(Ok(Some(req))) => req,
                Ok(Err(Error::Io(e))) => break Err(Error::Io(e)),
                Ok(Err(e)) => {
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    debug!(error = %e, "Rejecting malformed request");
                    break self.write_rejection(&mut stream, &e).await;
                }
            };
            line.recycle();
            served += 1;
            self.stats.requests.fetch_add(1, Ordering::Relaxed);

            let mut res = Response::ok();
            res.set_chunking_allowed(self.config.chunking && req.protocol == "HTTP/1.1");
            if !req.keep_alive() || served >= self.config.max_requests_per_connection {
                res.set_header("Connection", "close");
            }

            self.dispatch(&mut req, &mut res).await;
            let written = self.write_response(&mut stream, &req, &mut res).await;
            self.body_buffers.put(std::mem::take(&mut req.body));
            if let Err(e) = written {
                break Err(e);
            }
            if res.is_closing() {
                break Ok(());
            }
        };

        line.recycle();
        self.line_buffers.put(line);
        if let Err(e) = stream.get_mut().shutdown().await {
            trace!(error = %e, "Shutdown after close failed");
        }
        result
    }

    async fn dispatch(&self, req: &mut Request, res: &mut Response) {
        let result = match self.mapper.map(req) {
            Some(pipeline) => pipeline.invoke(req, res).await,
            None => Err(Error::NotFound(req.path.clone())),
        };
        let Err(e) = result else {
            return;
        };

        self.stats.errors.fetch_add(1, Ordering::Relaxed);
        if res.is_committed() {
            warn!(path = %req.path, error = %e, "Request failed after commit");
            res.set_closing(true);
            return;
        }
        debug!(path = %req.path, status = e.status_code(), error = %e, "Request failed");
        if res.send_error(e.status_code(), &e.to_string()).is_ok()
            && let Some(seconds) = e.retry_after()
        {
            res.set_retry_after(seconds);
        }
    }

    /// Read one request. `Ok(None)` means the peer closed the connection
    /// between requests.
    async fn read_request<R>(
        &self,
        reader: &mut R,
        raw: &mut Vec<u8>,
        line: &mut RequestLineBuffer,
    ) -> Result<Option<Request>>
    where
        R: AsyncBufRead + Unpin,
    {
        // Tolerate stray CRLFs between pipelined requests
        loop {
            raw.clear();
            match read_line(reader, raw, self.config.max_request_line).await? {
                LineRead::Eof => return Ok(None),
                LineRead::TooLong => {
                    return Err(Error::UriTooLong(format!(
                        "request line exceeds {} bytes",
                        self.config.max_request_line
                    )));
                }
                LineRead::Line if raw.iter().all(|b| matches!(b, b'\r' | b'\n')) => continue,
                LineRead::Line => break,
            }
        }

        line.parse(raw)?;
        let mut req = Request::from_request_line(line)?;
        trace!(method = %req.method, uri = %req.uri, "Request line parsed");

        let mut header_bytes = 0;
        loop {
            raw.clear();
            let remaining = self.config.max_header_bytes.saturating_sub(header_bytes);
            match read_line(reader, raw, remaining).await? {
                LineRead::Eof => return Err(Error::BadRequest("truncated headers".to_string())),
                LineRead::TooLong => {
                    return Err(Error::HeaderFieldsTooLarge(format!(
                        "headers exceed {} bytes",
                        self.config.max_header_bytes
                    )));
                }
                LineRead::Line => {}
            }
            header_bytes += raw.len();

            let header = trim_crlf(raw);
            if header.is_empty() {
                break;
            }
            let colon = memchr(b':', header)
                .ok_or_else(|| Error::BadRequest("malformed header line".to_string()))?;
            let name = std::str::from_utf8(&header[..colon])
                .map_err(|_| Error::BadRequest("header name is not UTF-8".to_string()))?
                .trim();
            let value = String::from_utf8_lossy(&header[colon + 1..]).trim().to_string();
            if name.is_empty() {
                return Err(Error::BadRequest("empty header name".to_string()));
            }
            req.headers.insert(name.to_ascii_lowercase(), value);
        }

        if req
            .header("transfer-encoding")
            .is_some_and(|te| !te.eq_ignore_ascii_case("identity"))
        {
            return Err(Error::BadRequest(
                "request bodies must carry a Content-Length".to_string(),
            ));
        }
        if let Some(length) = req.header("content-length") {
            let length: usize = length
                .parse()
                .map_err(|_| Error::BadRequest("invalid Content-Length".to_string()))?;
            if length > self.config.max_body_bytes {
                return Err(Error::PayloadTooLarge(format!(
                    "body of {} bytes exceeds {}",
                    length, self.config.max_body_bytes
                )));
            }
            let mut body = self.body_buffers.get_or_else(Vec::new);
            body.clear();
            body.resize(length, 0);
            reader.read_exact(&mut body).await?;
            req.body = body;
        }

        Ok(Some(req))
    }

    /// Frame and send a response. The body goes out with Content-Length when
    /// it fits in the output buffer, otherwise chunked where allowed.
    async fn write_response<W>(&self, writer: &mut W, req: &Request, res: &mut Response) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut body = res.take_body();
        let bodiless = res.status == 204 || res.status == 304 || (100..200).contains(&res.status);
        if bodiless {
            body.clear();
            res.remove_header("Content-Type");
            if res.status != 304 {
                res.set_content_length(0);
            }
        } else if res.content_length().is_none() && body.len() <= self.config.output_buffer_size {
            res.set_content_length(body.len() as u64);
        }
        res.set_header("Date", &*self.dates.current_date());
        res.set_header("Server", SERVER_HEADER);

        let protocol = if req.protocol == "HTTP/1.1" {
            "HTTP/1.1"
        } else {
            "HTTP/1.0"
        };
        let mut out = ChunkedOutputStream::new(&mut *writer, req, res);
        out.get_mut().write_all(&res.head_bytes(protocol)).await?;
        res.commit();

        for piece in body.chunks(self.config.output_buffer_size.max(1)) {
            out.write(piece).await?;
        }
        out.close().await?;

        trace!(status = res.status, bytes = body.len(), "Response written");
        body.clear();
        self.body_buffers.put(body);
        Ok(())
    }

    /// Answer a request that could not be parsed and close.
    async fn write_rejection<W>(&self, writer: &mut W, error: &Error) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let req = Request::new("GET", "*").with_protocol("HTTP/1.0");
        let mut res = Response::new(error.status_code());
        res.send_error(error.status_code(), &error.to_string())?;
        res.set_header("Connection", "close");
        self.write_response(writer, &req, &mut res).await
    }
}

async fn read_line<R>(reader: &mut R, out: &mut Vec<u8>, limit: usize) -> io::Result<LineRead>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(if out.is_empty() {
                LineRead::Eof
            } else {
                LineRead::Line
            });
        }

        let (taken, done) = match memchr(b'\n', available) {
            Some(pos) => (pos + 1, true),
            None => (available.len(), false),
        };
        out.extend_from_slice(&available[..taken]);
        reader.consume(taken);

        if trim_crlf(out).len() > limit {
            return Ok(LineRead::TooLong);
        }
        if done {
            return Ok(LineRead::Line);
        }
    }
}

fn trim_crlf(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_line_limits() {
        let mut input: &[u8] = b"GET / HTTP/1.1\r\nHost: x\r\n";
        let mut out = Vec::new();
        assert!(matches!(
            read_line(&mut input, &mut out, 64).await.unwrap(),
            LineRead::Line
        ));
        assert_eq!(out, b"GET / HTTP/1.1\r\n");

        out.clear();
        assert!(matches!(
            read_line(&mut input, &mut out, 3).await.unwrap(),
            LineRead::TooLong
        ));
    }

    #[tokio::test]
    async fn test_read_line_eof() {
        let mut input: &[u8] = b"";
        let mut out = Vec::new();
        assert!(matches!(
            read_line(&mut input, &mut out, 64).await.unwrap(),
            LineRead::Eof
        ));

        let mut partial: &[u8] = b"GET /";
        assert!(matches!(
            read_line(&mut partial, &mut out, 64).await.unwrap(),
            LineRead::Line
        ));
        assert_eq!(out, b"GET /");
    }

    #[test]
    fn test_trim_crlf() {
        assert_eq!(trim_crlf(b"abc\r\n"), b"abc");
        assert_eq!(trim_crlf(b"abc\n"), b"abc");
        assert_eq!(trim_crlf(b"abc"), b"abc");
    }
}
