//! Response body output with optional chunked transfer encoding.
//!
//! [`ChunkedOutputStream`] wraps the connection's byte sink. When it is
//! created it inspects the response once and decides whether the body is
//! framed as `<hex-len>\r\n<payload>\r\n` chunks or passed straight through.
//! That decision is frozen as soon as the first byte goes out.

use crate::logging::trace;
use crate::{Error, Request, Response, Result};
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Terminal zero-length chunk
const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// Byte sink for one response body.
pub struct ChunkedOutputStream<W> {
    inner: W,
    use_chunking: bool,
    write_content: bool,
    suspended: bool,
    written: bool,
    frame: BytesMut,
}

impl<W: AsyncWrite + Unpin> ChunkedOutputStream<W> {
    /// Wrap `inner` for the given request/response pair.
    ///
    /// Sets `Transfer-Encoding: chunked` on the response when chunking is
    /// chosen, or `Connection: close` when the body would need chunking but
    /// the transport forbids it.
    pub fn new(inner: W, req: &Request, res: &mut Response) -> Self {
        let mut stream = Self {
            inner,
            use_chunking: false,
            write_content: !req.is_head(),
            suspended: res.is_suspended(),
            written: false,
            frame: BytesMut::with_capacity(256),
        };
        stream.decide(res);
        stream
    }

    /// Re-evaluate chunking against the current response state.
    ///
    /// Has no effect once any byte has been written.
    pub fn check_chunking(&mut self, req: &Request, res: &mut Response) {
        if self.written {
            return;
        }
        self.write_content = !req.is_head();
        self.suspended = res.is_suspended();
        self.decide(res);
    }

    fn decide(&mut self, res: &mut Response) {
        let mut use_chunking =
            !res.is_committed() && res.content_length().is_none() && res.status != 304;

        if use_chunking && !res.is_chunking_allowed() {
            res.set_header("Connection", "close");
            res.set_closing(true);
        }
        use_chunking = use_chunking && !res.is_closing();

        if use_chunking {
            res.set_header("Transfer-Encoding", "chunked");
        } else if res.is_chunking_allowed() {
            res.remove_header("Transfer-Encoding");
        }

        trace!(
            use_chunking,
            write_content = self.write_content,
            status = res.status,
            "Chunking decision"
        );
        self.use_chunking = use_chunking;
    }

    /// Whether output is framed as chunks
    pub fn use_chunking(&self) -> bool {
        self.use_chunking
    }

    /// False for HEAD requests; nothing from the body reaches the sink
    pub fn write_content(&self) -> bool {
        self.write_content
    }

    /// Suspend or resume output. Writes while suspended are dropped.
    pub fn set_suspended(&mut self, suspended: bool) {
        self.suspended = suspended;
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Write a slice of body bytes.
    pub async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if self.suspended || !self.write_content || bytes.is_empty() {
            return Ok(());
        }
        self.written = true;

        if !self.use_chunking {
            self.inner.write_all(bytes).await?;
            return Ok(());
        }

        self.frame.clear();
        self.frame.reserve(bytes.len() + 20);
        self.frame.put_slice(format!("{:x}\r\n", bytes.len()).as_bytes());
        self.frame.put_slice(bytes);
        self.frame.put_slice(b"\r\n");
        self.inner.write_all(&self.frame).await?;
        Ok(())
    }

    /// Write a single body byte.
    pub async fn write_byte(&mut self, byte: u8) -> Result<()> {
        self.write(&[byte]).await
    }

    /// Flush the underlying sink.
    pub async fn flush(&mut self) -> Result<()> {
        self.inner.flush().await?;
        Ok(())
    }

    /// Finish the body and hand back the underlying sink.
    ///
    /// Emits the terminal chunk when chunking is active. Fails with
    /// [`Error::StreamSuspended`] if output is suspended.
    pub async fn close(mut self) -> Result<W> {
        if self.suspended {
            return Err(Error::StreamSuspended);
        }
        if self.use_chunking && self.write_content {
            self.inner.write_all(LAST_CHUNK).await?;
        }
        self.inner.flush().await?;
        Ok(self.inner)
    }

    /// Access the underlying sink
    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }
}
