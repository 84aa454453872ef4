// SPDX-FileCopyrightText: © 2025 RtmpKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Hand-rolled HTTP/1.1 request parsing and response writing (component L).
//!
//! This is deliberately not built on a general-purpose HTTP stack: egress
//! connections are few in number but long-lived and high-throughput, and the
//! transmuxers below want direct control over chunk framing and vectored
//! writes rather than going through a generic body-stream abstraction.

use bytes::{Buf, BytesMut};
use rtmpkit_core::error::{Error, Result};
use std::collections::HashMap;
use std::io::IoSlice;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const MAX_HEADER_BYTES: usize = 16 * 1024;

/// A parsed request line plus headers; the body (if any) is read separately
/// via [`read_body`].
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    pub content_length: Option<u64>,
    pub is_chunked: bool,
    pub is_keep_alive: bool,
}

impl RequestHead {
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// JSONP requests (`?callback=...`) may override the effective method via
    /// a `method` query parameter, so a `GET` can still drive a POST-shaped
    /// handler from a plain `<script src>` tag.
    #[must_use]
    pub fn effective_method(&self) -> &str {
        if self.query.contains_key("callback") {
            if let Some(m) = self.query.get("method") {
                return m;
            }
        }
        &self.method
    }
}

/// Reads and parses one request line + header block from `reader`.
///
/// # Errors
/// Returns `Error::Http` on a malformed request line, a header block over
/// [`MAX_HEADER_BYTES`], or an unexpected EOF before the blank-line terminator.
pub async fn read_request_head<R: AsyncRead + Unpin>(reader: &mut R) -> Result<RequestHead> {
    let mut buf = BytesMut::with_capacity(4096);
    let mut tmp = [0u8; 4096];
    let header_end = loop {
        if let Some(pos) = find_header_end(&buf) {
            break pos;
        }
        if buf.len() > MAX_HEADER_BYTES {
            return Err(Error::Http("request header too large".into()));
        }
        let n = reader.read(&mut tmp).await?;
        if n == 0 {
            return Err(Error::Http("connection closed before headers completed".into()));
        }
        buf.extend_from_slice(&tmp[..n]);
    };

    let head_bytes = buf.split_to(header_end + 4);
    let text = String::from_utf8_lossy(&head_bytes);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| Error::Http("empty request".into()))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| Error::Http("missing method".into()))?.to_string();
    let raw_path = parts.next().ok_or_else(|| Error::Http("missing path".into()))?;
    let (path, query) = split_query(raw_path);

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    let content_length =
        headers.get("content-length").and_then(|v| v.parse::<u64>().ok());
    let is_chunked = headers.get("transfer-encoding").is_some_and(|v| v.eq_ignore_ascii_case("chunked"));
    let is_keep_alive = match headers.get("connection") {
        Some(v) => v.eq_ignore_ascii_case("keep-alive"),
        None => request_line.ends_with("1.1"),
    };

    Ok(RequestHead { method, path, query, headers, content_length, is_chunked, is_keep_alive })
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn split_query(raw_path: &str) -> (String, HashMap<String, String>) {
    let Some((path, qs)) = raw_path.split_once('?') else {
        return (raw_path.to_string(), HashMap::new());
    };
    let mut query = HashMap::new();
    for pair in qs.split('&') {
        if let Some((k, v)) = pair.split_once('=') {
            query.insert(k.to_string(), v.to_string());
        } else if !pair.is_empty() {
            query.insert(pair.to_string(), String::new());
        }
    }
    (path.to_string(), query)
}

/// Reads the full request body, transparently de-chunking when
/// `head.is_chunked`, or reading exactly `content_length` bytes otherwise.
/// Empty-body requests (no length, not chunked) return immediately.
///
/// # Errors
/// Returns `Error::Http` on a malformed chunk size line or truncated body.
pub async fn read_body<R: AsyncRead + Unpin>(reader: &mut R, head: &RequestHead) -> Result<Vec<u8>> {
    if head.is_chunked {
        return read_chunked_body(reader).await;
    }
    let Some(len) = head.content_length else { return Ok(Vec::new()) };
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

async fn read_chunked_body<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    loop {
        let size_line = read_line(reader).await?;
        let size = usize::from_str_radix(size_line.trim(), 16)
            .map_err(|_| Error::Http(format!("bad chunk size line: {size_line:?}")))?;
        if size == 0 {
            let _ = read_line(reader).await?; // trailing CRLF after the terminal 0-chunk
            break;
        }
        let mut chunk = vec![0u8; size];
        reader.read_exact(&mut chunk).await?;
        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf).await?;
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

async fn read_line<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        reader.read_exact(&mut byte).await?;
        if byte[0] == b'\n' {
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            break;
        }
        line.push(byte[0]);
    }
    String::from_utf8(line).map_err(|e| Error::Http(e.to_string()))
}

/// Sniffs a default `Content-Type` from the first body bytes when the caller
/// never set one explicitly, mirroring the magic-byte checks egress callers
/// already know the answer to (FLV/TS/AAC/MP3 always set an explicit type;
/// this only backstops ad-hoc handlers).
#[must_use]
pub fn sniff_content_type(first_bytes: &[u8]) -> &'static str {
    if first_bytes.starts_with(b"FLV") {
        "video/x-flv"
    } else if first_bytes.first() == Some(&0x47) {
        "video/MP2T"
    } else if first_bytes.starts_with(b"{") || first_bytes.starts_with(b"[") {
        "application/json"
    } else {
        "application/octet-stream"
    }
}

/// Writes HTTP responses, either with a known `Content-Length` or chunked
/// transfer framing when the length is unknown up front.
pub struct ResponseWriter<W> {
    inner: W,
    mode: BodyMode,
    written: u64,
    declared_length: Option<u64>,
    headers_sent: bool,
}

enum BodyMode {
    Chunked,
    ContentLength,
}

impl<W: AsyncWrite + Unpin> ResponseWriter<W> {
    #[must_use]
    pub fn new(inner: W) -> Self {
        Self { inner, mode: BodyMode::Chunked, written: 0, declared_length: None, headers_sent: false }
    }

    /// Writes the status line and headers. `content_length = None` switches
    /// this writer into chunked mode and injects `Transfer-Encoding: chunked`;
    /// `Connection: Keep-Alive` is injected whenever the caller didn't
    /// already supply a `Connection` header.
    ///
    /// # Errors
    /// Propagates the underlying socket write error.
    pub async fn write_head(
        &mut self,
        status: u16,
        reason: &str,
        content_type: &str,
        content_length: Option<u64>,
        extra_headers: &[(&str, &str)],
    ) -> Result<()> {
        self.declared_length = content_length;
        self.mode = if content_length.is_some() { BodyMode::ContentLength } else { BodyMode::Chunked };

        let mut head = format!("HTTP/1.1 {status} {reason}\r\nContent-Type: {content_type}\r\n");
        if let Some(len) = content_length {
            head.push_str(&format!("Content-Length: {len}\r\n"));
        } else {
            head.push_str("Transfer-Encoding: chunked\r\n");
        }
        let has_connection = extra_headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("connection"));
        for (k, v) in extra_headers {
            head.push_str(&format!("{k}: {v}\r\n"));
        }
        if !has_connection {
            head.push_str("Connection: Keep-Alive\r\n");
        }
        head.push_str("\r\n");

        self.inner.write_all(head.as_bytes()).await?;
        self.headers_sent = true;
        Ok(())
    }

    /// Writes one body frame. In chunked mode this emits `<hex-size>\r\n` +
    /// payload + `\r\n`; in content-length mode it writes the payload
    /// directly and fails with `Error::Http` if the caller exceeds the
    /// declared length.
    ///
    /// # Errors
    /// Propagates socket errors, or `Error::Http` on a `Content-Length` overrun.
    pub async fn write_body(&mut self, data: &[u8]) -> Result<()> {
        self.check_overflow(data.len())?;
        match self.mode {
            BodyMode::Chunked => {
                let size_line = format!("{:X}\r\n", data.len());
                let bufs = [IoSlice::new(size_line.as_bytes()), IoSlice::new(data), IoSlice::new(b"\r\n")];
                write_vectored_all(&mut self.inner, &bufs).await?;
            },
            BodyMode::ContentLength => self.inner.write_all(data).await?,
        }
        self.written += data.len() as u64;
        Ok(())
    }

    /// Writes several body pieces as one chunk frame (chunked mode) or one
    /// vectored write (content-length mode), so a batch of media tags reaches
    /// the socket in a single syscall.
    ///
    /// # Errors
    /// Propagates socket errors, or `Error::Http` on a `Content-Length` overrun.
    pub async fn write_body_vectored(&mut self, pieces: &[&[u8]]) -> Result<()> {
        let total: usize = pieces.iter().map(|p| p.len()).sum();
        self.check_overflow(total)?;
        match self.mode {
            BodyMode::Chunked => {
                let size_line = format!("{total:X}\r\n");
                let mut bufs = Vec::with_capacity(pieces.len() + 2);
                bufs.push(IoSlice::new(size_line.as_bytes()));
                bufs.extend(pieces.iter().map(|p| IoSlice::new(p)));
                bufs.push(IoSlice::new(b"\r\n"));
                write_vectored_all(&mut self.inner, &bufs).await?;
            },
            BodyMode::ContentLength => {
                let bufs: Vec<IoSlice<'_>> = pieces.iter().map(|p| IoSlice::new(p)).collect();
                write_vectored_all(&mut self.inner, &bufs).await?;
            },
        }
        self.written += total as u64;
        Ok(())
    }

    fn check_overflow(&self, additional: usize) -> Result<()> {
        if let Some(len) = self.declared_length {
            if self.written + additional as u64 > len {
                return Err(Error::Http("ContentLengthOverflow".into()));
            }
        }
        Ok(())
    }

    /// Terminates a chunked body (`0\r\n\r\n`); a no-op in content-length mode.
    ///
    /// # Errors
    /// Propagates socket errors.
    pub async fn finish(&mut self) -> Result<()> {
        if matches!(self.mode, BodyMode::Chunked) {
            self.inner.write_all(b"0\r\n\r\n").await?;
        }
        self.inner.flush().await?;
        Ok(())
    }

    #[must_use]
    pub const fn bytes_written(&self) -> u64 {
        self.written
    }
}

async fn write_vectored_all<W: AsyncWrite + Unpin>(writer: &mut W, bufs: &[IoSlice<'_>]) -> Result<()> {
    let mut remaining = BytesMut::new();
    for buf in bufs {
        remaining.extend_from_slice(buf);
    }
    while remaining.has_remaining() {
        let n = writer.write(&remaining).await?;
        if n == 0 {
            return Err(Error::Io(std::io::Error::from(std::io::ErrorKind::WriteZero)));
        }
        remaining.advance(n);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_parses_request_line_and_headers() {
        let raw = b"GET /live/sr1.flv?token=abc HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n".to_vec();
        let mut cursor = Cursor::new(raw);
        let head = read_request_head(&mut cursor).await.unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.path, "/live/sr1.flv");
        assert_eq!(head.query.get("token").map(String::as_str), Some("abc"));
        assert!(head.is_keep_alive);
        assert_eq!(head.content_length, None);
    }

    #[tokio::test]
    async fn test_reads_chunked_body() {
        let raw = b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n".to_vec();
        let mut cursor = Cursor::new(raw);
        let head = RequestHead {
            method: "POST".into(),
            path: "/".into(),
            query: HashMap::new(),
            headers: HashMap::new(),
            content_length: None,
            is_chunked: true,
            is_keep_alive: true,
        };
        let body = read_body(&mut cursor, &head).await.unwrap();
        assert_eq!(body, b"hello world");
    }

    #[tokio::test]
    async fn test_content_length_overflow_is_rejected() {
        let mut out = Vec::new();
        let mut writer = ResponseWriter::new(&mut out);
        writer.write_head(200, "OK", "text/plain", Some(2), &[]).await.unwrap();
        assert!(writer.write_body(b"abc").await.is_err());
    }

    #[tokio::test]
    async fn test_chunked_write_frames_each_call() {
        let mut out = Vec::new();
        let mut writer = ResponseWriter::new(&mut out);
        writer.write_head(200, "OK", "video/x-flv", None, &[]).await.unwrap();
        writer.write_body(b"abc").await.unwrap();
        writer.finish().await.unwrap();
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("Transfer-Encoding: chunked"));
        assert!(text.contains("3\r\nabc\r\n"));
        assert!(text.ends_with("0\r\n\r\n"));
    }

    #[test]
    fn test_sniff_content_type() {
        assert_eq!(sniff_content_type(b"FLV\x01"), "video/x-flv");
        assert_eq!(sniff_content_type(&[0x47, 0, 0]), "video/MP2T");
    }
}
