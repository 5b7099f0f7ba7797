//! JSON-RPC framing codec for LSP communication.
//!
//! LSP uses `Content-Length: N\r\n\r\n{json}` framing over stdin/stdout.
//! This module provides [`FrameReader`] and [`FrameWriter`] for async
//! reading and writing of framed JSON-RPC messages.
//!
//! A malformed header or body yields a [`FrameError::Malformed`] for that
//! message only. The reader then resynchronizes by discarding input until the
//! next valid `Content-Length` header, so one corrupt message never
//! terminates the decode loop.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Maximum frame size (4 MiB) to prevent unbounded memory allocation.
const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Error reading a single frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Malformed header or body. Recoverable: the next `read_frame` call
    /// resynchronizes and continues.
    #[error("malformed frame: {0}")]
    Malformed(String),
    /// Underlying stream failure. Not recoverable.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FrameError {
    /// Whether the decode loop may continue after this error.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Malformed(_))
    }
}

/// Classify a non-empty header line.
enum HeaderLine {
    ContentLength(usize),
    Other,
    Garbage,
}

fn classify_header(trimmed: &str) -> Result<HeaderLine, FrameError> {
    let Some(colon_pos) = trimmed.find(':') else {
        return Ok(HeaderLine::Garbage);
    };
    let key = &trimmed[..colon_pos];
    // LSP spec uses "Content-Length" but parse case-insensitively for robustness.
    if key.eq_ignore_ascii_case("Content-Length") {
        let len: usize = trimmed[colon_pos + 1..].trim().parse().map_err(|_| {
            FrameError::Malformed(format!("invalid Content-Length value: '{trimmed}'"))
        })?;
        Ok(HeaderLine::ContentLength(len))
    } else {
        // Ignore other headers (e.g. Content-Type)
        Ok(HeaderLine::Other)
    }
}

/// Reads JSON-RPC frames from an async reader.
///
/// Parses `Content-Length` headers, reads exactly that many bytes, then
/// deserializes the body as JSON. After a malformed frame the reader enters
/// resync mode and skips input until the next valid `Content-Length` line.
pub struct FrameReader<R> {
    reader: BufReader<R>,
    resyncing: bool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            resyncing: false,
        }
    }

    /// Read the next JSON-RPC frame.
    ///
    /// Returns `Ok(None)` on EOF (clean shutdown).
    /// Returns [`FrameError::Malformed`] for a corrupt message; calling again
    /// resumes at the next valid header.
    pub async fn read_frame(&mut self) -> Result<Option<serde_json::Value>, FrameError> {
        let content_length = match self.read_headers().await? {
            Some(len) => len,
            None => return Ok(None), // EOF
        };

        if content_length > MAX_FRAME_BYTES {
            // Body bytes are not consumed; resync will discard them.
            self.resyncing = true;
            return Err(FrameError::Malformed(format!(
                "Content-Length {content_length} exceeds maximum {MAX_FRAME_BYTES}"
            )));
        }

        let mut body = vec![0u8; content_length];
        self.reader.read_exact(&mut body).await?;

        // The stream is still aligned after a JSON parse failure, so no
        // resync is needed for this case.
        let value = serde_json::from_slice(&body)
            .map_err(|e| FrameError::Malformed(format!("invalid JSON body: {e}")))?;
        Ok(Some(value))
    }

    /// Parse headers until the empty line separator.
    ///
    /// Returns the `Content-Length` value, or `None` on EOF. In resync mode,
    /// lines are discarded until a valid `Content-Length` header appears.
    async fn read_headers(&mut self) -> Result<Option<usize>, FrameError> {
        let mut content_length: Option<usize> = None;
        let mut line = String::new();
        let mut saw_any_header_bytes = false;

        loop {
            line.clear();
            let bytes_read = self.reader.read_line(&mut line).await?;

            if bytes_read == 0 {
                // EOF — clean only if we haven't started a frame in this call.
                if !saw_any_header_bytes {
                    return Ok(None);
                }
                return Err(FrameError::Malformed(
                    "unexpected EOF while reading headers".to_string(),
                ));
            }
            saw_any_header_bytes = true;

            let trimmed = line.trim();

            if self.resyncing {
                // Discard everything until the next valid Content-Length.
                if let Ok(HeaderLine::ContentLength(len)) = classify_header(trimmed) {
                    self.resyncing = false;
                    content_length = Some(len);
                }
                continue;
            }

            if trimmed.is_empty() {
                // Empty line = end of headers
                match content_length {
                    Some(len) => return Ok(Some(len)),
                    None => {
                        self.resyncing = true;
                        return Err(FrameError::Malformed(
                            "missing Content-Length header".to_string(),
                        ));
                    }
                }
            }

            match classify_header(trimmed) {
                Ok(HeaderLine::ContentLength(len)) => content_length = Some(len),
                Ok(HeaderLine::Other) => {}
                Ok(HeaderLine::Garbage) => {
                    self.resyncing = true;
                    return Err(FrameError::Malformed(format!(
                        "unparseable header line: '{trimmed}'"
                    )));
                }
                Err(e) => {
                    self.resyncing = true;
                    return Err(e);
                }
            }
        }
    }
}

/// Writes JSON-RPC frames to an async writer.
///
/// Serializes JSON and prepends the `Content-Length` header.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write a JSON-RPC frame with `Content-Length` header.
    pub async fn write_frame(&mut self, msg: &serde_json::Value) -> Result<(), FrameError> {
        let body = serde_json::to_string(msg)
            .map_err(|e| FrameError::Malformed(format!("unserializable frame: {e}")))?;
        let header = format!("Content-Length: {}\r\n\r\n", body.len());

        self.writer.write_all(header.as_bytes()).await?;
        self.writer.write_all(body.as_bytes()).await?;
        self.writer.flush().await?;

        Ok(())
    }
}
