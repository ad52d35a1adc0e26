//! Envelope framing over a byte stream.
//!
//! Handshake messages are bare JSON objects written back to back; the
//! decoder buffers bytes until one complete object is available and keeps
//! any remainder for the next call. Request payloads are framed by the
//! `size` announced in the preceding RTS and read to exactly that length.
//!
//! Format:
//! ```text
//! {rts envelope, size = N} -> {cts envelope} <- [N bytes: request envelope] -> {response envelope} <-
//! ```

use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use crate::error::{AlertrResult, ProtocolError, TransportError};

use super::envelope::Envelope;

/// Upper bound for buffered handshake bytes and announced payload sizes.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

const READ_CHUNK: usize = 4096;

/// Serializes an envelope to its wire bytes.
pub fn encode(envelope: &Envelope) -> AlertrResult<Vec<u8>> {
    Ok(serde_json::to_vec(envelope)?)
}

/// Writes wire bytes and flushes.
pub fn write_frame<W: Write + ?Sized>(writer: &mut W, bytes: &[u8]) -> AlertrResult<()> {
    writer
        .write_all(bytes)
        .and_then(|()| writer.flush())
        .map_err(|e| TransportError::io("write", e).into())
}

enum Fill {
    Data,
    TimedOut,
}

/// Incremental envelope decoder holding bytes not consumed yet.
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: Vec<u8>,
}

impl FrameReader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of buffered, not yet decoded bytes.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Returns the next envelope, reading from `reader` as needed.
    ///
    /// Returns `Ok(None)` when the reader's timeout expires before a complete
    /// envelope arrived; partial bytes stay buffered.
    pub fn poll_envelope<R: Read + ?Sized>(&mut self, reader: &mut R) -> AlertrResult<Option<Envelope>> {
        loop {
            if let Some(envelope) = self.decode_buffered()? {
                return Ok(Some(envelope));
            }
            match self.fill(reader)? {
                Fill::Data => {}
                Fill::TimedOut => return Ok(None),
            }
        }
    }

    /// Like [`Self::poll_envelope`], but keeps polling until `deadline`.
    pub fn read_envelope_until<R: Read + ?Sized>(
        &mut self,
        reader: &mut R,
        deadline: Instant,
        context: &'static str,
        timeout: Duration,
    ) -> AlertrResult<Envelope> {
        loop {
            if let Some(envelope) = self.poll_envelope(reader)? {
                return Ok(envelope);
            }
            if Instant::now() >= deadline {
                return Err(timed_out(context, timeout));
            }
        }
    }

    /// Reads a payload of exactly `size` bytes and decodes it.
    ///
    /// Bytes already buffered count towards `size`.
    pub fn read_sized<R: Read + ?Sized>(
        &mut self,
        reader: &mut R,
        size: usize,
        deadline: Instant,
        timeout: Duration,
    ) -> AlertrResult<Envelope> {
        if size > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size,
                max: MAX_FRAME_SIZE,
            }
            .into());
        }

        while self.buf.len() < size {
            if let Fill::TimedOut = self.fill(reader)? {
                if Instant::now() >= deadline {
                    return Err(timed_out("payload", timeout));
                }
            }
        }

        let frame: Vec<u8> = self.buf.drain(..size).collect();
        serde_json::from_slice(&frame).map_err(|e| {
            ProtocolError::MalformedEnvelope {
                reason: format!("payload of {size} bytes: {e}"),
            }
            .into()
        })
    }

    fn decode_buffered(&mut self) -> AlertrResult<Option<Envelope>> {
        let (next, consumed) = {
            let mut stream = serde_json::Deserializer::from_slice(&self.buf).into_iter::<Envelope>();
            let next = stream.next();
            (next, stream.byte_offset())
        };

        match next {
            None => {
                // Only whitespace left.
                self.buf.clear();
                Ok(None)
            }
            Some(Ok(envelope)) => {
                self.buf.drain(..consumed);
                Ok(Some(envelope))
            }
            Some(Err(e)) if e.is_eof() => Ok(None),
            Some(Err(e)) => Err(ProtocolError::MalformedEnvelope { reason: e.to_string() }.into()),
        }
    }

    fn fill<R: Read + ?Sized>(&mut self, reader: &mut R) -> AlertrResult<Fill> {
        if self.buf.len() >= MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: self.buf.len(),
                max: MAX_FRAME_SIZE,
            }
            .into());
        }

        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match reader.read(&mut chunk) {
                Ok(0) => return Err(ProtocolError::Closed.into()),
                Ok(n) => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    return Ok(Fill::Data);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Ok(Fill::TimedOut);
                }
                Err(e) => return Err(TransportError::io("read", e).into()),
            }
        }
    }
}

fn timed_out(context: &'static str, timeout: Duration) -> crate::error::AlertrError {
    TransportError::Timeout {
        context,
        duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
    }
    .into()
}
