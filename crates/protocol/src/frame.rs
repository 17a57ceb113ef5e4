//! Length-prefixed framing for bridge endpoints.
//!
//! Each frame is a 4-byte little-endian length followed by that many payload
//! bytes. Payloads are opaque to the bridge; the UI-side opening exchange and
//! the host RPC happen to be JSON, which [`FrameReader::read_json`] and
//! [`FrameWriter::write_json`] cover.
//!
//! A [`FrameReader`] keeps the bytes of a partly received frame between
//! calls, so the reader itself (not the stream under it) is what moves from
//! one owner to the next.

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest payload accepted on either endpoint (64 MiB).
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
	#[error("Failed to read length prefix: stream ended after {0} of 4 bytes")]
	TruncatedPrefix(usize),

	#[error("Failed to read frame body: expected {expected} bytes")]
	TruncatedBody { expected: usize },

	#[error("Frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
	TooLarge(usize),

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("JSON error: {0}")]
	Json(#[from] serde_json::Error),
}

const PREFIX_LEN: usize = 4;

/// Reads length-prefixed frames from `R`.
#[derive(Debug)]
pub struct FrameReader<R> {
	inner: R,
	buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
	pub fn new(inner: R) -> Self {
		Self { inner, buf: Vec::new() }
	}

	/// Reads the next frame, returning `None` on a clean end of stream.
	///
	/// Cancel-safe: bytes of a frame that has not fully arrived stay in the
	/// reader and the next call picks up where this one stopped.
	pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
		loop {
			if let Some(frame) = self.take_frame()? {
				return Ok(Some(frame));
			}
			let wanted = match self.pending_len() {
				Some(length) => PREFIX_LEN + length - self.buf.len(),
				None => PREFIX_LEN - self.buf.len(),
			};
			self.buf.reserve(wanted);
			if self.inner.read_buf(&mut self.buf).await? == 0 {
				return match (self.buf.len(), self.pending_len()) {
					(0, _) => Ok(None),
					(_, Some(expected)) => Err(FrameError::TruncatedBody { expected }),
					(filled, None) => Err(FrameError::TruncatedPrefix(filled)),
				};
			}
		}
	}

	/// Reads one frame and decodes it as JSON.
	pub async fn read_json<T: DeserializeOwned>(&mut self) -> Result<Option<T>, FrameError> {
		match self.read_frame().await? {
			Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
			None => Ok(None),
		}
	}

	/// Length announced by a fully buffered prefix.
	fn pending_len(&self) -> Option<usize> {
		let prefix: [u8; PREFIX_LEN] = self.buf.get(..PREFIX_LEN)?.try_into().ok()?;
		Some(u32::from_le_bytes(prefix) as usize)
	}

	/// Splits a complete frame off the front of the buffer.
	fn take_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
		let Some(length) = self.pending_len() else {
			return Ok(None);
		};
		if length > MAX_FRAME_LEN {
			return Err(FrameError::TooLarge(length));
		}
		if self.buf.len() < PREFIX_LEN + length {
			return Ok(None);
		}
		let rest = self.buf.split_off(PREFIX_LEN + length);
		let mut frame = std::mem::replace(&mut self.buf, rest);
		frame.drain(..PREFIX_LEN);
		Ok(Some(frame))
	}
}

/// Writes length-prefixed frames to `W`.
#[derive(Debug)]
pub struct FrameWriter<W> {
	inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
	pub fn new(inner: W) -> Self {
		Self { inner }
	}

	/// Writes one frame and flushes it.
	///
	/// Not cancel-safe: dropping the future may leave part of a frame on the
	/// stream.
	pub async fn write_frame(&mut self, payload: &[u8]) -> Result<(), FrameError> {
		if payload.len() > MAX_FRAME_LEN {
			return Err(FrameError::TooLarge(payload.len()));
		}
		let length = payload.len() as u32;
		self.inner.write_all(&length.to_le_bytes()).await?;
		self.inner.write_all(payload).await?;
		self.inner.flush().await?;
		Ok(())
	}

	/// Serializes `value` as JSON and writes it as one frame.
	pub async fn write_json<T: Serialize>(&mut self, value: &T) -> Result<(), FrameError> {
		let bytes = serde_json::to_vec(value)?;
		self.write_frame(&bytes).await
	}

	pub async fn shutdown(&mut self) -> Result<(), FrameError> {
		self.inner.shutdown().await?;
		Ok(())
	}
}
