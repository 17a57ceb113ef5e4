//! Out-of-band control messages between the supervisor and a host process.
//!
//! The control channel is separate from the RPC bridge. It carries the
//! handshake signals as bare JSON strings (`"ready"`, `"finish"`, `"close"`)
//! and structured reporter payloads (`{"type":"reporter","data":{...}}`),
//! one JSON value per line.

use std::io;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Handshake signal exchanged on the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlSignal {
	/// Host -> supervisor: the host finished booting and is serving RPC.
	Ready,
	/// Host -> supervisor: the host finished its shutdown work.
	Finish,
	/// Supervisor -> host: begin shutdown.
	Close,
}

/// Structured payload forwarded to the reporting sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ReporterMessage {
	Reporter {
		#[serde(default)]
		data: Value,
	},
}

/// Any message that may appear on the control channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ControlMessage {
	Signal(ControlSignal),
	Reporter(ReporterMessage),
}

impl ControlMessage {
	pub const READY: Self = Self::Signal(ControlSignal::Ready);
	pub const FINISH: Self = Self::Signal(ControlSignal::Finish);
	pub const CLOSE: Self = Self::Signal(ControlSignal::Close);

	/// Builds a reporter message carrying `data`.
	pub fn reporter(data: Value) -> Self {
		Self::Reporter(ReporterMessage::Reporter { data })
	}

	/// Returns the handshake signal, if this is one.
	pub fn signal(&self) -> Option<ControlSignal> {
		match self {
			Self::Signal(signal) => Some(*signal),
			Self::Reporter(_) => None,
		}
	}

	/// Encodes the message as a single line (without the trailing newline).
	pub fn to_line(&self) -> serde_json::Result<String> {
		serde_json::to_string(self)
	}

	/// Decodes one line of the control channel.
	pub fn from_line(line: &str) -> serde_json::Result<Self> {
		serde_json::from_str(line.trim_end())
	}
}

/// Writes one control message followed by a newline.
pub async fn write_control<W>(writer: &mut W, message: &ControlMessage) -> io::Result<()>
where
	W: AsyncWrite + Unpin,
{
	let mut line = message.to_line().map_err(io::Error::other)?;
	line.push('\n');
	writer.write_all(line.as_bytes()).await?;
	writer.flush().await
}

/// Reads the next control message, skipping blank lines.
///
/// Returns `None` at end of stream; a malformed line is an
/// [`io::ErrorKind::InvalidData`] error.
pub async fn read_control<R>(reader: &mut R) -> io::Result<Option<ControlMessage>>
where
	R: AsyncBufRead + Unpin,
{
	let mut line = String::new();
	loop {
		line.clear();
		if reader.read_line(&mut line).await? == 0 {
			return Ok(None);
		}
		if line.trim().is_empty() {
			continue;
		}
		return ControlMessage::from_line(&line)
			.map(Some)
			.map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err));
	}
}
