//! Frame forwarding between a UI connection and an extension host socket.
//!
//! The host side of a session is one Unix stream accepted at `sockpath`. It
//! outlives any single UI connection: while no UI is attached its halves rest
//! in [`HostEndpoint::idle`]; while one is attached they are owned by the
//! relay task and handed back when the task ends. The host frame reader moves
//! along with them so a frame that was half read when a relay stopped is
//! finished by the next one.

use exthost_protocol::{FrameReader, FrameWriter};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub(crate) type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Framed halves of the extension host connection.
pub(crate) type HostHalves = (FrameReader<BoxedRead>, FrameWriter<BoxedWrite>);

/// Extension-host side of a session.
#[derive(Default)]
pub(crate) struct HostEndpoint {
	/// Halves not currently owned by a relay.
	pub(crate) idle: Option<HostHalves>,
	pub(crate) link: Option<ActiveLink>,
}

impl HostEndpoint {
	/// Takes the host halves back, stopping the current relay if one runs.
	///
	/// Returns `None` if the process never connected or the relay task was
	/// aborted.
	pub(crate) async fn reclaim(&mut self) -> Option<HostHalves> {
		if let Some(link) = self.link.take() {
			let _ = link.stop.send(true);
			return match link.task.await {
				Ok(halves) => Some(halves),
				Err(err) => {
					debug!(target = "exthost.bridge", error = %err, "relay task did not return host halves");
					None
				}
			};
		}
		self.idle.take()
	}

	/// Drops both halves and aborts the relay without waiting for it.
	pub(crate) fn close(&mut self) {
		self.idle.take();
		if let Some(link) = self.link.take() {
			let _ = link.stop.send(true);
			link.task.abort();
		}
	}
}

/// A running relay between one UI connection and the host socket.
pub(crate) struct ActiveLink {
	pub(crate) stop: watch::Sender<bool>,
	pub(crate) task: JoinHandle<HostHalves>,
}

/// Why a relay stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkEnd {
	/// The UI connection closed or failed.
	MainClosed,
	/// The extension host connection closed or failed.
	HostClosed,
	/// A newer UI connection or teardown took the host halves back.
	Stopped,
}

/// Copies frames verbatim in both directions until one side closes or `stop`
/// flips to true.
///
/// Frame order is preserved per direction. Nothing is ordered across
/// directions. The host side only ever stops on a frame boundary: reads are
/// resumable and a frame being written to the host is always finished. A
/// host frame still being written to a UI that is being replaced is dropped.
pub(crate) async fn relay<MR, MW, HR, HW>(
	main_reader: &mut FrameReader<MR>,
	main_writer: &mut FrameWriter<MW>,
	host_reader: &mut FrameReader<HR>,
	host_writer: &mut FrameWriter<HW>,
	stop: &mut watch::Receiver<bool>,
) -> LinkEnd
where
	MR: AsyncRead + Unpin,
	MW: AsyncWrite + Unpin,
	HR: AsyncRead + Unpin,
	HW: AsyncWrite + Unpin,
{
	let mut upstream = 0u64;
	let mut downstream = 0u64;
	loop {
		tokio::select! {
			biased;
			_ = async { let _ = stop.wait_for(|stopped| *stopped).await; } => return LinkEnd::Stopped,
			read = main_reader.read_frame() => match read {
				Ok(Some(frame)) => {
					if let Err(err) = host_writer.write_frame(&frame).await {
						debug!(target = "exthost.bridge", error = %err, frames = upstream, "host write failed");
						return LinkEnd::HostClosed;
					}
					upstream += 1;
				}
				Ok(None) => {
					debug!(target = "exthost.bridge", frames = upstream, "ui connection closed");
					return LinkEnd::MainClosed;
				}
				Err(err) => {
					warn!(target = "exthost.bridge", error = %err, frames = upstream, "ui frame error");
					return LinkEnd::MainClosed;
				}
			},
			read = host_reader.read_frame() => match read {
				Ok(Some(frame)) => {
					tokio::select! {
						biased;
						_ = stop.wait_for(|stopped| *stopped) => {
							debug!(target = "exthost.bridge", len = frame.len(), "dropping host frame for replaced ui");
							return LinkEnd::Stopped;
						}
						written = main_writer.write_frame(&frame) => {
							if let Err(err) = written {
								debug!(target = "exthost.bridge", error = %err, frames = downstream, "ui write failed");
								return LinkEnd::MainClosed;
							}
						}
					}
					downstream += 1;
				}
				Ok(None) => {
					debug!(target = "exthost.bridge", frames = downstream, "host connection closed");
					return LinkEnd::HostClosed;
				}
				Err(err) => {
					warn!(target = "exthost.bridge", error = %err, frames = downstream, "host frame error");
					return LinkEnd::HostClosed;
				}
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf, duplex, split};

	use super::*;

	struct Peer {
		reader: FrameReader<ReadHalf<DuplexStream>>,
		writer: FrameWriter<WriteHalf<DuplexStream>>,
	}

	fn pair() -> (Peer, FrameReader<ReadHalf<DuplexStream>>, FrameWriter<WriteHalf<DuplexStream>>) {
		let (near, far) = duplex(4096);
		let (far_read, far_write) = split(far);
		let (near_read, near_write) = split(near);
		(
			Peer {
				reader: FrameReader::new(far_read),
				writer: FrameWriter::new(far_write),
			},
			FrameReader::new(near_read),
			FrameWriter::new(near_write),
		)
	}

	#[tokio::test]
	async fn forwards_both_directions_in_order() {
		let (mut ui, mut main_reader, mut main_writer) = pair();
		let (mut host, mut host_reader, mut host_writer) = pair();
		let (_stop_tx, mut stop_rx) = watch::channel(false);

		let relay = tokio::spawn(async move {
			relay(
				&mut main_reader,
				&mut main_writer,
				&mut host_reader,
				&mut host_writer,
				&mut stop_rx,
			)
			.await
		});

		for payload in [b"one".as_slice(), b"two", b"three"] {
			ui.writer.write_frame(payload).await.unwrap();
		}
		for expected in [b"one".as_slice(), b"two", b"three"] {
			assert_eq!(host.reader.read_frame().await.unwrap().unwrap(), expected);
		}

		host.writer.write_frame(b"reply").await.unwrap();
		assert_eq!(ui.reader.read_frame().await.unwrap().unwrap(), b"reply");

		drop(ui);
		let end = tokio::time::timeout(Duration::from_secs(1), relay)
			.await
			.unwrap()
			.unwrap();
		assert_eq!(end, LinkEnd::MainClosed);
	}

	#[tokio::test]
	async fn stop_hands_the_host_side_back() {
		let (_ui, mut main_reader, mut main_writer) = pair();
		let (mut host, mut host_reader, mut host_writer) = pair();
		let (stop_tx, mut stop_rx) = watch::channel(false);

		let relay = tokio::spawn(async move {
			let end = relay(
				&mut main_reader,
				&mut main_writer,
				&mut host_reader,
				&mut host_writer,
				&mut stop_rx,
			)
			.await;
			(end, host_reader, host_writer)
		});

		stop_tx.send(true).unwrap();
		let (end, mut host_reader, mut host_writer) = tokio::time::timeout(Duration::from_secs(1), relay)
			.await
			.unwrap()
			.unwrap();
		assert_eq!(end, LinkEnd::Stopped);

		// The host connection is still usable after the relay stopped.
		host.writer.write_frame(b"later").await.unwrap();
		assert_eq!(host_reader.read_frame().await.unwrap().unwrap(), b"later");
		host_writer.write_frame(b"back").await.unwrap();
		assert_eq!(host.reader.read_frame().await.unwrap().unwrap(), b"back");
	}

	#[tokio::test]
	async fn host_close_ends_the_relay() {
		let (_ui, mut main_reader, mut main_writer) = pair();
		let (host, mut host_reader, mut host_writer) = pair();
		let (_stop_tx, mut stop_rx) = watch::channel(false);

		drop(host);
		let end = tokio::time::timeout(
			Duration::from_secs(1),
			relay(
				&mut main_reader,
				&mut main_writer,
				&mut host_reader,
				&mut host_writer,
				&mut stop_rx,
			),
		)
		.await
		.unwrap();
		assert_eq!(end, LinkEnd::HostClosed);
	}

	#[tokio::test]
	async fn stop_mid_frame_keeps_the_host_stream_in_sync() {
		let (_ui, mut main_reader, mut main_writer) = pair();
		let (host_far, host_near) = duplex(4096);
		let (_host_far_read, mut host_far_write) = split(host_far);
		let (near_read, near_write) = split(host_near);
		let mut host_reader = FrameReader::new(near_read);
		let mut host_writer = FrameWriter::new(near_write);
		let (stop_tx, mut stop_rx) = watch::channel(false);

		host_far_write.write_all(&8u32.to_le_bytes()).await.unwrap();
		host_far_write.write_all(b"ABCD").await.unwrap();

		let relay = tokio::spawn(async move {
			let end = relay(
				&mut main_reader,
				&mut main_writer,
				&mut host_reader,
				&mut host_writer,
				&mut stop_rx,
			)
			.await;
			(end, host_reader)
		});
		tokio::time::sleep(Duration::from_millis(20)).await;
		stop_tx.send(true).unwrap();
		let (end, mut host_reader) = tokio::time::timeout(Duration::from_secs(1), relay)
			.await
			.unwrap()
			.unwrap();
		assert_eq!(end, LinkEnd::Stopped);

		host_far_write.write_all(b"EFGH").await.unwrap();
		let mut frames = FrameWriter::new(host_far_write);
		frames.write_frame(b"next").await.unwrap();
		assert_eq!(host_reader.read_frame().await.unwrap().unwrap(), b"ABCDEFGH");
		assert_eq!(host_reader.read_frame().await.unwrap().unwrap(), b"next");
	}

	#[tokio::test]
	async fn reclaim_returns_idle_halves() {
		let (a, _b) = duplex(64);
		let (read, write) = split(a);
		let mut endpoint = HostEndpoint {
			idle: Some((
				FrameReader::new(Box::new(read) as BoxedRead),
				FrameWriter::new(Box::new(write) as BoxedWrite),
			)),
			link: None,
		};
		assert!(endpoint.reclaim().await.is_some());
		assert!(endpoint.reclaim().await.is_none());
	}
}
