//! Two-state signal used for the handshake.
//!
//! A [`Gate`] starts closed and can be opened exactly once; every waiter,
//! including ones that arrive after it opened, is released.

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct Gate {
	tx: Arc<watch::Sender<bool>>,
}

impl Default for Gate {
	fn default() -> Self {
		Self::new()
	}
}

impl Gate {
	pub fn new() -> Self {
		let (tx, _) = watch::channel(false);
		Self { tx: Arc::new(tx) }
	}

	/// Opens the gate. Returns false if it was already open.
	pub fn open(&self) -> bool {
		!self.tx.send_replace(true)
	}

	pub fn is_open(&self) -> bool {
		*self.tx.borrow()
	}

	/// Waits until the gate is open.
	pub async fn wait(&self) {
		let mut rx = self.tx.subscribe();
		// The sender lives as long as `self`, so this cannot observe a closed channel.
		let _ = rx.wait_for(|open| *open).await;
	}
}
