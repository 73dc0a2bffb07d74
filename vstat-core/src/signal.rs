use tokio::sync::{mpsc, watch};

/// Root cancellation for the whole process. Every long-running task holds a
/// [`ShutdownToken`] and exits when it fires; [`Shutdown::wait`] completes on
/// SIGINT, SIGTERM, or an explicit [`ShutdownTrigger`].
pub struct Shutdown {
	cancel_tx: watch::Sender<bool>,
	trigger_tx: mpsc::Sender<()>,
	trigger_rx: mpsc::Receiver<()>,
}

impl Shutdown {
	pub fn new() -> Self {
		let (cancel_tx, _) = watch::channel(false);
		let (trigger_tx, trigger_rx) = mpsc::channel(1);
		Shutdown {
			cancel_tx,
			trigger_tx,
			trigger_rx,
		}
	}

	pub fn token(&self) -> ShutdownToken {
		ShutdownToken {
			rx: self.cancel_tx.subscribe(),
		}
	}

	/// Trigger returns a handle that can request shutdown without a signal.
	pub fn trigger(&self) -> ShutdownTrigger {
		ShutdownTrigger {
			tx: self.trigger_tx.clone(),
		}
	}

	/// Wait blocks until a termination signal (or explicit trigger) arrives,
	/// then cancels every outstanding token.
	pub async fn wait(mut self) {
		imp::wait(&mut self.trigger_rx).await;
		let _ = self.cancel_tx.send(true);
	}
}

impl Default for Shutdown {
	fn default() -> Self {
		Self::new()
	}
}

#[derive(Clone, Debug)]
pub struct ShutdownTrigger {
	tx: mpsc::Sender<()>,
}

impl ShutdownTrigger {
	pub async fn shutdown_now(&self) {
		let _ = self.tx.send(()).await;
	}
}

#[derive(Clone, Debug)]
pub struct ShutdownToken {
	rx: watch::Receiver<bool>,
}

impl ShutdownToken {
	/// Completes once shutdown has been requested.
	pub async fn cancelled(&mut self) {
		// An error means the Shutdown owner is gone, which counts as cancelled.
		let _ = self.rx.wait_for(|cancelled| *cancelled).await;
	}

	pub fn is_cancelled(&self) -> bool {
		*self.rx.borrow()
	}
}

#[cfg(unix)]
mod imp {
	use tokio::signal::unix::{SignalKind, signal};
	use tokio::sync::mpsc::Receiver;
	use tracing::info;

	pub(super) async fn wait(trigger: &mut Receiver<()>) {
		tokio::select! {
			_ = watch_signal(SignalKind::interrupt(), "SIGINT") => {}
			_ = watch_signal(SignalKind::terminate(), "SIGTERM") => {}
			_ = trigger.recv() => { info!("received explicit shutdown request") }
		};
	}

	async fn watch_signal(kind: SignalKind, name: &'static str) {
		signal(kind)
			.expect("failed to register signal handler")
			.recv()
			.await;
		info!("received {name}, starting shutdown");
	}
}

#[cfg(not(unix))]
mod imp {
	use tokio::sync::mpsc::Receiver;
	use tracing::info;

	pub(super) async fn wait(trigger: &mut Receiver<()>) {
		tokio::select! {
			_ = watch_signal() => {}
			_ = trigger.recv() => { info!("received explicit shutdown request") }
		};
	}

	async fn watch_signal() {
		tokio::signal::ctrl_c()
			.await
			.expect("failed to register signal handler");
		info!("received interrupt, starting shutdown");
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn explicit_trigger_cancels_tokens() {
		let shutdown = Shutdown::new();
		let mut token = shutdown.token();
		let trigger = shutdown.trigger();
		assert!(!token.is_cancelled());

		let waiter = tokio::spawn(shutdown.wait());
		trigger.shutdown_now().await;
		waiter.await.unwrap();
		token.cancelled().await;
		assert!(token.is_cancelled());
	}
}
