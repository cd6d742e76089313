use tokio::sync::mpsc;

use crate::error::ErrorKind;

/// Notifications emitted by the sync layer for whoever drives the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
  /// A debounced write reached the server
  Flushed { key: String },
  /// A debounced write failed after retries; local state was rolled back
  FlushFailed {
    key: String,
    kind: ErrorKind,
    message: String,
  },
  /// The prober observed a reachability change
  ConnectivityChanged { reachable: bool },
  /// The server rejected the stored token and it was cleared
  SessionExpired,
}

pub type EventSender = mpsc::UnboundedSender<SyncEvent>;

/// Emit an event, ignoring a dropped receiver.
pub(crate) fn emit(events: &Option<EventSender>, event: SyncEvent) {
  if let Some(tx) = events {
    let _ = tx.send(event);
  }
}

/// Owns the receiving end of the sync event channel.
pub struct EventHandler {
  tx: EventSender,
  rx: mpsc::UnboundedReceiver<SyncEvent>,
}

impl EventHandler {
  pub fn new() -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    Self { tx, rx }
  }

  pub fn sender(&self) -> EventSender {
    self.tx.clone()
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<SyncEvent> {
    self.rx.recv().await
  }

  /// Receive an event if one is already queued.
  pub fn try_next(&mut self) -> Option<SyncEvent> {
    self.rx.try_recv().ok()
  }
}

impl Default for EventHandler {
  fn default() -> Self {
    Self::new()
  }
}
