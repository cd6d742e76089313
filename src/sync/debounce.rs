//! Debounced, last-write-wins persistence per document key.
//!
//! Each key moves through `Idle -> Scheduled -> Flushing -> Idle`. Scheduling
//! again while `Scheduled` restarts the quiet period; scheduling while
//! `Flushing` queues a new write that goes out once the in-flight flush has
//! finished. There is never more than one flush in flight per key.

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::error::Result;
use crate::event::{emit, EventSender, SyncEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
  Idle,
  Scheduled,
  Flushing,
}

/// The live write for one key. Superseded writes are simply replaced.
#[derive(Debug, Clone)]
pub struct PendingWrite<P> {
  pub payload: P,
  pub scheduled_at: Instant,
  /// When the quiet period for this write ends
  pub fire_at: Instant,
  pub generation: u64,
}

struct Slot<P> {
  pending: Option<PendingWrite<P>>,
  generation: u64,
  flushing: bool,
  timer: Option<JoinHandle<()>>,
}

impl<P> Default for Slot<P> {
  fn default() -> Self {
    Self {
      pending: None,
      generation: 0,
      flushing: false,
      timer: None,
    }
  }
}

type FlushFn<P> = Arc<dyn Fn(String, P) -> BoxFuture<'static, Result<()>> + Send + Sync>;

struct Shared<P> {
  slots: Mutex<HashMap<String, Slot<P>>>,
  flush: FlushFn<P>,
  events: Option<EventSender>,
}

impl<P> Shared<P> {
  fn lock(&self) -> MutexGuard<'_, HashMap<String, Slot<P>>> {
    self.slots.lock().unwrap_or_else(|e| e.into_inner())
  }
}

/// Coalesces rapid writes into one delayed flush per key.
pub struct DebouncedWriter<P> {
  shared: Arc<Shared<P>>,
  delay: Duration,
}

impl<P> Clone for DebouncedWriter<P> {
  fn clone(&self) -> Self {
    Self {
      shared: Arc::clone(&self.shared),
      delay: self.delay,
    }
  }
}

impl<P: Send + 'static> DebouncedWriter<P> {
  /// `flush` receives the document key and the latest payload.
  pub fn new<F, Fut>(delay: Duration, flush: F) -> Self
  where
    F: Fn(String, P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
  {
    Self::build(delay, flush, None)
  }

  /// Like [`new`](Self::new), reporting every flush outcome on `events`.
  pub fn with_events<F, Fut>(delay: Duration, events: EventSender, flush: F) -> Self
  where
    F: Fn(String, P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
  {
    Self::build(delay, flush, Some(events))
  }

  fn build<F, Fut>(delay: Duration, flush: F, events: Option<EventSender>) -> Self
  where
    F: Fn(String, P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
  {
    let flush: FlushFn<P> = Arc::new(move |key, payload| Box::pin(flush(key, payload)));
    Self {
      shared: Arc::new(Shared {
        slots: Mutex::new(HashMap::new()),
        flush,
        events,
      }),
      delay,
    }
  }

  pub fn delay(&self) -> Duration {
    self.delay
  }

  /// Schedule `payload` for `key` after the default quiet period.
  pub fn schedule(&self, key: impl Into<String>, payload: P) {
    self.schedule_after(key, payload, self.delay);
  }

  /// Replace any pending write for `key` and restart its timer.
  pub fn schedule_after(&self, key: impl Into<String>, payload: P, delay: Duration) {
    let key = key.into();
    let now = Instant::now();
    let mut slots = self.shared.lock();
    let slot = slots.entry(key.clone()).or_default();

    slot.generation += 1;
    let generation = slot.generation;
    slot.pending = Some(PendingWrite {
      payload,
      scheduled_at: now,
      fire_at: now + delay,
      generation,
    });

    if let Some(timer) = slot.timer.take() {
      timer.abort();
    }

    let shared = Arc::clone(&self.shared);
    let timer_key = key.clone();
    slot.timer = Some(tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      fire(shared, timer_key, generation).await;
    }));

    debug!(key = %key, generation, delay_ms = delay.as_millis() as u64, "write scheduled");
  }

  pub fn state(&self, key: &str) -> WriterState {
    let slots = self.shared.lock();
    match slots.get(key) {
      Some(slot) if slot.flushing => WriterState::Flushing,
      Some(slot) if slot.pending.is_some() => WriterState::Scheduled,
      _ => WriterState::Idle,
    }
  }

  /// Drop the pending write for `key` without sending it.
  pub fn cancel(&self, key: &str) -> Option<P> {
    let mut slots = self.shared.lock();
    let slot = slots.get_mut(key)?;
    if let Some(timer) = slot.timer.take() {
      timer.abort();
    }
    slot.pending.take().map(|p| p.payload)
  }

  /// Send the pending write for `key` now instead of waiting out the timer.
  ///
  /// If a flush is already in flight the pending write is marked due and
  /// goes out as soon as that flush completes.
  pub async fn flush_now(&self, key: &str) {
    let payload = {
      let mut slots = self.shared.lock();
      let slot = match slots.get_mut(key) {
        Some(slot) => slot,
        None => return,
      };
      if slot.flushing {
        if let Some(pending) = slot.pending.as_mut() {
          pending.fire_at = Instant::now();
        }
        return;
      }
      let pending = match slot.pending.take() {
        Some(pending) => pending,
        None => return,
      };
      if let Some(timer) = slot.timer.take() {
        timer.abort();
      }
      slot.flushing = true;
      pending.payload
    };

    run_flush(Arc::clone(&self.shared), key.to_string(), payload).await;
  }

  /// Flush every key that has a pending write.
  pub async fn flush_all(&self) {
    let keys: Vec<String> = {
      let slots = self.shared.lock();
      slots
        .iter()
        .filter(|(_, slot)| slot.pending.is_some())
        .map(|(key, _)| key.clone())
        .collect()
    };
    for key in keys {
      self.flush_now(&key).await;
    }
  }

  /// Cancel every timer and drop all pending writes.
  pub fn dispose(&self) {
    let mut slots = self.shared.lock();
    for (key, slot) in slots.iter_mut() {
      if let Some(timer) = slot.timer.take() {
        timer.abort();
      }
      if slot.pending.take().is_some() {
        warn!(key = %key, "unsaved write dropped on dispose");
      }
    }
  }
}

/// Timer expiry for `generation` of `key`.
async fn fire<P: Send + 'static>(shared: Arc<Shared<P>>, key: String, generation: u64) {
  let payload = {
    let mut slots = shared.lock();
    let slot = match slots.get_mut(&key) {
      Some(slot) => slot,
      None => return,
    };
    if slot.generation != generation {
      return;
    }
    // Detach: from here on nobody may abort this task mid-flush.
    slot.timer = None;
    if slot.flushing {
      // The in-flight flush picks this write up when it completes.
      return;
    }
    let pending = match slot.pending.take() {
      Some(pending) => pending,
      None => return,
    };
    slot.flushing = true;
    pending.payload
  };

  run_flush(shared, key, payload).await;
}

/// Flush `payload`, then any write that fell due meanwhile.
async fn run_flush<P: Send + 'static>(shared: Arc<Shared<P>>, key: String, payload: P) {
  let mut payload = payload;
  loop {
    let result = (shared.flush)(key.clone(), payload).await;
    match result {
      Ok(()) => {
        debug!(key = %key, "flush complete");
        emit(&shared.events, SyncEvent::Flushed { key: key.clone() });
      }
      Err(e) => {
        error!(key = %key, error = %e, "flush failed");
        emit(
          &shared.events,
          SyncEvent::FlushFailed {
            key: key.clone(),
            kind: e.kind(),
            message: e.to_string(),
          },
        );
      }
    }

    let mut slots = shared.lock();
    let slot = match slots.get_mut(&key) {
      Some(slot) => slot,
      None => return,
    };
    let due = slot
      .pending
      .as_ref()
      .is_some_and(|pending| pending.fire_at <= Instant::now());
    match slot.pending.take() {
      Some(next) if due => {
        if let Some(timer) = slot.timer.take() {
          timer.abort();
        }
        payload = next.payload;
      }
      not_due => {
        slot.pending = not_due;
        slot.flushing = false;
        return;
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::{ErrorKind, SyncError};
  use crate::event::EventHandler;
  use std::sync::atomic::{AtomicUsize, Ordering};

  type Log = Arc<Mutex<Vec<(String, u32, Instant)>>>;

  fn recording_writer(delay: Duration, work: Duration) -> (DebouncedWriter<u32>, Log) {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    let writer = DebouncedWriter::new(delay, move |key, payload| {
      let sink = sink.clone();
      async move {
        tokio::time::sleep(work).await;
        sink.lock().unwrap().push((key, payload, Instant::now()));
        Ok(())
      }
    });
    (writer, log)
  }

  fn payloads(log: &Log) -> Vec<(String, u32)> {
    log
      .lock()
      .unwrap()
      .iter()
      .map(|(k, p, _)| (k.clone(), *p))
      .collect()
  }

  #[tokio::test(start_paused = true)]
  async fn test_burst_coalesces_into_latest_payload() {
    let (writer, log) = recording_writer(Duration::from_millis(800), Duration::ZERO);

    for n in 1..=5 {
      writer.schedule("note:1:2", n);
      assert_eq!(writer.state("note:1:2"), WriterState::Scheduled);
      tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(log.lock().unwrap().is_empty());

    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(payloads(&log), vec![("note:1:2".to_string(), 5)]);
    assert_eq!(writer.state("note:1:2"), WriterState::Idle);
  }

  #[tokio::test(start_paused = true)]
  async fn test_timer_restarts_on_each_schedule() {
    let (writer, log) = recording_writer(Duration::from_millis(800), Duration::ZERO);
    let start = Instant::now();

    writer.schedule("k", 1);
    tokio::time::sleep(Duration::from_millis(500)).await;
    writer.schedule("k", 2);
    tokio::time::sleep(Duration::from_secs(2)).await;

    let log = log.lock().unwrap();
    assert_eq!(log.len(), 1);
    assert!(log[0].2 - start >= Duration::from_millis(1300));
  }

  #[tokio::test(start_paused = true)]
  async fn test_schedule_while_flushing_waits_for_inflight_flush() {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_in_flight = Arc::new(AtomicUsize::new(0));
    let log: Log = Arc::new(Mutex::new(Vec::new()));

    let writer = {
      let (in_flight, max_in_flight, sink) = (in_flight.clone(), max_in_flight.clone(), log.clone());
      DebouncedWriter::new(Duration::from_millis(800), move |key, payload: u32| {
        let (in_flight, max_in_flight, sink) = (in_flight.clone(), max_in_flight.clone(), sink.clone());
        async move {
          let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
          max_in_flight.fetch_max(now, Ordering::SeqCst);
          tokio::time::sleep(Duration::from_millis(500)).await;
          sink.lock().unwrap().push((key, payload, Instant::now()));
          in_flight.fetch_sub(1, Ordering::SeqCst);
          Ok(())
        }
      })
    };
    let start = Instant::now();

    writer.schedule("images:1:2", 1);
    // First flush runs from 800ms to 1300ms
    tokio::time::sleep(Duration::from_millis(900)).await;
    assert_eq!(writer.state("images:1:2"), WriterState::Flushing);

    // Falls due at 1000ms, while the first flush is still running
    writer.schedule_after("images:1:2", 2, Duration::from_millis(100));
    assert_eq!(writer.state("images:1:2"), WriterState::Flushing);

    tokio::time::sleep(Duration::from_secs(3)).await;

    let log = log.lock().unwrap();
    assert_eq!(log.iter().map(|(_, p, _)| *p).collect::<Vec<_>>(), vec![1, 2]);
    assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
    // Second flush starts only after the first completes
    assert!(log[1].2 - start >= Duration::from_millis(1800));
    assert_eq!(writer.state("images:1:2"), WriterState::Idle);
  }

  #[tokio::test(start_paused = true)]
  async fn test_keys_are_independent() {
    let (writer, log) = recording_writer(Duration::from_millis(800), Duration::ZERO);

    writer.schedule("a", 1);
    writer.schedule("b", 2);
    writer.schedule("a", 3);
    tokio::time::sleep(Duration::from_secs(2)).await;

    let mut got = payloads(&log);
    got.sort();
    assert_eq!(got, vec![("a".to_string(), 3), ("b".to_string(), 2)]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_cancel_and_dispose_prevent_flush() {
    let (writer, log) = recording_writer(Duration::from_millis(800), Duration::ZERO);

    writer.schedule("a", 1);
    assert_eq!(writer.cancel("a"), Some(1));
    writer.schedule("b", 2);
    writer.dispose();

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(log.lock().unwrap().is_empty());
    assert_eq!(writer.state("b"), WriterState::Idle);
  }

  #[tokio::test(start_paused = true)]
  async fn test_flush_now_skips_the_quiet_period() {
    let (writer, log) = recording_writer(Duration::from_secs(60), Duration::ZERO);

    writer.schedule("a", 7);
    writer.flush_all().await;

    assert_eq!(payloads(&log), vec![("a".to_string(), 7)]);
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(log.lock().unwrap().len(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_outcomes_are_reported_as_events() {
    let mut events = EventHandler::new();
    let writer = DebouncedWriter::with_events(
      Duration::from_millis(100),
      events.sender(),
      |_key, payload: u32| async move {
        if payload == 0 {
          Err(SyncError::Network("offline".into()))
        } else {
          Ok(())
        }
      },
    );

    writer.schedule("ok", 1);
    writer.schedule("bad", 0);
    tokio::time::sleep(Duration::from_secs(1)).await;

    let mut seen = vec![events.try_next().unwrap(), events.try_next().unwrap()];
    seen.sort_by_key(|e| format!("{:?}", e));
    assert!(seen.contains(&SyncEvent::Flushed { key: "ok".into() }));
    assert!(seen.iter().any(|e| matches!(
      e,
      SyncEvent::FlushFailed { key, kind: ErrorKind::Network, .. } if key == "bad"
    )));
  }
}
