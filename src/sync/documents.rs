//! Optimistic documents persisted through the debounced writer.
//!
//! Local edits apply immediately. The last confirmed server value is kept so a
//! failed flush can roll the local copy back.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

use super::debounce::{DebouncedWriter, WriterState};
use crate::api::types::NoteRequest;
use crate::api::CachedClient;
use crate::error::{Result, SyncError};
use crate::event::EventSender;

#[derive(Debug, Clone)]
struct Versions<T> {
  confirmed: T,
  local: T,
}

type Shared<T> = Arc<Mutex<Versions<T>>>;

fn lock<T>(state: &Shared<T>) -> MutexGuard<'_, Versions<T>> {
  state.lock().unwrap_or_else(|e| e.into_inner())
}

/// Apply a flush outcome. A failure only reverts when no newer edit was made
/// since `payload` was scheduled.
fn settle<T: Clone + PartialEq>(state: &Shared<T>, payload: &T, outcome: std::result::Result<T, &SyncError>) {
  let mut versions = lock(state);
  match outcome {
    Ok(server) => {
      if versions.local == *payload {
        versions.local = server.clone();
      }
      versions.confirmed = server;
    }
    Err(err) => {
      if versions.local == *payload {
        warn!(error = %err, "flush failed, rolling back local changes");
        versions.local = versions.confirmed.clone();
      } else {
        debug!("flush failed, newer local edit kept");
      }
    }
  }
}

/// Drop the pending write of `key` and put local back to the confirmed value.
fn discard<T: Clone + PartialEq + Send + 'static>(state: &Shared<T>, writer: &DebouncedWriter<T>, key: &str) {
  if writer.cancel(key).is_some() {
    let mut versions = lock(state);
    if versions.local != versions.confirmed {
      warn!(key, "discarding unsaved local changes");
      versions.local = versions.confirmed.clone();
    }
  }
  writer.dispose();
}

fn debounced<P, F, Fut>(delay: Duration, events: Option<EventSender>, flush: F) -> DebouncedWriter<P>
where
  P: Send + 'static,
  F: Fn(String, P) -> Fut + Send + Sync + 'static,
  Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
  match events {
    Some(events) => DebouncedWriter::with_events(delay, events, flush),
    None => DebouncedWriter::new(delay, flush),
  }
}

// ============================================================================
// Image order
// ============================================================================

/// Image order of one note, reordered locally and persisted after a quiet
/// period.
#[derive(Clone)]
pub struct ImageOrder {
  key: String,
  state: Shared<Vec<String>>,
  writer: DebouncedWriter<Vec<String>>,
}

impl ImageOrder {
  pub fn new(
    client: CachedClient,
    folder_id: u64,
    note_id: u64,
    images: Vec<String>,
    delay: Duration,
    events: Option<EventSender>,
  ) -> Self {
    let state: Shared<Vec<String>> = Arc::new(Mutex::new(Versions {
      confirmed: images.clone(),
      local: images,
    }));

    let flush_state = Arc::clone(&state);
    let writer = debounced(delay, events, move |_key, order: Vec<String>| {
      let client = client.clone();
      let state = Arc::clone(&flush_state);
      async move {
        match client.reorder_images(folder_id, note_id, &order).await {
          Ok(note) => {
            settle(&state, &order, Ok(note.image_urls));
            Ok(())
          }
          Err(err) => {
            settle(&state, &order, Err(&err));
            Err(err)
          }
        }
      }
    });

    Self {
      key: Self::key_for(folder_id, note_id),
      state,
      writer,
    }
  }

  /// Document key of the image order of a note.
  pub fn key_for(folder_id: u64, note_id: u64) -> String {
    format!("images:{}:{}", folder_id, note_id)
  }

  pub fn key(&self) -> &str {
    &self.key
  }

  /// Current local order, including unflushed changes.
  pub fn images(&self) -> Vec<String> {
    lock(&self.state).local.clone()
  }

  /// Last order acknowledged by the server.
  pub fn confirmed(&self) -> Vec<String> {
    lock(&self.state).confirmed.clone()
  }

  /// Replace the order. It must contain exactly the current images.
  pub fn reorder(&self, order: Vec<String>) -> Result<()> {
    {
      let mut versions = lock(&self.state);
      if !is_permutation(&versions.local, &order) {
        return Err(SyncError::validation(
          "new image order must contain exactly the current images",
        ));
      }
      versions.local = order.clone();
    }
    self.writer.schedule(self.key.clone(), order);
    Ok(())
  }

  /// Move the image at `from` to position `to`.
  pub fn move_image(&self, from: usize, to: usize) -> Result<()> {
    let mut order = self.images();
    if from >= order.len() || to >= order.len() {
      return Err(SyncError::validation(format!(
        "image position out of range (have {})",
        order.len()
      )));
    }
    let url = order.remove(from);
    order.insert(to, url);
    self.reorder(order)
  }

  /// Adopt a freshly fetched server order, dropping any pending write.
  pub fn reset(&self, images: Vec<String>) {
    self.writer.cancel(&self.key);
    let mut versions = lock(&self.state);
    versions.confirmed = images.clone();
    versions.local = images;
  }

  pub fn state(&self) -> WriterState {
    self.writer.state(&self.key)
  }

  /// Write a pending order now instead of waiting for the quiet period.
  pub async fn flush(&self) {
    self.writer.flush_now(&self.key).await
  }

  /// Stop the writer. A write that has not gone out yet is discarded and the
  /// local copy reverts to the confirmed value.
  pub fn dispose(&self) {
    discard(&self.state, &self.writer, &self.key)
  }
}

fn is_permutation(current: &[String], order: &[String]) -> bool {
  if current.len() != order.len() {
    return false;
  }
  let mut a: Vec<&String> = current.iter().collect();
  let mut b: Vec<&String> = order.iter().collect();
  a.sort();
  b.sort();
  a == b
}

// ============================================================================
// Note draft
// ============================================================================

/// Title and text of one note, autosaved after a quiet period.
#[derive(Clone)]
pub struct NoteDraft {
  key: String,
  state: Shared<NoteRequest>,
  writer: DebouncedWriter<NoteRequest>,
}

impl NoteDraft {
  pub fn new(
    client: CachedClient,
    folder_id: u64,
    note_id: u64,
    current: NoteRequest,
    delay: Duration,
    events: Option<EventSender>,
  ) -> Self {
    let state: Shared<NoteRequest> = Arc::new(Mutex::new(Versions {
      confirmed: current.clone(),
      local: current,
    }));

    let flush_state = Arc::clone(&state);
    let writer = debounced(delay, events, move |_key, draft: NoteRequest| {
      let client = client.clone();
      let state = Arc::clone(&flush_state);
      async move {
        match client.update_note(folder_id, note_id, &draft).await {
          Ok(_) => {
            settle(&state, &draft, Ok(draft.clone()));
            Ok(())
          }
          Err(err) => {
            settle(&state, &draft, Err(&err));
            Err(err)
          }
        }
      }
    });

    Self {
      key: Self::key_for(folder_id, note_id),
      state,
      writer,
    }
  }

  pub fn key_for(folder_id: u64, note_id: u64) -> String {
    format!("note:{}:{}", folder_id, note_id)
  }

  pub fn key(&self) -> &str {
    &self.key
  }

  pub fn current(&self) -> NoteRequest {
    lock(&self.state).local.clone()
  }

  pub fn confirmed(&self) -> NoteRequest {
    lock(&self.state).confirmed.clone()
  }

  /// Adopt freshly fetched server content, dropping any pending write.
  pub fn reset(&self, current: NoteRequest) {
    self.writer.cancel(&self.key);
    let mut versions = lock(&self.state);
    versions.confirmed = current.clone();
    versions.local = current;
  }

  pub fn set_title(&self, title: &str) -> Result<()> {
    let mut draft = self.current();
    draft.title = title.to_string();
    self.update(draft)
  }

  pub fn set_text(&self, text: &str) -> Result<()> {
    let mut draft = self.current();
    draft.text = text.to_string();
    self.update(draft)
  }

  /// Replace the draft. An empty title is rejected and nothing is scheduled.
  pub fn update(&self, draft: NoteRequest) -> Result<()> {
    if draft.title.trim().is_empty() {
      return Err(SyncError::validation("note title must not be empty"));
    }
    lock(&self.state).local = draft.clone();
    self.writer.schedule(self.key.clone(), draft);
    Ok(())
  }

  pub fn state(&self) -> WriterState {
    self.writer.state(&self.key)
  }

  pub async fn flush(&self) {
    self.writer.flush_now(&self.key).await
  }

  /// Stop the writer. A write that has not gone out yet is discarded and the
  /// local copy reverts to the confirmed value.
  pub fn dispose(&self) {
    discard(&self.state, &self.writer, &self.key)
  }
}
