//! Wiring of the sync components.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use super::connectivity::{ConnectivityProber, ConnectivityState};
use super::documents::{ImageOrder, NoteDraft};
use super::debounce::WriterState;
use super::retry::{RetryCoordinator, RetryPolicy};
use crate::api::cache::CacheKey;
use crate::api::types::NoteRequest;
use crate::api::{ApiClient, CachedClient};
use crate::cache::{CacheLayer, MemoryStorage, SharedStore, SqliteStorage};
use crate::config::Config;
use crate::error::Result;
use crate::event::{EventHandler, EventSender};
use crate::session::SessionStore;

/// Everything the front end needs to talk to the server.
///
/// Build one with [`init`](Self::init) and tear it down with
/// [`dispose`](Self::dispose), which stops polling and drops pending writes.
///
/// Open documents are shared: asking twice for the same note returns handles
/// to the same document, so one key never has two writers.
pub struct SyncContext {
  config: Config,
  store: SharedStore,
  session: SessionStore,
  connectivity: ConnectivityState,
  prober: ConnectivityProber,
  cache: CacheLayer,
  retry: RetryCoordinator,
  client: CachedClient,
  events: EventSender,
  documents: Mutex<Documents>,
}

/// Open documents by document key.
#[derive(Default)]
struct Documents {
  image_orders: HashMap<String, ImageOrder>,
  drafts: HashMap<String, NoteDraft>,
}

impl SyncContext {
  /// Open the configured store and wire up all components.
  pub fn init(config: Config) -> Result<(Self, EventHandler)> {
    let store: SharedStore = if config.storage.ephemeral {
      Arc::new(MemoryStorage::new())
    } else {
      Arc::new(SqliteStorage::open(config.storage.path.as_deref())?)
    };
    Self::with_store(config, store)
  }

  /// Wire up components on top of an existing store.
  pub fn with_store(config: Config, store: SharedStore) -> Result<(Self, EventHandler)> {
    let handler = EventHandler::new();
    let events = handler.sender();

    let session = SessionStore::new(Arc::clone(&store)).with_events(events.clone());
    let connectivity = ConnectivityState::new();

    let inner = ApiClient::new(&config.api, session.clone())?;
    let prober = ConnectivityProber::new(&config.connectivity, inner.base_url(), connectivity.clone())?
      .with_events(events.clone());

    let ttl_secs = i64::try_from(config.cache.ttl_secs)
      .unwrap_or(i64::MAX)
      .min(i64::MAX / 1000);
    let cache = CacheLayer::new(Arc::clone(&store))
      .with_ttl(chrono::Duration::seconds(ttl_secs))
      .with_connectivity(connectivity.clone());

    let retry = RetryCoordinator::new(RetryPolicy::from(&config.retry))
      .with_session(session.clone())
      .with_connectivity(connectivity.clone());

    let client = CachedClient::new(inner, cache.clone(), retry.clone());

    // Lists fetched while offline may be stale by the time we reconnect.
    let refresh = cache.clone();
    prober.on_reconnect(move || {
      if let Err(e) = refresh.invalidate(&CacheKey::Folders) {
        debug!("failed to invalidate folders after reconnect: {}", e);
      }
    });

    if config.connectivity.poll {
      prober.start_polling(config.connectivity.poll_interval());
    }

    info!(api = %config.api.url, "sync context ready");

    let context = Self {
      config,
      store,
      session,
      connectivity,
      prober,
      cache,
      retry,
      client,
      events,
      documents: Mutex::new(Documents::default()),
    };
    Ok((context, handler))
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn store(&self) -> &SharedStore {
    &self.store
  }

  pub fn session(&self) -> &SessionStore {
    &self.session
  }

  pub fn connectivity(&self) -> &ConnectivityState {
    &self.connectivity
  }

  pub fn prober(&self) -> &ConnectivityProber {
    &self.prober
  }

  pub fn cache(&self) -> &CacheLayer {
    &self.cache
  }

  pub fn retry(&self) -> &RetryCoordinator {
    &self.retry
  }

  pub fn client(&self) -> &CachedClient {
    &self.client
  }

  /// Image order of a note, opened with the server's `images`.
  ///
  /// If the note is already open the existing document is returned. It adopts
  /// `images` when it has no write pending or in flight.
  pub fn image_order(&self, folder_id: u64, note_id: u64, images: Vec<String>) -> ImageOrder {
    let key = ImageOrder::key_for(folder_id, note_id);
    let mut documents = self.documents();
    if let Some(order) = documents.image_orders.get(&key) {
      if order.state() == WriterState::Idle {
        order.reset(images);
      }
      return order.clone();
    }

    let order = ImageOrder::new(
      self.client.clone(),
      folder_id,
      note_id,
      images,
      self.config.sync.debounce(),
      Some(self.events.clone()),
    );
    documents.image_orders.insert(key, order.clone());
    order
  }

  /// Autosaving draft of a note, opened with the server's `current` content.
  ///
  /// If the note is already open the existing draft is returned. It adopts
  /// `current` when it has no write pending or in flight.
  pub fn note_draft(&self, folder_id: u64, note_id: u64, current: NoteRequest) -> NoteDraft {
    let key = NoteDraft::key_for(folder_id, note_id);
    let mut documents = self.documents();
    if let Some(draft) = documents.drafts.get(&key) {
      if draft.state() == WriterState::Idle {
        draft.reset(current);
      }
      return draft.clone();
    }

    let draft = NoteDraft::new(
      self.client.clone(),
      folder_id,
      note_id,
      current,
      self.config.sync.debounce(),
      Some(self.events.clone()),
    );
    documents.drafts.insert(key, draft.clone());
    draft
  }

  /// Close the document stored under `key`, sending any pending write first.
  ///
  /// Returns false when no such document is open.
  pub async fn release(&self, key: &str) -> bool {
    let (order, draft) = {
      let mut documents = self.documents();
      (documents.image_orders.remove(key), documents.drafts.remove(key))
    };
    if let Some(order) = &order {
      order.flush().await;
    }
    if let Some(draft) = &draft {
      draft.flush().await;
    }
    let released = order.is_some() || draft.is_some();
    if released {
      debug!(key, "document released");
    }
    released
  }

  /// Number of documents currently open.
  pub fn open_documents(&self) -> usize {
    let documents = self.documents();
    documents.image_orders.len() + documents.drafts.len()
  }

  /// Stop polling and cancel every pending debounced write.
  pub fn dispose(&self) {
    self.prober.stop_polling();
    let mut documents = self.documents();
    for (_, order) in documents.image_orders.drain() {
      order.dispose();
    }
    for (_, draft) in documents.drafts.drain() {
      draft.dispose();
    }
    debug!("sync context disposed");
  }

  fn documents(&self) -> MutexGuard<'_, Documents> {
    self.documents.lock().unwrap_or_else(|e| e.into_inner())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;
  use wiremock::matchers::{method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  fn test_config() -> Config {
    let mut config = Config::default();
    config.api.url = "http://127.0.0.1:1".into();
    config.storage.ephemeral = true;
    config.connectivity.poll_interval_secs = 60;
    config
  }

  #[tokio::test]
  async fn test_init_with_ephemeral_store() {
    let (ctx, _events) = SyncContext::init(test_config()).unwrap();
    ctx.store().set("marker", "1").unwrap();
    assert_eq!(ctx.store().get("marker").unwrap().as_deref(), Some("1"));
    assert!(!ctx.session().is_authenticated().unwrap());
    assert!(ctx.connectivity().is_reachable());
    assert_eq!(ctx.cache().ttl(), chrono::Duration::minutes(5));
  }

  #[tokio::test]
  async fn test_dispose_stops_polling_and_pending_writes() {
    let mut config = test_config();
    config.connectivity.poll = true;
    let (ctx, _events) = SyncContext::init(config).unwrap();
    assert!(ctx.prober().is_polling());

    let order = ctx.image_order(1, 2, vec!["a".into(), "b".into()]);
    order.reorder(vec!["b".into(), "a".into()]).unwrap();
    assert_eq!(order.state(), WriterState::Scheduled);

    ctx.dispose();
    assert!(!ctx.prober().is_polling());
    assert_eq!(order.state(), WriterState::Idle);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(order.state(), WriterState::Idle);
  }

  #[tokio::test]
  async fn test_same_note_shares_one_document() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
      .and(path("/api/folders/1/notes/2/images/reorder"))
      .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
        "id": 2, "title": "Tahvel", "imageUrls": ["c", "b", "a"]
      })))
      .expect(1)
      .mount(&server)
      .await;

    let mut config = test_config();
    config.api.url = server.uri();
    config.sync.debounce_ms = 50;
    let (ctx, _events) = SyncContext::init(config).unwrap();

    let images: Vec<String> = vec!["a".into(), "b".into(), "c".into()];
    let first = ctx.image_order(1, 2, images.clone());
    let second = ctx.image_order(1, 2, images.clone());
    first.reorder(vec!["b".into(), "a".into(), "c".into()]).unwrap();
    second.reorder(vec!["c".into(), "b".into(), "a".into()]).unwrap();
    assert_eq!(first.images(), second.images());

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(first.confirmed(), vec!["c".to_string(), "b".into(), "a".into()]);
  }

  #[tokio::test]
  async fn test_reopening_notes_does_not_accumulate_documents() {
    let (ctx, _events) = SyncContext::init(test_config()).unwrap();
    let current = NoteRequest {
      title: "Tahvel".into(),
      text: String::new(),
    };

    for _ in 0..100 {
      ctx.image_order(1, 2, vec!["a".into()]);
      ctx.note_draft(1, 2, current.clone());
    }
    assert_eq!(ctx.open_documents(), 2);

    assert!(ctx.release(&ImageOrder::key_for(1, 2)).await);
    assert!(ctx.release(&NoteDraft::key_for(1, 2)).await);
    assert!(!ctx.release("images:9:9").await);
    assert_eq!(ctx.open_documents(), 0);
  }
}
