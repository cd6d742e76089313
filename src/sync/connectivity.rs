//! Reachability probing for the API host.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::ConnectivityConfig;
use crate::error::{Result, SyncError};
use crate::event::{emit, EventSender, SyncEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectivitySnapshot {
  pub reachable: bool,
  /// `None` until the first probe completes
  pub checked_at: Option<DateTime<Utc>>,
}

/// Shared, read-mostly view of the last probe result.
///
/// Starts out optimistic (reachable) so the first request is attempted
/// before any probe has run.
#[derive(Debug, Clone)]
pub struct ConnectivityState {
  inner: Arc<RwLock<ConnectivitySnapshot>>,
}

impl ConnectivityState {
  pub fn new() -> Self {
    Self {
      inner: Arc::new(RwLock::new(ConnectivitySnapshot {
        reachable: true,
        checked_at: None,
      })),
    }
  }

  pub fn snapshot(&self) -> ConnectivitySnapshot {
    *self.inner.read().unwrap_or_else(|e| e.into_inner())
  }

  pub fn is_reachable(&self) -> bool {
    self.snapshot().reachable
  }

  /// Store a probe result, returning the previous reachability.
  pub(crate) fn record(&self, reachable: bool) -> bool {
    let mut snapshot = self.inner.write().unwrap_or_else(|e| e.into_inner());
    let previous = snapshot.reachable;
    snapshot.reachable = reachable;
    snapshot.checked_at = Some(Utc::now());
    previous
  }
}

impl Default for ConnectivityState {
  fn default() -> Self {
    Self::new()
  }
}

/// What a single probe found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
  Reachable,
  /// The device is online but the API host does not answer
  ApiDown,
  Offline,
}

type RefreshCallback = Arc<dyn Fn() + Send + Sync>;

/// Probes the API host with HEAD requests and keeps [`ConnectivityState`]
/// current.
#[derive(Clone)]
pub struct ConnectivityProber {
  http: reqwest::Client,
  health_url: Url,
  external_url: Url,
  timeout: Duration,
  state: ConnectivityState,
  on_reconnect: Arc<Mutex<Vec<RefreshCallback>>>,
  events: Option<EventSender>,
  poller: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ConnectivityProber {
  pub fn new(config: &ConnectivityConfig, api_url: &Url, state: ConnectivityState) -> Result<Self> {
    let health_url = api_url
      .join(&config.health_path)
      .map_err(|e| SyncError::validation(format!("Invalid health path {}: {}", config.health_path, e)))?;
    let external_url = Url::parse(&config.external_url).map_err(|e| {
      SyncError::validation(format!("Invalid external probe URL {}: {}", config.external_url, e))
    })?;

    let http = reqwest::Client::builder()
      .timeout(config.probe_timeout())
      .build()
      .map_err(|e| SyncError::Network(format!("Failed to build probe client: {}", e)))?;

    Ok(Self {
      http,
      health_url,
      external_url,
      timeout: config.probe_timeout(),
      state,
      on_reconnect: Arc::new(Mutex::new(Vec::new())),
      events: None,
      poller: Arc::new(Mutex::new(None)),
    })
  }

  pub fn with_events(mut self, events: EventSender) -> Self {
    self.events = Some(events);
    self
  }

  pub fn state(&self) -> &ConnectivityState {
    &self.state
  }

  /// Register a callback fired once per unreachable -> reachable transition.
  pub fn on_reconnect<F>(&self, callback: F)
  where
    F: Fn() + Send + Sync + 'static,
  {
    let mut callbacks = self.on_reconnect.lock().unwrap_or_else(|e| e.into_inner());
    callbacks.push(Arc::new(callback));
  }

  /// Probe the API host, then the external host if the API did not answer.
  ///
  /// Any HTTP response counts as reachable, whatever its status.
  pub async fn probe(&self) -> ProbeOutcome {
    if self.head(&self.health_url).await {
      return ProbeOutcome::Reachable;
    }
    if self.head(&self.external_url).await {
      ProbeOutcome::ApiDown
    } else {
      ProbeOutcome::Offline
    }
  }

  /// Probe now and update the shared snapshot.
  pub async fn check_now(&self) -> bool {
    let outcome = self.probe().await;
    let reachable = outcome == ProbeOutcome::Reachable;

    match outcome {
      ProbeOutcome::Reachable => debug!(url = %self.health_url, "API host reachable"),
      ProbeOutcome::ApiDown => warn!(url = %self.health_url, "network is up but API host is unreachable"),
      ProbeOutcome::Offline => warn!("device appears to be offline"),
    }

    let previous = self.state.record(reachable);
    if previous != reachable {
      emit(&self.events, SyncEvent::ConnectivityChanged { reachable });
    }
    if reachable && !previous {
      info!("connection to API host restored");
      self.fire_reconnect();
    }

    reachable
  }

  /// Probe every `interval` until [`stop_polling`](Self::stop_polling).
  ///
  /// Restarting replaces the previous poller.
  pub fn start_polling(&self, interval: Duration) {
    let prober = self.clone();
    let handle = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        prober.check_now().await;
      }
    });

    let mut poller = self.poller.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(old) = poller.replace(handle) {
      old.abort();
    }
    debug!(interval_ms = interval.as_millis() as u64, "connectivity polling started");
  }

  pub fn stop_polling(&self) {
    let mut poller = self.poller.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(handle) = poller.take() {
      handle.abort();
      debug!("connectivity polling stopped");
    }
  }

  pub fn is_polling(&self) -> bool {
    let poller = self.poller.lock().unwrap_or_else(|e| e.into_inner());
    poller.as_ref().is_some_and(|h| !h.is_finished())
  }

  async fn head(&self, url: &Url) -> bool {
    match self.http.head(url.clone()).timeout(self.timeout).send().await {
      Ok(_) => true,
      Err(e) => {
        debug!(url = %url, "probe failed: {}", e);
        false
      }
    }
  }

  fn fire_reconnect(&self) {
    let callbacks: Vec<RefreshCallback> = {
      let callbacks = self.on_reconnect.lock().unwrap_or_else(|e| e.into_inner());
      callbacks.clone()
    };
    for callback in callbacks {
      callback();
    }
  }
}
