//! Bounded retry with linear backoff.

use std::future::Future;
use std::time::Duration;
use tracing::{error, info, warn};

use super::connectivity::ConnectivityState;
use crate::config::RetryConfig;
use crate::error::{Result, SyncError};
use crate::session::SessionStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  pub max_attempts: u32,
  pub base_delay: Duration,
  /// Treat 5xx responses as transient too
  pub retry_server_errors: bool,
}

impl RetryPolicy {
  pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
    Self {
      max_attempts: max_attempts.max(1),
      base_delay,
      retry_server_errors: false,
    }
  }

  pub fn retrying_server_errors(mut self) -> Self {
    self.retry_server_errors = true;
    self
  }

  /// Wait after failed attempt `attempt` (1-based): `base_delay * attempt`.
  pub fn delay_for(&self, attempt: u32) -> Duration {
    self.base_delay * attempt
  }

  pub fn should_retry(&self, error: &SyncError) -> bool {
    match error {
      SyncError::Server { status, .. } => self.retry_server_errors && *status >= 500,
      other => other.is_transient(),
    }
  }
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self::new(3, Duration::from_millis(1000))
  }
}

impl From<&RetryConfig> for RetryPolicy {
  fn from(config: &RetryConfig) -> Self {
    let policy = Self::new(config.max_attempts, Duration::from_millis(config.base_delay_ms));
    if config.retry_server_errors {
      policy.retrying_server_errors()
    } else {
      policy
    }
  }
}

/// Progress of one retried invocation.
#[derive(Debug)]
pub struct RetryState {
  pub attempt: u32,
  pub max_attempts: u32,
  pub last_error: Option<SyncError>,
}

/// Runs remote operations under a [`RetryPolicy`].
///
/// With a session attached, an auth failure clears the stored token. With
/// connectivity attached, nothing is attempted while the host is known to be
/// unreachable.
#[derive(Clone, Default)]
pub struct RetryCoordinator {
  policy: RetryPolicy,
  session: Option<SessionStore>,
  connectivity: Option<ConnectivityState>,
}

impl RetryCoordinator {
  pub fn new(policy: RetryPolicy) -> Self {
    Self {
      policy,
      session: None,
      connectivity: None,
    }
  }

  pub fn with_session(mut self, session: SessionStore) -> Self {
    self.session = Some(session);
    self
  }

  pub fn with_connectivity(mut self, connectivity: ConnectivityState) -> Self {
    self.connectivity = Some(connectivity);
    self
  }

  /// Same policy and connectivity gate, but auth failures leave the stored
  /// session alone.
  pub fn without_session(&self) -> Self {
    Self {
      session: None,
      ..self.clone()
    }
  }

  pub fn policy(&self) -> RetryPolicy {
    self.policy
  }

  pub async fn run<T, F, Fut>(&self, operation: &str, f: F) -> Result<T>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    self.run_with(self.policy, operation, f).await
  }

  /// Like [`run`](Self::run) with a per-call policy.
  pub async fn run_with<T, F, Fut>(&self, policy: RetryPolicy, operation: &str, mut f: F) -> Result<T>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    let mut state = RetryState {
      attempt: 0,
      max_attempts: policy.max_attempts,
      last_error: None,
    };

    loop {
      if let Some(connectivity) = &self.connectivity {
        if !connectivity.is_reachable() {
          warn!(operation, attempt = state.attempt, "host unreachable, not attempting");
          return Err(state.last_error.take().unwrap_or_else(SyncError::offline));
        }
      }

      state.attempt += 1;
      let err = match f().await {
        Ok(value) => {
          if state.attempt > 1 {
            info!(operation, attempt = state.attempt, "operation succeeded after retry");
          }
          return Ok(value);
        }
        Err(err) => err,
      };

      if let SyncError::Auth { status } = err {
        warn!(operation, status, "authentication rejected, not retrying");
        if let Some(session) = &self.session {
          session.expire()?;
        }
        return Err(err);
      }

      if !policy.should_retry(&err) {
        return Err(err);
      }

      if state.attempt >= state.max_attempts {
        error!(
          operation,
          attempts = state.attempt,
          error = %err,
          "retries exhausted"
        );
        return Err(err);
      }

      let delay = policy.delay_for(state.attempt);
      warn!(
        operation,
        attempt = state.attempt,
        remaining = state.max_attempts - state.attempt,
        delay_ms = delay.as_millis() as u64,
        error = %err,
        "transient failure, retrying"
      );
      state.last_error = Some(err);
      tokio::time::sleep(delay).await;
    }
  }
}

/// Retry `f` under a bare policy: no session or connectivity hooks.
pub async fn with_retry<T, F, Fut>(f: F, max_attempts: u32, base_delay: Duration) -> Result<T>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<T>>,
{
  RetryCoordinator::new(RetryPolicy::new(max_attempts, base_delay))
    .run("operation", f)
    .await
}
