//! Error taxonomy shared by every layer of the sync client.

use thiserror::Error;

pub type Result<T, E = SyncError> = std::result::Result<T, E>;

/// Coarse classification of a [`SyncError`], cheap to copy into events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
  Network,
  Auth,
  Server,
  Validation,
  Storage,
  Decode,
}

#[derive(Debug, Error)]
pub enum SyncError {
  /// No response received: device offline, host refused or request timed out.
  #[error("network unavailable: {0}")]
  Network(String),

  /// Server rejected the credentials (401/403). The session is cleared.
  #[error("authentication rejected (HTTP {status})")]
  Auth { status: u16 },

  /// Any other non-2xx response.
  #[error("server error (HTTP {status}): {message}")]
  Server { status: u16, message: String },

  /// Rejected locally, never sent to the network.
  #[error("invalid input: {0}")]
  Validation(String),

  #[error("local storage error: {0}")]
  Storage(String),

  #[error("malformed data: {0}")]
  Decode(#[from] serde_json::Error),
}

impl SyncError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      Self::Network(_) => ErrorKind::Network,
      Self::Auth { .. } => ErrorKind::Auth,
      Self::Server { .. } => ErrorKind::Server,
      Self::Validation(_) => ErrorKind::Validation,
      Self::Storage(_) => ErrorKind::Storage,
      Self::Decode(_) => ErrorKind::Decode,
    }
  }

  /// Whether retrying the same request may succeed without user action.
  pub fn is_transient(&self) -> bool {
    matches!(self, Self::Network(_))
  }

  pub fn offline() -> Self {
    Self::Network("API host is unreachable".to_string())
  }

  pub fn validation(msg: impl Into<String>) -> Self {
    Self::Validation(msg.into())
  }
}

impl From<reqwest::Error> for SyncError {
  fn from(e: reqwest::Error) -> Self {
    if let Some(status) = e.status() {
      let status = status.as_u16();
      if status == 401 || status == 403 {
        return Self::Auth { status };
      }
      return Self::Server {
        status,
        message: e.to_string(),
      };
    }
    if e.is_timeout() {
      return Self::Network(format!("request timed out: {}", e));
    }
    Self::Network(e.to_string())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_only_network_errors_are_transient() {
    assert!(SyncError::offline().is_transient());
    assert!(!SyncError::Auth { status: 401 }.is_transient());
    assert!(!SyncError::Server {
      status: 503,
      message: "down".into()
    }
    .is_transient());
    assert!(!SyncError::validation("empty").is_transient());
  }

  #[test]
  fn test_kind_matches_variant() {
    assert_eq!(SyncError::Auth { status: 403 }.kind(), ErrorKind::Auth);
    assert_eq!(SyncError::Storage("x".into()).kind(), ErrorKind::Storage);
    let decode = serde_json::from_str::<u32>("nope").unwrap_err();
    assert_eq!(SyncError::from(decode).kind(), ErrorKind::Decode);
  }
}
