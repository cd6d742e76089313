//! Persisted authentication session.

use tracing::{info, warn};

use crate::api::types::User;
use crate::cache::SharedStore;
use crate::error::Result;
use crate::event::{emit, EventSender, SyncEvent};

pub const TOKEN_KEY: &str = "token";
pub const USER_KEY: &str = "board_shoot_user";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSession {
  pub token: String,
  pub user: User,
}

/// Reads and writes the session in the key-value store.
#[derive(Clone)]
pub struct SessionStore {
  store: SharedStore,
  events: Option<EventSender>,
}

impl SessionStore {
  pub fn new(store: SharedStore) -> Self {
    Self {
      store,
      events: None,
    }
  }

  pub fn with_events(mut self, events: EventSender) -> Self {
    self.events = Some(events);
    self
  }

  pub fn save(&self, session: &AuthSession) -> Result<()> {
    self.store.set(TOKEN_KEY, &session.token)?;
    self.update_user(&session.user)
  }

  /// Overwrite the stored user snapshot, keeping the token.
  pub fn update_user(&self, user: &User) -> Result<()> {
    let raw = serde_json::to_string(user)?;
    self.store.set(USER_KEY, &raw)
  }

  pub fn token(&self) -> Result<Option<String>> {
    self.store.get(TOKEN_KEY)
  }

  pub fn user(&self) -> Result<Option<User>> {
    match self.store.get(USER_KEY)? {
      Some(raw) => match serde_json::from_str(&raw) {
        Ok(user) => Ok(Some(user)),
        Err(e) => {
          warn!("stored user snapshot is unreadable: {}", e);
          Ok(None)
        }
      },
      None => Ok(None),
    }
  }

  pub fn load(&self) -> Result<Option<AuthSession>> {
    match (self.token()?, self.user()?) {
      (Some(token), Some(user)) => Ok(Some(AuthSession { token, user })),
      _ => Ok(None),
    }
  }

  pub fn is_authenticated(&self) -> Result<bool> {
    Ok(self.token()?.is_some())
  }

  /// Logout: remove token and user snapshot.
  pub fn clear(&self) -> Result<()> {
    self.store.remove(TOKEN_KEY)?;
    self.store.remove(USER_KEY)
  }

  /// The server rejected the token. Drop it so the user logs in again.
  ///
  /// Emits `SessionExpired` only when a token was actually present.
  pub fn expire(&self) -> Result<()> {
    if self.token()?.is_none() {
      return Ok(());
    }
    self.store.remove(TOKEN_KEY)?;
    info!("session token rejected by server, cleared");
    emit(&self.events, SyncEvent::SessionExpired);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryStorage;
  use crate::event::EventHandler;
  use std::sync::Arc;

  fn session() -> AuthSession {
    AuthSession {
      token: "jwt".into(),
      user: User {
        id: 7,
        username: "mari".into(),
        email: "mari@example.com".into(),
      },
    }
  }

  #[test]
  fn test_save_load_clear() {
    let store = SessionStore::new(Arc::new(MemoryStorage::new()));
    assert_eq!(store.load().unwrap(), None);

    store.save(&session()).unwrap();
    assert_eq!(store.load().unwrap(), Some(session()));
    assert!(store.is_authenticated().unwrap());

    store.clear().unwrap();
    assert_eq!(store.load().unwrap(), None);
    assert_eq!(store.user().unwrap(), None);
  }

  #[test]
  fn test_expire_emits_once() {
    let mut events = EventHandler::new();
    let store = SessionStore::new(Arc::new(MemoryStorage::new())).with_events(events.sender());
    store.save(&session()).unwrap();

    store.expire().unwrap();
    store.expire().unwrap();

    assert_eq!(store.token().unwrap(), None);
    // User snapshot survives so the login form can be prefilled
    assert!(store.user().unwrap().is_some());
    assert_eq!(events.try_next(), Some(SyncEvent::SessionExpired));
    assert_eq!(events.try_next(), None);
  }
}
