//! API client with transparent caching, retries and session handling.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::de::DeserializeOwned;
use tracing::info;

use crate::cache::CacheLayer;
use crate::error::{Result, SyncError};
use crate::session::{AuthSession, SessionStore};
use crate::sync::{RetryCoordinator, RetryPolicy};

use super::cache::CacheKey;
use super::client::ApiClient;
use super::types::{
  AuthResponse, Folder, FolderRequest, ImageRef, ImageUpload, LoginRequest, Note, NoteRequest,
  ProfileUpdate, ReorderRequest, SignupRequest, User,
};

/// Largest image accepted for upload, before base64 encoding.
pub const MAX_IMAGE_BYTES: usize = 5 * 1024 * 1024;

/// BoardShoot client with caching for list reads.
///
/// Reads and idempotent writes go through the retry coordinator. Creates are
/// attempted once so a lost response cannot duplicate a folder or note.
#[derive(Clone)]
pub struct CachedClient {
  inner: ApiClient,
  cache: CacheLayer,
  retry: RetryCoordinator,
}

impl CachedClient {
  pub fn new(inner: ApiClient, cache: CacheLayer, retry: RetryCoordinator) -> Self {
    Self {
      inner,
      cache,
      retry,
    }
  }

  pub fn session(&self) -> &SessionStore {
    self.inner.session()
  }

  // ==========================================================================
  // Session
  // ==========================================================================

  pub async fn signup(&self, username: &str, email: &str, password: &str) -> Result<User> {
    require("username", username)?;
    require("email", email)?;
    require("password", password)?;

    let body = SignupRequest {
      username,
      email,
      password,
    };
    let response: AuthResponse = self
      .authenticate("signup", || {
        let inner = self.inner.clone();
        let body = &body;
        async move { inner.post("/auth/signup", body).await }
      })
      .await?;
    self.start_session(response)
  }

  pub async fn login(&self, username: &str, password: &str) -> Result<User> {
    require("username", username)?;
    require("password", password)?;

    let body = LoginRequest { username, password };
    let response: AuthResponse = self
      .authenticate("login", || {
        let inner = self.inner.clone();
        let body = &body;
        async move { inner.post("/auth/login", body).await }
      })
      .await?;
    self.start_session(response)
  }

  pub fn logout(&self) -> Result<()> {
    self.session().clear()?;
    self.cache.invalidate(&CacheKey::Folders)?;
    info!("logged out");
    Ok(())
  }

  pub fn current_user(&self) -> Result<Option<User>> {
    self.session().user()
  }

  /// Update username and email of the signed-in user.
  pub async fn update_profile(&self, username: &str, email: &str) -> Result<User> {
    require("username", username)?;
    require("email", email)?;
    let user = self
      .session()
      .user()?
      .ok_or_else(|| SyncError::validation("not signed in"))?;

    let path = format!("/users/{}/profile", user.id);
    let body = ProfileUpdate { username, email };
    let updated: User = self
      .retry
      .run("update_profile", || {
        let inner = self.inner.clone();
        let path = path.clone();
        let body = &body;
        async move { inner.put(&path, body).await }
      })
      .await?;

    self.session().update_user(&updated)?;
    Ok(updated)
  }

  fn start_session(&self, response: AuthResponse) -> Result<User> {
    // Cached folders may belong to a previous account
    self.cache.invalidate(&CacheKey::Folders)?;
    self.session().save(&AuthSession {
      token: response.token,
      user: response.user.clone(),
    })?;
    info!(user = %response.user.username, "signed in");
    Ok(response.user)
  }

  // ==========================================================================
  // Folders
  // ==========================================================================

  /// Get all folders, served from cache while fresh.
  pub async fn get_folders(&self) -> Result<Vec<Folder>> {
    let result = self
      .cache
      .get_or_fetch(&CacheKey::Folders, || {
        self.fetch("get_folders", "/api/folders".to_string())
      })
      .await?;
    Ok(result.data)
  }

  pub async fn create_folder(&self, name: &str) -> Result<Folder> {
    let name = name.trim();
    require("folder name", name)?;

    let body = FolderRequest { name };
    let folder: Folder = self
      .once("create_folder", || {
        let inner = self.inner.clone();
        let body = &body;
        async move { inner.post("/api/folders", body).await }
      })
      .await?;

    self.cache.invalidate(&CacheKey::Folders)?;
    Ok(folder)
  }

  pub async fn delete_folder(&self, folder_id: u64) -> Result<()> {
    let path = format!("/api/folders/{}", folder_id);
    self
      .retry
      .run("delete_folder", || {
        let inner = self.inner.clone();
        let path = path.clone();
        async move { inner.delete(&path).await }
      })
      .await?;

    self.cache.invalidate(&CacheKey::Folders)?;
    self.cache.invalidate(&CacheKey::FolderNotes { folder_id })?;
    Ok(())
  }

  // ==========================================================================
  // Notes
  // ==========================================================================

  /// Get the notes of a folder, served from cache while fresh.
  pub async fn get_folder_notes(&self, folder_id: u64) -> Result<Vec<Note>> {
    let result = self
      .cache
      .get_or_fetch(&CacheKey::FolderNotes { folder_id }, || {
        self.fetch("get_folder_notes", format!("/api/folders/{}/notes", folder_id))
      })
      .await?;
    Ok(result.data)
  }

  pub async fn create_note(&self, folder_id: u64, title: &str, text: &str) -> Result<Note> {
    let title = title.trim();
    require("note title", title)?;

    let path = format!("/api/folders/{}/notes", folder_id);
    let body = NoteRequest {
      title: title.to_string(),
      text: text.to_string(),
    };
    let note: Note = self
      .once("create_note", || {
        let inner = self.inner.clone();
        let path = path.clone();
        let body = &body;
        async move { inner.post(&path, body).await }
      })
      .await?;

    self.invalidate_notes(folder_id)?;
    Ok(note)
  }

  /// Full note with texts and image URLs. Never cached.
  pub async fn get_note(&self, folder_id: u64, note_id: u64) -> Result<Note> {
    self
      .fetch("get_note", note_path(folder_id, note_id))
      .await
  }

  pub async fn update_note(&self, folder_id: u64, note_id: u64, update: &NoteRequest) -> Result<Note> {
    require("note title", update.title.trim())?;

    let path = note_path(folder_id, note_id);
    let note: Note = self
      .retry
      .run("update_note", || {
        let inner = self.inner.clone();
        let path = path.clone();
        async move { inner.put(&path, update).await }
      })
      .await?;

    self.cache.invalidate(&CacheKey::FolderNotes { folder_id })?;
    Ok(note)
  }

  pub async fn delete_note(&self, folder_id: u64, note_id: u64) -> Result<()> {
    let path = note_path(folder_id, note_id);
    self
      .retry
      .run("delete_note", || {
        let inner = self.inner.clone();
        let path = path.clone();
        async move { inner.delete(&path).await }
      })
      .await?;

    self.invalidate_notes(folder_id)
  }

  // ==========================================================================
  // Images
  // ==========================================================================

  /// Upload raw image bytes; they are sent base64 encoded.
  pub async fn add_image(&self, folder_id: u64, note_id: u64, image: &[u8]) -> Result<Note> {
    if image.is_empty() {
      return Err(SyncError::validation("image is empty"));
    }
    if image.len() > MAX_IMAGE_BYTES {
      return Err(SyncError::validation(format!(
        "image is too large ({} bytes, max {})",
        image.len(),
        MAX_IMAGE_BYTES
      )));
    }

    let path = format!("{}/images", note_path(folder_id, note_id));
    let body = ImageUpload {
      image: STANDARD.encode(image),
    };
    let note: Note = self
      .retry
      .run("add_image", || {
        let inner = self.inner.clone();
        let path = path.clone();
        let body = &body;
        async move { inner.upload(&path, body).await }
      })
      .await?;

    self.cache.invalidate(&CacheKey::FolderNotes { folder_id })?;
    Ok(note)
  }

  /// Persist a new image order. The returned note carries the server's order.
  pub async fn reorder_images(&self, folder_id: u64, note_id: u64, image_urls: &[String]) -> Result<Note> {
    let path = format!("{}/images/reorder", note_path(folder_id, note_id));
    let body = ReorderRequest { image_urls };
    self
      .retry
      .run("reorder_images", || {
        let inner = self.inner.clone();
        let path = path.clone();
        let body = &body;
        async move { inner.put(&path, body).await }
      })
      .await
  }

  pub async fn delete_image(&self, folder_id: u64, note_id: u64, image_url: &str) -> Result<Note> {
    require("image URL", image_url)?;

    let path = format!("{}/images", note_path(folder_id, note_id));
    let body = ImageRef { image_url };
    let note: Note = self
      .retry
      .run("delete_image", || {
        let inner = self.inner.clone();
        let path = path.clone();
        let body = &body;
        async move { inner.delete_with(&path, body).await }
      })
      .await?;

    self.cache.invalidate(&CacheKey::FolderNotes { folder_id })?;
    Ok(note)
  }

  // ==========================================================================
  // Helpers
  // ==========================================================================

  async fn fetch<T: DeserializeOwned>(&self, operation: &str, path: String) -> Result<T> {
    self
      .retry
      .run(operation, || {
        let inner = self.inner.clone();
        let path = path.clone();
        async move { inner.get(&path).await }
      })
      .await
  }

  /// Single attempt, still gated on connectivity and clearing the session on
  /// auth failure.
  async fn once<T, F, Fut>(&self, operation: &str, f: F) -> Result<T>
  where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
  {
    let policy = RetryPolicy {
      max_attempts: 1,
      ..self.retry.policy()
    };
    self.retry.run_with(policy, operation, f).await
  }

  /// Single attempt for signup and login. Rejected credentials must not
  /// expire a session that is already stored.
  async fn authenticate<T, F, Fut>(&self, operation: &str, f: F) -> Result<T>
  where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
  {
    let policy = RetryPolicy {
      max_attempts: 1,
      ..self.retry.policy()
    };
    self.retry.without_session().run_with(policy, operation, f).await
  }

  /// Note lists changed, and with them the counts in the folder list.
  fn invalidate_notes(&self, folder_id: u64) -> Result<()> {
    self.cache.invalidate(&CacheKey::FolderNotes { folder_id })?;
    self.cache.invalidate(&CacheKey::Folders)
  }
}

fn note_path(folder_id: u64, note_id: u64) -> String {
  format!("/api/folders/{}/notes/{}", folder_id, note_id)
}

fn require(field: &str, value: &str) -> Result<()> {
  if value.trim().is_empty() {
    return Err(SyncError::validation(format!("{} must not be empty", field)));
  }
  Ok(())
}
