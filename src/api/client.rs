use reqwest::{Method, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::config::ApiConfig;
use crate::error::{Result, SyncError};
use crate::session::SessionStore;

/// Thin REST client for the BoardShoot API.
///
/// Attaches the stored bearer token, classifies failures and never retries.
#[derive(Clone)]
pub struct ApiClient {
  http: reqwest::Client,
  base_url: Url,
  session: SessionStore,
  upload_timeout: Duration,
}

impl ApiClient {
  pub fn new(config: &ApiConfig, session: SessionStore) -> Result<Self> {
    let base_url = Url::parse(&config.url)
      .map_err(|e| SyncError::validation(format!("Invalid API URL {}: {}", config.url, e)))?;

    let http = reqwest::Client::builder()
      .timeout(config.timeout())
      .build()
      .map_err(|e| SyncError::Network(format!("Failed to create HTTP client: {}", e)))?;

    Ok(Self {
      http,
      base_url,
      session,
      upload_timeout: config.upload_timeout(),
    })
  }

  pub fn base_url(&self) -> &Url {
    &self.base_url
  }

  pub fn session(&self) -> &SessionStore {
    &self.session
  }

  /// Send a request and return the raw response body of a 2xx reply.
  pub async fn request<B>(&self, method: Method, path: &str, body: Option<&B>) -> Result<String>
  where
    B: Serialize + ?Sized,
  {
    self.send(method, path, body, None).await
  }

  pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
    let text = self.send::<()>(Method::GET, path, None, None).await?;
    decode(&text)
  }

  pub async fn post<T, B>(&self, path: &str, body: &B) -> Result<T>
  where
    T: DeserializeOwned,
    B: Serialize + ?Sized,
  {
    let text = self.send(Method::POST, path, Some(body), None).await?;
    decode(&text)
  }

  /// POST with the longer upload timeout.
  pub async fn upload<T, B>(&self, path: &str, body: &B) -> Result<T>
  where
    T: DeserializeOwned,
    B: Serialize + ?Sized,
  {
    let text = self
      .send(Method::POST, path, Some(body), Some(self.upload_timeout))
      .await?;
    decode(&text)
  }

  pub async fn put<T, B>(&self, path: &str, body: &B) -> Result<T>
  where
    T: DeserializeOwned,
    B: Serialize + ?Sized,
  {
    let text = self.send(Method::PUT, path, Some(body), None).await?;
    decode(&text)
  }

  pub async fn delete(&self, path: &str) -> Result<()> {
    self.send::<()>(Method::DELETE, path, None, None).await?;
    Ok(())
  }

  /// DELETE carrying a JSON body (image removal).
  pub async fn delete_with<T, B>(&self, path: &str, body: &B) -> Result<T>
  where
    T: DeserializeOwned,
    B: Serialize + ?Sized,
  {
    let text = self.send(Method::DELETE, path, Some(body), None).await?;
    decode(&text)
  }

  async fn send<B>(
    &self,
    method: Method,
    path: &str,
    body: Option<&B>,
    timeout: Option<Duration>,
  ) -> Result<String>
  where
    B: Serialize + ?Sized,
  {
    let url = self
      .base_url
      .join(path)
      .map_err(|e| SyncError::validation(format!("Invalid request path {}: {}", path, e)))?;

    let mut request = self.http.request(method.clone(), url);
    if let Some(token) = self.session.token()? {
      request = request.bearer_auth(token);
    }
    if let Some(body) = body {
      request = request.json(body);
    }
    if let Some(timeout) = timeout {
      request = request.timeout(timeout);
    }

    debug!(%method, path, "sending request");
    let response = request.send().await.map_err(|e| {
      warn!(%method, path, "no response: {}", e);
      SyncError::from(e)
    })?;

    let status = response.status();
    let text = response.text().await.map_err(SyncError::from)?;

    if status.is_success() {
      return Ok(text);
    }

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
      warn!(%method, path, status = status.as_u16(), "request unauthorized");
      // Rejected credentials say nothing about the stored token
      if !is_credentials_path(path) {
        self.session.expire()?;
      }
      return Err(SyncError::Auth {
        status: status.as_u16(),
      });
    }

    let message = server_message(&text, status);
    warn!(%method, path, status = status.as_u16(), "server error: {}", message);
    Err(SyncError::Server {
      status: status.as_u16(),
      message,
    })
  }
}

/// Signup and login answer 401 for bad credentials.
pub(crate) fn is_credentials_path(path: &str) -> bool {
  path.starts_with("/auth/")
}

fn decode<T: DeserializeOwned>(text: &str) -> Result<T> {
  Ok(serde_json::from_str(text)?)
}

/// Prefer the server's `message`/`error` field, then the raw body, then the
/// status reason.
fn server_message(body: &str, status: StatusCode) -> String {
  if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
    for field in ["message", "error"] {
      if let Some(msg) = value.get(field).and_then(|v| v.as_str()) {
        return msg.to_string();
      }
    }
  }

  let trimmed = body.trim();
  if !trimmed.is_empty() {
    return trimmed.to_string();
  }

  status
    .canonical_reason()
    .unwrap_or("unknown error")
    .to_string()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::types::{Folder, User};
  use crate::cache::MemoryStorage;
  use crate::session::AuthSession;
  use std::sync::Arc;
  use wiremock::matchers::{body_json, header, method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  fn client_for(url: &str) -> (ApiClient, SessionStore) {
    let session = SessionStore::new(Arc::new(MemoryStorage::new()));
    let config = ApiConfig {
      url: url.to_string(),
      timeout_secs: 2,
      upload_timeout_secs: 2,
    };
    (ApiClient::new(&config, session.clone()).unwrap(), session)
  }

  fn log_in(session: &SessionStore) {
    session
      .save(&AuthSession {
        token: "secret-jwt".into(),
        user: User {
          id: 3,
          username: "mari".into(),
          email: "mari@example.com".into(),
        },
      })
      .unwrap();
  }

  #[tokio::test]
  async fn test_attaches_bearer_token_and_decodes() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/api/folders"))
      .and(header("authorization", "Bearer secret-jwt"))
      .respond_with(
        ResponseTemplate::new(200).set_body_json(serde_json::json!([{"id": 1, "name": "Mata", "count": 3}])),
      )
      .expect(1)
      .mount(&server)
      .await;

    let (client, session) = client_for(&server.uri());
    log_in(&session);

    let folders: Vec<Folder> = client.get("/api/folders").await.unwrap();
    assert_eq!(
      folders,
      vec![Folder {
        id: 1,
        name: "Mata".into(),
        count: 3
      }]
    );
  }

  #[tokio::test]
  async fn test_sends_json_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/api/folders"))
      .and(body_json(serde_json::json!({"name": "Füüsika"})))
      .respond_with(
        ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": 2, "name": "Füüsika"})),
      )
      .expect(1)
      .mount(&server)
      .await;

    let (client, _) = client_for(&server.uri());
    let folder: Folder = client
      .post("/api/folders", &serde_json::json!({"name": "Füüsika"}))
      .await
      .unwrap();
    assert_eq!(folder.count, 0);
  }

  #[tokio::test]
  async fn test_unauthorized_clears_session() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .respond_with(ResponseTemplate::new(401))
      .mount(&server)
      .await;

    let (client, session) = client_for(&server.uri());
    log_in(&session);

    let result = client.get::<Vec<Folder>>("/api/folders").await;
    assert!(matches!(result, Err(SyncError::Auth { status: 401 })));
    assert_eq!(session.token().unwrap(), None);
  }

  #[tokio::test]
  async fn test_rejected_login_keeps_existing_session() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/auth/login"))
      .respond_with(ResponseTemplate::new(401))
      .expect(1)
      .mount(&server)
      .await;

    let (client, session) = client_for(&server.uri());
    log_in(&session);

    let result = client
      .post::<serde_json::Value, _>(
        "/auth/login",
        &serde_json::json!({"username": "mari", "password": "wrong"}),
      )
      .await;
    assert!(matches!(result, Err(SyncError::Auth { status: 401 })));
    assert_eq!(session.token().unwrap().as_deref(), Some("secret-jwt"));
  }

  #[tokio::test]
  async fn test_server_error_carries_message() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
      .respond_with(
        ResponseTemplate::new(404).set_body_json(serde_json::json!({"message": "Folder not found"})),
      )
      .mount(&server)
      .await;

    let (client, _) = client_for(&server.uri());
    match client.delete("/api/folders/99").await {
      Err(SyncError::Server { status, message }) => {
        assert_eq!(status, 404);
        assert_eq!(message, "Folder not found");
      }
      other => panic!("unexpected result: {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_no_response_is_network_error() {
    let (client, _) = client_for("http://127.0.0.1:1");
    let result = client.get::<Vec<Folder>>("/api/folders").await;
    assert!(matches!(result, Err(SyncError::Network(_))));
  }

  #[test]
  fn test_server_message_fallbacks() {
    assert_eq!(
      server_message(r#"{"error":"bad"}"#, StatusCode::BAD_REQUEST),
      "bad"
    );
    assert_eq!(server_message(" plain ", StatusCode::BAD_REQUEST), "plain");
    assert_eq!(
      server_message("", StatusCode::INTERNAL_SERVER_ERROR),
      "Internal Server Error"
    );
  }
}
