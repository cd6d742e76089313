//! Wire types for the BoardShoot REST API.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
  pub id: u64,
  pub username: String,
  pub email: String,
}

/// Returned by both signup and login
#[derive(Debug, Clone, Deserialize)]
pub struct AuthResponse {
  pub token: String,
  pub user: User,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Folder {
  pub id: u64,
  pub name: String,
  /// Number of notes in the folder
  #[serde(default)]
  pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
  pub id: u64,
  #[serde(default)]
  pub title: String,
  #[serde(default)]
  pub text: Option<String>,
  #[serde(default)]
  pub texts: Vec<String>,
  #[serde(default)]
  pub image_urls: Vec<String>,
}

// ============================================================================
// Request bodies
// ============================================================================

#[derive(Debug, Serialize)]
pub struct SignupRequest<'a> {
  pub username: &'a str,
  pub email: &'a str,
  pub password: &'a str,
}

#[derive(Debug, Serialize)]
pub struct LoginRequest<'a> {
  pub username: &'a str,
  pub password: &'a str,
}

#[derive(Debug, Serialize)]
pub struct FolderRequest<'a> {
  pub name: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NoteRequest {
  pub title: String,
  pub text: String,
}

#[derive(Debug, Serialize)]
pub struct ImageUpload {
  /// Base64 without a data URL prefix
  pub image: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReorderRequest<'a> {
  pub image_urls: &'a [String],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRef<'a> {
  pub image_url: &'a str,
}

#[derive(Debug, Serialize)]
pub struct ProfileUpdate<'a> {
  pub username: &'a str,
  pub email: &'a str,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_note_detail_parses_camel_case() {
    let note: Note = serde_json::from_str(
      r#"{"id":5,"title":"Tahvel","texts":["a"],"imageUrls":["https://x/1.jpg"]}"#,
    )
    .unwrap();
    assert_eq!(note.image_urls, vec!["https://x/1.jpg".to_string()]);
    assert_eq!(note.text, None);
  }

  #[test]
  fn test_reorder_body_uses_image_urls_key() {
    let urls = vec!["c".to_string(), "a".to_string()];
    let body = serde_json::to_value(ReorderRequest { image_urls: &urls }).unwrap();
    assert_eq!(body, serde_json::json!({"imageUrls": ["c", "a"]}));
  }
}
