//! Cache keys for BoardShoot list resources.

use crate::cache::QueryKey;

/// Cached collections. Storage keys match what the mobile client persisted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheKey {
  /// All folders of the signed-in user
  Folders,
  /// Notes of one folder
  FolderNotes { folder_id: u64 },
}

impl QueryKey for CacheKey {
  fn storage_key(&self) -> String {
    match self {
      Self::Folders => "folders_cache".to_string(),
      Self::FolderNotes { folder_id } => format!("folder_notes_{}", folder_id),
    }
  }

  fn description(&self) -> String {
    match self {
      Self::Folders => "folders".to_string(),
      Self::FolderNotes { folder_id } => format!("notes of folder {}", folder_id),
    }
  }
}
