//! Source repository queries used for fingerprinting and cache gating.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

/// Errors that can occur while querying the source repository.
#[derive(Debug, Error)]
pub enum RepositoryError {
  /// No git repository contains the path.
  #[error("failed to open repository at '{path}': {source}")]
  Open {
    path: PathBuf,
    #[source]
    source: Box<dyn std::error::Error + Send + Sync>,
  },

  /// Failed to resolve HEAD to a commit.
  #[error("failed to resolve HEAD: {0}")]
  ResolveHead(String),

  /// Failed to compute the working tree status.
  #[error("failed to compute repository status: {0}")]
  Status(String),
}

/// The version-controlled checkout a plan lives in.
pub trait Repository: Send + Sync {
  /// Identifier of the current commit.
  fn commit_id(&self) -> Result<String, RepositoryError>;

  /// Whether the working tree has no uncommitted changes.
  fn is_clean(&self) -> Result<bool, RepositoryError>;
}

/// A git checkout discovered from a path inside it.
#[derive(Debug, Clone)]
pub struct GitRepository {
  path: PathBuf,
}

impl GitRepository {
  pub fn new(path: &Path) -> Self {
    Self {
      path: path.to_path_buf(),
    }
  }

  fn open(&self) -> Result<gix::Repository, RepositoryError> {
    gix::discover(&self.path).map_err(|e| RepositoryError::Open {
      path: self.path.clone(),
      source: Box::new(e),
    })
  }
}

impl Repository for GitRepository {
  fn commit_id(&self) -> Result<String, RepositoryError> {
    let repo = self.open()?;
    let mut head = repo.head().map_err(|e| RepositoryError::ResolveHead(e.to_string()))?;
    let commit = head
      .peel_to_commit()
      .map_err(|e| RepositoryError::ResolveHead(e.to_string()))?;

    let id = commit.id.to_string();
    debug!(path = %self.path.display(), commit = %id, "resolved HEAD");
    Ok(id)
  }

  fn is_clean(&self) -> Result<bool, RepositoryError> {
    let repo = self.open()?;
    let dirty = repo.is_dirty().map_err(|e| RepositoryError::Status(e.to_string()))?;
    Ok(!dirty)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn missing_path_is_an_open_error() {
    let repo = GitRepository::new(Path::new("/nonexistent/smartbuild/checkout"));
    assert!(matches!(repo.commit_id(), Err(RepositoryError::Open { .. })));
    assert!(matches!(repo.is_clean(), Err(RepositoryError::Open { .. })));
  }
}
