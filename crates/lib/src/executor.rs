//! The image build collaborator.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::cancel::CancelToken;
use crate::plan::BuildArg;

/// Errors reported by a [`Builder`].
#[derive(Debug, Clone, Error)]
pub enum ExecutorError {
  #[error("build of '{tag}' failed: {message}")]
  Failed { tag: String, message: String },

  #[error("failed to start build engine: {0}")]
  Spawn(String),

  #[error("build cancelled")]
  Cancelled,
}

/// Everything one image build needs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecuteOptions {
  /// Absolute build context directory.
  pub context: PathBuf,
  /// Absolute Dockerfile path.
  pub dockerfile: PathBuf,
  /// References the result is pushed under. The first is the primary one.
  pub tags: Vec<String>,
  pub build_args: Vec<BuildArg>,
  /// Secret id -> absolute file path.
  pub secrets: BTreeMap<String, PathBuf>,
  pub target: Option<String>,
  pub cache_from: Vec<String>,
}

impl ExecuteOptions {
  pub fn primary_tag(&self) -> &str {
    self.tags.first().map(String::as_str).unwrap_or_default()
  }
}

/// Builds an image and pushes it to a registry.
#[async_trait]
pub trait Builder: Send + Sync {
  async fn execute(&self, options: &ExecuteOptions, cancel: &CancelToken) -> Result<(), ExecutorError>;
}
