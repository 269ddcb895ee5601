//! The image registry collaborator.

use async_trait::async_trait;
use thiserror::Error;

use crate::image::ImageReference;

/// Errors reported by a [`Registry`].
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
  /// The reference does not exist. A normal outcome for cache lookups.
  #[error("image '{0}' not found")]
  NotFound(String),

  #[error("registry request for '{reference}' failed: {message}")]
  Request { reference: String, message: String },
}

impl RegistryError {
  pub fn is_not_found(&self) -> bool {
    matches!(self, Self::NotFound(_))
  }
}

/// Image storage: digest lookup and cross-namespace copies.
///
/// Implementations must be safe to call concurrently for different units.
#[async_trait]
pub trait Registry: Send + Sync {
  /// Resolve a tagged reference to the same reference carrying its digest.
  async fn resolve_digest(&self, image: &str) -> Result<ImageReference, RegistryError>;

  /// Whether `image` lives in the shared registry tier.
  fn is_shared_registry(&self, image: &ImageReference) -> bool;

  /// Copy `image` into the private registry under `tag`, returning the new reference.
  async fn clone_to_private(&self, image: &ImageReference, tag: &str) -> Result<ImageReference, RegistryError>;

  /// Split an image into `(repository, tag)`; the tag defaults to `latest`.
  fn repository_and_tag(&self, image: &str) -> (String, String) {
    let reference = ImageReference::parse(image);
    let tag = reference.tag_or_latest().to_string();
    (reference.name(), tag)
  }
}
