//! Cache lookup: finding a previous build of the same fingerprint.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::fingerprint::Fingerprint;
use crate::image::ImageReference;
use crate::plan::BuildPlan;
use crate::registry::{Registry, RegistryError};
use crate::tag::ImageTagger;

/// Outcome of a cache lookup. A miss is a normal result, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
  Hit(ImageReference),
  Miss,
}

#[derive(Debug, Clone, Error)]
pub enum CacheError {
  #[error("failed to clone '{reference}' into the private registry: {source}")]
  Clone {
    reference: String,
    #[source]
    source: RegistryError,
  },
}

/// Probes the registry for images built from a given fingerprint.
pub struct ImageChecker {
  registry: Arc<dyn Registry>,
}

impl ImageChecker {
  pub fn new(registry: Arc<dyn Registry>) -> Self {
    Self { registry }
  }

  /// Look for an existing build of `fingerprint`.
  ///
  /// Candidates come from the unit's tagger and are tried in order. A hit in
  /// the shared registry is cloned into the private one under the same
  /// fingerprint-derived tag and the private reference is returned.
  pub async fn check_built(
    &self,
    plan: &BuildPlan,
    unit_name: &str,
    tagger: &dyn ImageTagger,
    fingerprint: &Fingerprint,
  ) -> Result<CacheLookup, CacheError> {
    for candidate in tagger.cache_references(plan, unit_name, fingerprint) {
      let tagged = candidate.tagged();
      let resolved = match self.registry.resolve_digest(&tagged).await {
        Ok(resolved) => resolved,
        Err(e) if e.is_not_found() => {
          debug!(unit = unit_name, reference = %tagged, "cache miss");
          continue;
        }
        Err(e) => {
          warn!(unit = unit_name, reference = %tagged, error = %e, "cache lookup failed, treating as miss");
          continue;
        }
      };

      if !self.registry.is_shared_registry(&resolved) {
        info!(unit = unit_name, reference = %resolved, "cache hit");
        return Ok(CacheLookup::Hit(resolved));
      }

      let tag = candidate.tag_or_latest().to_string();
      let private = self
        .registry
        .clone_to_private(&resolved, &tag)
        .await
        .map_err(|source| CacheError::Clone {
          reference: resolved.to_string(),
          source,
        })?;
      info!(unit = unit_name, shared = %resolved, reference = %private, "cache hit in shared registry");
      return Ok(CacheLookup::Hit(private));
    }

    Ok(CacheLookup::Miss)
  }
}
