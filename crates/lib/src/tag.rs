//! Tag strategies: which image reference a unit's build is published under.
//!
//! The human-facing tag is a fixed marker (`okteto` or
//! `okteto-with-volume-mounts`) so downstream references stay stable while
//! fingerprints churn. Fingerprints only appear in the cache references that
//! [`crate::cache::ImageChecker`] looks up.

use crate::config::BuildConfig;
use crate::consts::{DEFAULT_IMAGE_TAG, VOLUME_MOUNTS_IMAGE_TAG};
use crate::fingerprint::Fingerprint;
use crate::image::{ImageReference, sanitize_name};
use crate::plan::{BuildPlan, BuildUnit};

/// Maps a unit to its published and cache image references.
pub trait ImageTagger: Send + Sync {
  /// The reference a build of `unit` is published under.
  fn reference(&self, plan: &BuildPlan, unit_name: &str, unit: &BuildUnit) -> ImageReference;

  /// Fingerprint-keyed references to check for an existing build, most preferred first.
  fn cache_references(&self, plan: &BuildPlan, unit_name: &str, fingerprint: &Fingerprint) -> Vec<ImageReference>;

  /// Where a fresh build is additionally pushed so later runs can find it.
  fn cache_push_reference(&self, plan: &BuildPlan, unit_name: &str, fingerprint: &Fingerprint) -> ImageReference;
}

/// Tagging for units without volume mounts.
#[derive(Debug, Clone)]
pub struct StandardTagger {
  config: BuildConfig,
}

/// Tagging for the volume-mount-augmented variant of a unit.
#[derive(Debug, Clone)]
pub struct VolumeMountTagger {
  config: BuildConfig,
}

/// Pick the tagger for a unit.
pub fn tagger_for(unit: &BuildUnit, config: &BuildConfig) -> Box<dyn ImageTagger> {
  if unit.has_volume_mounts() {
    Box::new(VolumeMountTagger::new(config.clone()))
  } else {
    Box::new(StandardTagger::new(config.clone()))
  }
}

/// `<plan>-<unit>`, sanitised for use as a repository name.
pub fn repository_name(plan: &BuildPlan, unit_name: &str) -> String {
  sanitize_name(&format!("{}-{}", plan.name, unit_name))
}

fn cache_references(config: &BuildConfig, repository: &str, tag: &str) -> Vec<ImageReference> {
  let mut refs = Vec::with_capacity(2);
  if config.has_global_access {
    refs.push(ImageReference::new(&config.global_namespace, repository, tag));
  }
  refs.push(ImageReference::new(&config.dev_namespace, repository, tag));
  refs
}

fn cache_push_reference(config: &BuildConfig, repository: &str, tag: &str) -> ImageReference {
  let namespace = if config.has_global_access {
    &config.global_namespace
  } else {
    &config.dev_namespace
  };
  ImageReference::new(namespace, repository, tag)
}

impl StandardTagger {
  pub fn new(config: BuildConfig) -> Self {
    Self { config }
  }
}

impl ImageTagger for StandardTagger {
  fn reference(&self, plan: &BuildPlan, unit_name: &str, unit: &BuildUnit) -> ImageReference {
    if let Some(image) = unit.explicit_image() {
      let explicit = ImageReference::parse(image);
      // Compose images outside the managed namespaces are upstream names, not build targets.
      let in_namespace = explicit.is_in_namespace(&self.config.dev_namespace)
        || explicit.is_in_namespace(&self.config.global_namespace);
      if !plan.is_compose() || in_namespace {
        return explicit;
      }
    }
    ImageReference::new(
      &self.config.dev_namespace,
      &repository_name(plan, unit_name),
      DEFAULT_IMAGE_TAG,
    )
  }

  fn cache_references(&self, plan: &BuildPlan, unit_name: &str, fingerprint: &Fingerprint) -> Vec<ImageReference> {
    cache_references(&self.config, &repository_name(plan, unit_name), &fingerprint.0)
  }

  fn cache_push_reference(&self, plan: &BuildPlan, unit_name: &str, fingerprint: &Fingerprint) -> ImageReference {
    cache_push_reference(&self.config, &repository_name(plan, unit_name), &fingerprint.0)
  }
}

impl VolumeMountTagger {
  pub fn new(config: BuildConfig) -> Self {
    Self { config }
  }

  fn cache_tag(fingerprint: &Fingerprint) -> String {
    format!("{}-{}", VOLUME_MOUNTS_IMAGE_TAG, fingerprint)
  }
}

impl ImageTagger for VolumeMountTagger {
  fn reference(&self, plan: &BuildPlan, unit_name: &str, _unit: &BuildUnit) -> ImageReference {
    ImageReference::new(
      &self.config.dev_namespace,
      &repository_name(plan, unit_name),
      VOLUME_MOUNTS_IMAGE_TAG,
    )
  }

  fn cache_references(&self, plan: &BuildPlan, unit_name: &str, fingerprint: &Fingerprint) -> Vec<ImageReference> {
    cache_references(
      &self.config,
      &repository_name(plan, unit_name),
      &Self::cache_tag(fingerprint),
    )
  }

  fn cache_push_reference(&self, plan: &BuildPlan, unit_name: &str, fingerprint: &Fingerprint) -> ImageReference {
    cache_push_reference(
      &self.config,
      &repository_name(plan, unit_name),
      &Self::cache_tag(fingerprint),
    )
  }
}
