//! In-memory collaborators for tests.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::cancel::CancelToken;
use crate::consts::{DEV_REGISTRY_NAMESPACE, GLOBAL_REGISTRY_NAMESPACE};
use crate::executor::{Builder, ExecuteOptions, ExecutorError};
use crate::image::ImageReference;
use crate::registry::{Registry, RegistryError};
use crate::repository::{Repository, RepositoryError};
use crate::util::hash::hash_bytes;

/// A repository at a fixed commit.
#[derive(Debug, Clone)]
pub struct FakeRepository {
  commit: Option<String>,
  clean: bool,
}

impl FakeRepository {
  /// A clean checkout at `commit`.
  pub fn at(commit: &str) -> Self {
    Self {
      commit: Some(commit.to_string()),
      clean: true,
    }
  }

  /// A repository whose every query fails.
  pub fn failing() -> Self {
    Self {
      commit: None,
      clean: false,
    }
  }

  pub fn dirty(mut self) -> Self {
    self.clean = false;
    self
  }
}

impl Repository for FakeRepository {
  fn commit_id(&self) -> Result<String, RepositoryError> {
    self
      .commit
      .clone()
      .ok_or_else(|| RepositoryError::ResolveHead("no HEAD".to_string()))
  }

  fn is_clean(&self) -> Result<bool, RepositoryError> {
    match self.commit {
      Some(_) => Ok(self.clean),
      None => Err(RepositoryError::Status("no repository".to_string())),
    }
  }
}

/// A registry holding tagged references and their digests.
#[derive(Debug, Default)]
pub struct FakeRegistry {
  images: Mutex<BTreeMap<String, String>>,
  clones: AtomicUsize,
  fail_clones: bool,
}

impl FakeRegistry {
  pub fn failing_clones(mut self) -> Self {
    self.fail_clones = true;
    self
  }

  /// Store `image` (a tagged reference) under a digest derived from its name.
  pub fn publish(&self, image: &str) -> String {
    let tagged = ImageReference::parse(image).tagged();
    let digest = format!("sha256:{}", hash_bytes(tagged.as_bytes()));
    self.publish_as(&tagged, &digest);
    digest
  }

  /// Store `image` under a given digest, as a push of already-built content does.
  pub fn publish_as(&self, image: &str, digest: &str) {
    let tagged = ImageReference::parse(image).tagged();
    self.images.lock().unwrap().insert(tagged, digest.to_string());
  }

  pub fn clone_count(&self) -> usize {
    self.clones.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl Registry for FakeRegistry {
  async fn resolve_digest(&self, image: &str) -> Result<ImageReference, RegistryError> {
    let reference = ImageReference::parse(image);
    let images = self.images.lock().unwrap();
    match images.get(&reference.tagged()) {
      Some(digest) => Ok(reference.with_digest(digest)),
      None => Err(RegistryError::NotFound(image.to_string())),
    }
  }

  fn is_shared_registry(&self, image: &ImageReference) -> bool {
    image.is_in_namespace(GLOBAL_REGISTRY_NAMESPACE)
  }

  async fn clone_to_private(&self, image: &ImageReference, tag: &str) -> Result<ImageReference, RegistryError> {
    if self.fail_clones {
      return Err(RegistryError::Request {
        reference: image.to_string(),
        message: "clone refused".to_string(),
      });
    }
    self.clones.fetch_add(1, Ordering::SeqCst);
    let private = ImageReference::new(DEV_REGISTRY_NAMESPACE, &image.repository, tag);
    let digest = match &image.digest {
      Some(digest) => {
        self.publish_as(&private.tagged(), digest);
        digest.clone()
      }
      None => self.publish(&private.tagged()),
    };
    Ok(private.with_digest(&digest))
  }
}

/// A recorded builder invocation.
#[derive(Debug, Clone)]
pub struct BuildCall {
  pub options: ExecuteOptions,
  /// Dockerfile text at the time of the call.
  pub dockerfile_content: Option<String>,
}

/// A builder that "pushes" every tag into a [`FakeRegistry`].
pub struct FakeBuilder {
  registry: Arc<FakeRegistry>,
  calls: Mutex<Vec<BuildCall>>,
  fail_tag: Option<String>,
  delay: Option<Duration>,
}

impl FakeBuilder {
  pub fn new(registry: Arc<FakeRegistry>) -> Self {
    Self {
      registry,
      calls: Mutex::new(Vec::new()),
      fail_tag: None,
      delay: None,
    }
  }

  /// Fail any build whose primary tag contains `fragment`.
  pub fn failing_on(mut self, fragment: &str) -> Self {
    self.fail_tag = Some(fragment.to_string());
    self
  }

  /// Sleep for `delay` before each build completes.
  pub fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = Some(delay);
    self
  }

  pub fn calls(&self) -> Vec<BuildCall> {
    self.calls.lock().unwrap().clone()
  }

  pub fn call_count(&self) -> usize {
    self.calls.lock().unwrap().len()
  }

  /// Primary tags in call order.
  pub fn built_tags(&self) -> Vec<String> {
    self.calls().iter().map(|c| c.options.primary_tag().to_string()).collect()
  }
}

#[async_trait]
impl Builder for FakeBuilder {
  async fn execute(&self, options: &ExecuteOptions, cancel: &CancelToken) -> Result<(), ExecutorError> {
    self.calls.lock().unwrap().push(BuildCall {
      options: options.clone(),
      dockerfile_content: std::fs::read_to_string(&options.dockerfile).ok(),
    });

    if let Some(delay) = self.delay {
      cancel
        .run(tokio::time::sleep(delay))
        .await
        .map_err(|_| ExecutorError::Cancelled)?;
    }

    if let Some(fragment) = &self.fail_tag
      && options.primary_tag().contains(fragment.as_str())
    {
      return Err(ExecutorError::Failed {
        tag: options.primary_tag().to_string(),
        message: "exit status 1".to_string(),
      });
    }

    // Every tag of one build names the same content.
    let digest = format!("sha256:{}", hash_bytes(options.tags.join(",").as_bytes()));
    for tag in &options.tags {
      self.registry.publish_as(tag, &digest);
    }
    Ok(())
  }
}
