//! Image references and name sanitising.

use serde::{Deserialize, Serialize};

use crate::consts::DEFAULT_REGISTRY;

/// A parsed image reference: `[registry/]repository[:tag][@digest]`.
///
/// The registry is `docker.io` when the reference names none; such references
/// render back without it, so parsing and displaying round-trips.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageReference {
  pub registry: String,
  pub repository: String,
  pub tag: Option<String>,
  pub digest: Option<String>,
  #[serde(skip)]
  implicit_registry: bool,
}

impl ImageReference {
  /// Parse an image reference.
  ///
  /// The first path component is a registry host when it contains a `.` or a
  /// `:`, or is `localhost`.
  pub fn parse(image: &str) -> Self {
    let (name_tag, digest) = match image.split_once('@') {
      Some((name, digest)) => (name, Some(digest.to_string())),
      None => (image, None),
    };

    // A ':' after the last '/' separates the tag; earlier ones belong to a registry port.
    let last_slash = name_tag.rfind('/').map(|i| i + 1).unwrap_or(0);
    let (name, tag) = match name_tag[last_slash..].rfind(':') {
      Some(i) => (&name_tag[..last_slash + i], Some(name_tag[last_slash + i + 1..].to_string())),
      None => (name_tag, None),
    };

    let (registry, repository, implicit_registry) = match name.split_once('/') {
      Some((first, rest)) if first.contains('.') || first.contains(':') || first == "localhost" => {
        (first.to_string(), rest.to_string(), false)
      }
      _ => (DEFAULT_REGISTRY.to_string(), name.to_string(), true),
    };

    Self {
      registry,
      repository,
      tag,
      digest,
      implicit_registry,
    }
  }

  /// Build a reference from its parts.
  pub fn new(registry: &str, repository: &str, tag: &str) -> Self {
    Self {
      registry: registry.to_string(),
      repository: repository.to_string(),
      tag: Some(tag.to_string()),
      digest: None,
      implicit_registry: false,
    }
  }

  /// `registry/repository` (or just `repository` for implicit registries).
  pub fn name(&self) -> String {
    if self.implicit_registry {
      self.repository.clone()
    } else {
      format!("{}/{}", self.registry, self.repository)
    }
  }

  /// The reference without its digest.
  pub fn tagged(&self) -> String {
    match &self.tag {
      Some(tag) => format!("{}:{}", self.name(), tag),
      None => self.name(),
    }
  }

  /// The tag, or `latest` when none is set.
  pub fn tag_or_latest(&self) -> &str {
    self.tag.as_deref().unwrap_or("latest")
  }

  pub fn with_digest(mut self, digest: &str) -> Self {
    self.digest = Some(digest.to_string());
    self
  }

  /// The digest when known, otherwise the tagged name.
  ///
  /// Two references reaching the same pushed image through different tags or
  /// namespaces share a digest, so this identifies content rather than a name.
  pub fn content_identity(&self) -> String {
    self.digest.clone().unwrap_or_else(|| self.tagged())
  }

  /// Whether this reference lives under the given registry namespace (e.g. `okteto.dev`).
  pub fn is_in_namespace(&self, namespace: &str) -> bool {
    let namespace = namespace.trim_end_matches('/');
    !namespace.is_empty() && self.name().starts_with(&format!("{}/", namespace))
  }
}

impl std::fmt::Display for ImageReference {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.tagged())?;
    if let Some(digest) = &self.digest {
      write!(f, "@{}", digest)?;
    }
    Ok(())
  }
}

/// Sanitise a name for use as an image repository component.
///
/// Lowercases, maps every character outside `[a-z0-9-]` to `-`, collapses
/// runs of `-` and trims them from both ends.
pub fn sanitize_name(name: &str) -> String {
  let mut out = String::with_capacity(name.len());
  for c in name.chars() {
    let c = c.to_ascii_lowercase();
    let c = if c.is_ascii_lowercase() || c.is_ascii_digit() { c } else { '-' };
    if c == '-' && out.ends_with('-') {
      continue;
    }
    out.push(c);
  }
  out.trim_matches('-').to_string()
}
