//! Cache keys for build units.
//!
//! Three layered fingerprints are derived per unit:
//!
//! - the *commit fingerprint* hashes the commit id plus the unit's declared
//!   inputs, with build-argument values materialized first;
//! - the *context fingerprint* hashes the build context's file contents and
//!   the Dockerfile bytes plus the same declared inputs, so uncommitted edits
//!   still change the key;
//! - the *service fingerprint* combines both with the unit's volume mounts
//!   and is the key cache lookups use.
//!
//! # Commit Fingerprint Grammar
//!
//! ```text
//! commit:<sha>;target:<target>;build_args:<k1>=<v1>;<k2>=<v2>;secrets:<k>=<v>;context:<c>;dockerfile:<d>;image:<i>;
//! ```
//!
//! Build arguments keep their declared order and secrets are sorted by id. A
//! section with no entries emits its label followed by `;`.
//!
//! None of these operations fail: a commit lookup error hashes an empty
//! commit id and an unreadable context hashes as empty content.

use std::collections::HashMap;
use std::fmt::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::consts::CONTEXT_HASH_EXCLUSIONS;
use crate::expand::VarSource;
use crate::plan::{BuildArg, BuildPlan, BuildUnit};
use crate::repository::Repository;
use crate::util::hash::{hash_bytes, hash_directory, hash_file};

/// A deterministic cache key (64 lowercase hex characters).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub String);

impl std::fmt::Display for Fingerprint {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Computes fingerprints for the units of one invocation.
pub struct Fingerprinter {
  repository: Arc<dyn Repository>,
  context_cache: Mutex<HashMap<PathBuf, String>>,
}

impl Fingerprinter {
  pub fn new(repository: Arc<dyn Repository>) -> Self {
    Self {
      repository,
      context_cache: Mutex::new(HashMap::new()),
    }
  }

  /// The current commit id, or the empty string when it cannot be resolved.
  pub fn commit_id(&self) -> String {
    match self.repository.commit_id() {
      Ok(id) => id,
      Err(e) => {
        warn!(error = %e, "could not resolve commit id, fingerprinting without it");
        String::new()
      }
    }
  }

  /// Fingerprint of the unit's declared inputs at the current commit.
  pub fn commit_fingerprint(&self, unit: &BuildUnit, vars: &dyn VarSource) -> Fingerprint {
    let mut input = format!("commit:{};", self.commit_id());
    push_unit_fields(&mut input, unit, &materialized_args(unit, vars));
    Fingerprint(hash_bytes(input.as_bytes()).0)
  }

  /// Fingerprint of the unit's build context contents and declared inputs.
  pub fn context_fingerprint(&self, plan: &BuildPlan, unit: &BuildUnit, vars: &dyn VarSource) -> Fingerprint {
    let dockerfile_hash = unit
      .dockerfile
      .as_deref()
      .filter(|d| !d.is_empty())
      .and_then(|d| {
        let path = plan.resolve_path(d);
        hash_file(&path)
          .inspect_err(|e| debug!(error = %e, "dockerfile not hashed"))
          .ok()
      })
      .map(|h| h.0)
      .unwrap_or_default();

    let mut input = format!(
      "build_context:{};dockerfile_content:{};",
      self.context_hash(plan.resolve_path(&unit.context)),
      dockerfile_hash
    );
    push_unit_fields(&mut input, unit, &materialized_args(unit, vars));
    Fingerprint(hash_bytes(input.as_bytes()).0)
  }

  /// The cache key of a unit.
  pub fn service_fingerprint(&self, plan: &BuildPlan, unit: &BuildUnit, vars: &dyn VarSource) -> Fingerprint {
    let commit = self.commit_fingerprint(unit, vars);
    let context = self.context_fingerprint(plan, unit, vars);

    let mut input = format!("commit:{};build_context:{};", commit, context);
    push_section(
      &mut input,
      "volumes",
      unit.volumes.iter().map(|v| (v.local_path.as_str(), v.remote_path.as_str())),
    );
    Fingerprint(hash_bytes(input.as_bytes()).0)
  }

  /// The cache key of a volume unit's layering stage.
  ///
  /// `base` is the content identity of the image the mounts are layered onto
  /// (see [`crate::image::ImageReference::content_identity`]), so the key
  /// does not depend on which tag the base was reached through.
  pub fn volume_stage_fingerprint(
    &self,
    plan: &BuildPlan,
    unit: &BuildUnit,
    base: &str,
    vars: &dyn VarSource,
  ) -> Fingerprint {
    let keyed = BuildUnit {
      image: Some(base.to_string()),
      ..unit.clone()
    };
    self.service_fingerprint(plan, &keyed, vars)
  }

  fn context_hash(&self, context: PathBuf) -> String {
    if let Ok(cache) = self.context_cache.lock()
      && let Some(hash) = cache.get(&context)
    {
      return hash.clone();
    }

    let hash = match hash_directory(&context, CONTEXT_HASH_EXCLUSIONS) {
      Ok(hash) => hash.0,
      Err(e) => {
        warn!(context = %context.display(), error = %e, "could not hash build context");
        String::new()
      }
    };

    if let Ok(mut cache) = self.context_cache.lock() {
      cache.insert(context, hash.clone());
    }
    hash
  }
}

/// Build arguments with values expanded; the raw values are used if expansion fails.
fn materialized_args(unit: &BuildUnit, vars: &dyn VarSource) -> Vec<BuildArg> {
  unit.expanded_args(vars).unwrap_or_else(|e| {
    warn!(error = %e, "could not expand build arguments, hashing declared values");
    unit.args.clone()
  })
}

fn push_unit_fields(out: &mut String, unit: &BuildUnit, args: &[BuildArg]) {
  let _ = write!(out, "target:{};", unit.target.as_deref().unwrap_or_default());
  push_section(out, "build_args", args.iter().map(|a| (a.name.as_str(), a.value.as_str())));
  push_section(out, "secrets", unit.secrets.iter().map(|(k, v)| (k.as_str(), v.as_str())));
  let _ = write!(
    out,
    "context:{};dockerfile:{};image:{};",
    unit.context,
    unit.dockerfile.as_deref().unwrap_or_default(),
    unit.image.as_deref().unwrap_or_default()
  );
}

fn push_section<'a>(out: &mut String, label: &str, entries: impl Iterator<Item = (&'a str, &'a str)>) {
  out.push_str(label);
  out.push(':');
  let mut empty = true;
  for (k, v) in entries {
    let _ = write!(out, "{}={};", k, v);
    empty = false;
  }
  if empty {
    out.push(';');
  }
}
