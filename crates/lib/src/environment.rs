//! The exported build environment.
//!
//! Each built unit publishes five variables under `OKTETO_BUILD_<UNIT>`:
//!
//! - `_IMAGE` - full reference, with digest when known
//! - `_REGISTRY` - registry host or namespace
//! - `_REPOSITORY` - repository path
//! - `_TAG` - tag, `latest` when the reference has none
//! - `_SHA` - image digest
//!
//! `<UNIT>` is the unit name uppercased with `-` and `.` mapped to `_`.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use tracing::debug;

use crate::consts::{BUILD_ENV_PREFIX, SMART_BUILD_ENV_VAR};
use crate::expand::VarSource;
use crate::image::ImageReference;

const EXPORT_SUFFIXES: [&str; 5] = ["IMAGE", "REGISTRY", "REPOSITORY", "TAG", "SHA"];

/// The per-invocation variable map, written once per completed unit.
#[derive(Debug, Default)]
pub struct ExportedEnvironment {
  vars: RwLock<BTreeMap<String, String>>,
}

/// `OKTETO_BUILD_<UNIT>` for a unit name.
pub fn unit_prefix(unit_name: &str) -> String {
  let normalized: String = unit_name
    .chars()
    .map(|c| match c {
      '-' | '.' => '_',
      c => c.to_ascii_uppercase(),
    })
    .collect();
  format!("{}_{}", BUILD_ENV_PREFIX, normalized)
}

impl ExportedEnvironment {
  /// A fresh map seeded with the smart-build flag of this run.
  pub fn new(smart_builds_enabled: bool) -> Self {
    let env = Self::default();
    env.set(SMART_BUILD_ENV_VAR, &smart_builds_enabled.to_string());
    env
  }

  /// Record the outputs of a built unit.
  pub fn set_unit(&self, unit_name: &str, reference: &ImageReference) {
    let prefix = unit_prefix(unit_name);
    let entries = [
      ("IMAGE", reference.to_string()),
      ("REGISTRY", reference.registry.clone()),
      ("REPOSITORY", reference.repository.clone()),
      ("TAG", reference.tag_or_latest().to_string()),
      ("SHA", reference.digest.clone().unwrap_or_default()),
    ];

    let mut vars = self.vars.write().unwrap_or_else(PoisonError::into_inner);
    for (suffix, value) in entries {
      let key = format!("{}_{}", prefix, suffix);
      debug!(key = %key, value = %value, "exporting build variable");
      vars.insert(key, value);
    }
  }

  pub fn set(&self, key: &str, value: &str) {
    let mut vars = self.vars.write().unwrap_or_else(PoisonError::into_inner);
    vars.insert(key.to_string(), value.to_string());
  }

  pub fn get(&self, key: &str) -> Option<String> {
    let vars = self.vars.read().unwrap_or_else(PoisonError::into_inner);
    vars.get(key).cloned()
  }

  /// The smart-build flag plus the outputs of `units`, sorted by key.
  pub fn visible_to(&self, units: &[String]) -> BTreeMap<String, String> {
    let vars = self.vars.read().unwrap_or_else(PoisonError::into_inner);
    let mut visible = BTreeMap::new();
    if let Some(flag) = vars.get(SMART_BUILD_ENV_VAR) {
      visible.insert(SMART_BUILD_ENV_VAR.to_string(), flag.clone());
    }
    for unit in units {
      let prefix = unit_prefix(unit);
      for suffix in EXPORT_SUFFIXES {
        let key = format!("{}_{}", prefix, suffix);
        if let Some(value) = vars.get(&key) {
          visible.insert(key, value.clone());
        }
      }
    }
    visible
  }

  /// A point-in-time copy of every exported variable.
  pub fn snapshot(&self) -> BTreeMap<String, String> {
    self.vars.read().unwrap_or_else(PoisonError::into_inner).clone()
  }
}

impl VarSource for ExportedEnvironment {
  fn var(&self, name: &str) -> Option<String> {
    self.get(name)
  }
}
