//! Volume-mount composition: layering host paths onto a built image.
//!
//! Stage 2 of a volume unit's build is a synthesized Dockerfile:
//!
//! ```text
//! FROM <base image>
//! COPY <local path> <remote path>
//! ```
//!
//! built with the plan root as its context.

use std::fmt::Write;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::debug;

use crate::plan::{BuildPlan, BuildUnit, VolumeMount};

/// A synthesized stage-2 Dockerfile. The file is removed on drop.
#[derive(Debug)]
pub struct VolumeDockerfile {
  _dir: TempDir,
  path: PathBuf,
}

impl VolumeDockerfile {
  pub fn path(&self) -> &Path {
    &self.path
  }
}

/// The unit's mounts whose local path currently exists, in declared order.
///
/// Missing paths are dropped silently.
pub fn accessible_mounts(plan: &BuildPlan, unit: &BuildUnit) -> Vec<VolumeMount> {
  unit
    .volumes
    .iter()
    .filter(|mount| {
      let exists = plan.resolve_path(&mount.local_path).exists();
      if !exists {
        debug!(local = %mount.local_path, remote = %mount.remote_path, "skipping missing volume mount");
      }
      exists
    })
    .cloned()
    .collect()
}

/// Dockerfile text layering `mounts` onto `base`.
pub fn volume_dockerfile_content(plan: &BuildPlan, base: &str, mounts: &[VolumeMount]) -> String {
  let mut content = format!("FROM {}\n", base);
  for mount in mounts {
    let local = Path::new(&mount.local_path);
    // The plan root is the build context, so sources must be relative to it.
    let source = local
      .strip_prefix(&plan.root)
      .unwrap_or(local)
      .to_string_lossy()
      .replace('\\', "/");
    let _ = writeln!(content, "COPY {} {}", source, mount.remote_path);
  }
  content
}

/// Write the stage-2 Dockerfile to a fresh temporary directory.
pub fn write_volume_dockerfile(
  plan: &BuildPlan,
  base: &str,
  mounts: &[VolumeMount],
) -> std::io::Result<VolumeDockerfile> {
  let dir = tempfile::Builder::new().prefix("smartbuild-volumes-").tempdir()?;
  let path = dir.path().join("Dockerfile");
  std::fs::write(&path, volume_dockerfile_content(plan, base, mounts))?;
  Ok(VolumeDockerfile { _dir: dir, path })
}
