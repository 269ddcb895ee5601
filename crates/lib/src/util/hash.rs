//! Hashing utilities for build fingerprints.
//!
//! This module provides:
//! - `ContentHash`: A full 64-character SHA-256 hex digest
//! - `hash_directory()`: Deterministic build-context hashing honouring `.dockerignore`
//! - `hash_file()`: Single file hashing
//! - `hash_bytes()`: Arbitrary byte hashing

use std::fs;
use std::io::Read;
use std::path::Path;

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::consts::DOCKERIGNORE_FILE;

/// A full 64-character SHA-256 hash.
///
/// # Format
///
/// The hash is a lowercase hexadecimal string (64 characters).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub String);

impl std::fmt::Display for ContentHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Error during directory hashing.
#[derive(Debug, thiserror::Error)]
pub enum DirHashError {
  #[error("failed to walk directory: {message}")]
  WalkDir { message: String },

  #[error("failed to read file {path}: {message}")]
  ReadFile { path: String, message: String },

  #[error("failed to read symlink {path}: {message}")]
  ReadSymlink { path: String, message: String },

  #[error("invalid ignore file {path}: {message}")]
  Ignore { path: String, message: String },
}

/// Load the `.dockerignore` at the root of a build context.
///
/// A missing file yields an empty matcher.
pub fn load_dockerignore(context: &Path) -> Result<Gitignore, DirHashError> {
  let mut builder = GitignoreBuilder::new(context);
  let file = context.join(DOCKERIGNORE_FILE);
  if file.is_file()
    && let Some(err) = builder.add(&file)
  {
    return Err(DirHashError::Ignore {
      path: file.display().to_string(),
      message: err.to_string(),
    });
  }
  builder.build().map_err(|e| DirHashError::Ignore {
    path: file.display().to_string(),
    message: e.to_string(),
  })
}

/// Compute a deterministic hash of a build context.
///
/// The hash includes:
/// - File contents (not metadata like timestamps or permissions)
/// - Directory structure
/// - Symlink targets
///
/// Entries matched by the context's `.dockerignore`, or whose file name is in
/// `exclude`, are skipped along with everything beneath them. Entries are
/// sorted by path for determinism.
///
/// # Example
///
/// ```ignore
/// let hash = hash_directory(&context, &[".git"])?;
/// ```
pub fn hash_directory(path: &Path, exclude: &[&str]) -> Result<ContentHash, DirHashError> {
  let ignore = load_dockerignore(path)?;
  let mut entries: Vec<(String, String)> = Vec::new();

  let walker = WalkDir::new(path).sort_by_file_name().into_iter().filter_entry(|e| {
    if e.depth() == 0 {
      return true;
    }
    let excluded = e.file_name().to_str().is_some_and(|name| exclude.contains(&name));
    !excluded && !ignore.matched(e.path(), e.file_type().is_dir()).is_ignore()
  });

  for entry in walker {
    let entry = entry.map_err(|e| DirHashError::WalkDir { message: e.to_string() })?;
    let entry_path = entry.path();

    let rel_path = entry_path
      .strip_prefix(path)
      .unwrap_or(entry_path)
      .to_string_lossy()
      .replace('\\', "/");

    if rel_path.is_empty() {
      continue;
    }

    let file_type = entry.file_type();
    let entry_hash = if file_type.is_file() {
      let content_hash = hash_file(entry_path)?;
      format!("F:{}:{}", rel_path, content_hash.0)
    } else if file_type.is_dir() {
      format!("D:{}", rel_path)
    } else if file_type.is_symlink() {
      let target = fs::read_link(entry_path).map_err(|e| DirHashError::ReadSymlink {
        path: entry_path.display().to_string(),
        message: e.to_string(),
      })?;
      let target_hash = hash_bytes(target.to_string_lossy().as_bytes());
      format!("L:{}:{}", rel_path, target_hash.0)
    } else {
      // Sockets, devices and fifos carry no buildable content
      continue;
    };

    entries.push((rel_path, entry_hash));
  }

  entries.sort_by(|a, b| a.0.cmp(&b.0));

  let mut hasher = Sha256::new();
  for (_, entry_hash) in entries {
    hasher.update(entry_hash.as_bytes());
    hasher.update(b"\n");
  }

  Ok(ContentHash(hex::encode(hasher.finalize())))
}

/// Hash a file's contents.
pub fn hash_file(path: &Path) -> Result<ContentHash, DirHashError> {
  let mut file = fs::File::open(path).map_err(|e| DirHashError::ReadFile {
    path: path.display().to_string(),
    message: e.to_string(),
  })?;

  let mut hasher = Sha256::new();
  let mut buffer = [0u8; 8192];

  loop {
    let bytes_read = file.read(&mut buffer).map_err(|e| DirHashError::ReadFile {
      path: path.display().to_string(),
      message: e.to_string(),
    })?;
    if bytes_read == 0 {
      break;
    }
    hasher.update(&buffer[..bytes_read]);
  }

  Ok(ContentHash(hex::encode(hasher.finalize())))
}

/// Hash arbitrary bytes.
pub fn hash_bytes(data: &[u8]) -> ContentHash {
  let mut hasher = Sha256::new();
  hasher.update(data);
  ContentHash(hex::encode(hasher.finalize()))
}
