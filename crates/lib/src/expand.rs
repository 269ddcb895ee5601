//! Shell-style variable expansion for plan values.
//!
//! Build arguments, images and deploy commands may reference variables that
//! are only known at build time, most notably the per-unit outputs exported
//! by the orchestrator (`$OKTETO_BUILD_API_IMAGE`).
//!
//! # Supported Forms
//!
//! - `$NAME` and `${NAME}` - value of `NAME`, empty when unset
//! - `${NAME:-default}` - value of `NAME`, or `default` when unset or empty
//! - `$$` - a literal `$`
//!
//! A `$` that is not followed by a variable name passes through unchanged.
//!
//! # Example
//!
//! ```
//! use std::collections::BTreeMap;
//! use smartbuild_lib::expand::expand;
//!
//! let mut vars = BTreeMap::new();
//! vars.insert("BAR".to_string(), "bar".to_string());
//! assert_eq!(expand("foo-$BAR-${BAZ:-baz}", &vars).unwrap(), "foo-bar-baz");
//! ```

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;

/// Errors that can occur while expanding a value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpandError {
  #[error("unclosed variable reference at position {position} in '{input}'")]
  Unclosed { input: String, position: usize },

  #[error("invalid variable name '{name}' in '{input}'")]
  InvalidName { input: String, name: String },
}

/// A source of variable values.
pub trait VarSource {
  fn var(&self, name: &str) -> Option<String>;
}

/// Variables of the current process.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl VarSource for ProcessEnv {
  fn var(&self, name: &str) -> Option<String> {
    std::env::var(name).ok()
  }
}

impl VarSource for BTreeMap<String, String> {
  fn var(&self, name: &str) -> Option<String> {
    self.get(name).cloned()
  }
}

impl VarSource for HashMap<String, String> {
  fn var(&self, name: &str) -> Option<String> {
    self.get(name).cloned()
  }
}

/// Two sources consulted in order; the first one that knows a name wins.
pub struct Layered<'a> {
  pub first: &'a dyn VarSource,
  pub second: &'a dyn VarSource,
}

impl<'a> Layered<'a> {
  pub fn new(first: &'a dyn VarSource, second: &'a dyn VarSource) -> Self {
    Self { first, second }
  }
}

impl VarSource for Layered<'_> {
  fn var(&self, name: &str) -> Option<String> {
    self.first.var(name).or_else(|| self.second.var(name))
  }
}

fn is_name_start(c: char) -> bool {
  c == '_' || c.is_ascii_alphabetic()
}

fn is_name_char(c: char) -> bool {
  c == '_' || c.is_ascii_alphanumeric()
}

/// Expand every variable reference in `input` against `vars`.
pub fn expand(input: &str, vars: &dyn VarSource) -> Result<String, ExpandError> {
  let mut out = String::with_capacity(input.len());
  let mut chars = input.char_indices().peekable();

  while let Some((pos, ch)) = chars.next() {
    if ch != '$' {
      out.push(ch);
      continue;
    }

    match chars.peek() {
      Some((_, '$')) => {
        chars.next();
        out.push('$');
      }
      Some((_, '{')) => {
        chars.next();

        let mut body = String::new();
        let mut found_close = false;
        for (_, c) in chars.by_ref() {
          if c == '}' {
            found_close = true;
            break;
          }
          body.push(c);
        }

        if !found_close {
          return Err(ExpandError::Unclosed {
            input: input.to_string(),
            position: pos,
          });
        }

        let (name, default) = match body.split_once(":-") {
          Some((name, default)) => (name, Some(default)),
          None => (body.as_str(), None),
        };

        if name.is_empty() || !name.starts_with(is_name_start) || !name.chars().all(is_name_char) {
          return Err(ExpandError::InvalidName {
            input: input.to_string(),
            name: name.to_string(),
          });
        }

        let value = vars.var(name).filter(|v| !(default.is_some() && v.is_empty()));
        match (value, default) {
          (Some(v), _) => out.push_str(&v),
          (None, Some(d)) => out.push_str(&expand(d, vars)?),
          (None, None) => {}
        }
      }
      Some(&(_, c)) if is_name_start(c) => {
        let mut name = String::new();
        while let Some(&(_, c)) = chars.peek() {
          if !is_name_char(c) {
            break;
          }
          name.push(c);
          chars.next();
        }
        if let Some(v) = vars.var(&name) {
          out.push_str(&v);
        }
      }
      _ => out.push('$'),
    }
  }

  Ok(out)
}
