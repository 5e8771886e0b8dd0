//! Context: the string-keyed configuration map every Tidal component is
//! constructed from.
//!
//! A `Context` resolves lookups against user-supplied overrides first and a
//! built-in default table second, and remembers which keys were defaulted so
//! diagnostics can tell the two apart. Keys are dotted paths
//! (`exporters.events.method`); [`ContextView`] narrows a context to one such
//! prefix so a component receives only its own subtree.
//!
//! Overrides load from a `tidal.toml` file. The TOML tree is flattened into
//! dotted keys with every scalar stringified, which keeps the map uniformly
//! string-typed the way the rest of the system consumes it. Unknown keys pass
//! through untouched to allow forward evolution without warnings.

use regex::Regex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::{fmt, fs};
use tracing::info;

/// Errors raised while resolving context parameters. All of these are fatal
/// at construction time; nothing retries a missing or malformed key.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ContextError {
    #[error("context parameter missing: {0}")]
    Missing(String),
    #[error("context parameter invalid: {0}")]
    Invalid(String),
}

pub type ContextResult<T> = Result<T, ContextError>;

/// Back-end binding selected by a URI-shaped `path` parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathScheme {
    /// `int://`: integrated, in-process back end.
    Integrated(String),
    /// `dylib://`: external plugin; the loader is a separate collaborator.
    Dylib(String),
}

/// Parse a URI-shaped context path (`scheme://rest`).
///
/// Only `int` and `dylib` schemes are understood; anything else (including a
/// bare path with no scheme) reports the offending key as invalid so init can
/// abort with a precise message.
pub fn parse_path(key: &str, value: &str) -> ContextResult<PathScheme> {
    // Unwrap is avoided: the pattern is a compile-time constant.
    let re = Regex::new(r"^([a-z][a-z0-9+.-]*)://(.*)$")
        .map_err(|_| ContextError::Invalid(key.to_string()))?;
    let caps = re
        .captures(value)
        .ok_or_else(|| ContextError::Invalid(key.to_string()))?;
    let rest = caps[2].to_string();
    match &caps[1] {
        "int" => Ok(PathScheme::Integrated(rest)),
        "dylib" => Ok(PathScheme::Dylib(rest)),
        _ => Err(ContextError::Invalid(key.to_string())),
    }
}

#[derive(Debug, Clone, Default)]
pub struct Context {
    defaults: HashMap<String, String>,
    contexts: HashMap<String, String>,
}

impl Context {
    pub fn new() -> Self {
        let mut defaults = HashMap::new();
        for (k, v) in [
            ("path", "int://local"),
            ("scheduler", "fifo"),
            ("scheduler.trigger_event", "dependency"),
            ("exporters.events", "empty"),
            ("exporters.events.method", "empty"),
            ("exporters.tensors", "empty"),
            ("exporters.tensors.method", "empty"),
            ("exporters.schedule", "empty"),
            ("exporters.schedule.method", "empty"),
        ] {
            defaults.insert(k.to_string(), v.to_string());
        }
        Self {
            defaults,
            contexts: HashMap::new(),
        }
    }

    /// Set (or override) one parameter.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.contexts.insert(key.into(), value.into());
    }

    /// Resolve a key: overrides first, defaults second.
    pub fn at(&self, key: &str) -> ContextResult<&str> {
        self.get(key)
            .ok_or_else(|| ContextError::Missing(key.to_string()))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.contexts
            .get(key)
            .or_else(|| self.defaults.get(key))
            .map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.contexts.contains_key(key) || self.defaults.contains_key(key)
    }

    /// True when the key resolves from the default table only.
    pub fn is_default(&self, key: &str) -> bool {
        !self.contexts.contains_key(key) && self.defaults.contains_key(key)
    }

    /// Narrow this context to the subtree under `prefix`.
    pub fn view<'a>(&'a self, prefix: &str) -> ContextView<'a> {
        ContextView {
            context: self,
            prefix: prefix.to_string(),
        }
    }

    /// Parse the back-end binding path (`path` key).
    pub fn signature(&self) -> ContextResult<PathScheme> {
        parse_path("path", self.at("path")?)
    }
}

/// A borrowed view of one dotted-key subtree. `at("method")` on a view with
/// prefix `exporters.events` resolves `exporters.events.method`; views nest.
#[derive(Debug, Clone)]
pub struct ContextView<'a> {
    context: &'a Context,
    prefix: String,
}

impl<'a> ContextView<'a> {
    fn full_key(&self, key: &str) -> String {
        if key.is_empty() {
            self.prefix.clone()
        } else if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}.{}", self.prefix, key)
        }
    }

    pub fn at(&self, key: &str) -> ContextResult<&'a str> {
        let full = self.full_key(key);
        self.context.at(&full)
    }

    pub fn get(&self, key: &str) -> Option<&'a str> {
        self.context.get(&self.full_key(key))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.context.contains(&self.full_key(key))
    }

    /// The value the view's own prefix resolves to (e.g. the exporter name).
    pub fn value(&self) -> ContextResult<&'a str> {
        self.context.at(&self.prefix)
    }

    pub fn view(&self, key: &str) -> ContextView<'a> {
        ContextView {
            context: self.context,
            prefix: self.full_key(key),
        }
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&String> = self
            .defaults
            .keys()
            .chain(self.contexts.keys())
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        keys.dedup();
        for key in keys {
            if let Some(value) = self.get(key) {
                writeln!(f, "{key} = {value}")?;
            }
        }
        Ok(())
    }
}

/// Best-effort config path following platform conventions: prefer a local
/// `tidal.toml`, fall back to the platform config dir.
pub fn discover() -> PathBuf {
    let local = PathBuf::from("tidal.toml");
    if local.exists() {
        return local;
    }
    if let Some(dir) = dirs::config_dir() {
        return dir.join("tidal").join("tidal.toml");
    }
    PathBuf::from("tidal.toml")
}

/// Load a context, applying TOML overrides from `path` (or the discovered
/// location) when the file exists. A missing file yields plain defaults; a
/// malformed file is an invalid-context error.
pub fn load_from(path: Option<PathBuf>) -> ContextResult<Context> {
    let path = path.unwrap_or_else(discover);
    let mut context = Context::new();
    let Ok(content) = fs::read_to_string(&path) else {
        return Ok(context);
    };
    let value: toml::Value = toml::from_str(&content)
        .map_err(|_| ContextError::Invalid(path.display().to_string()))?;
    flatten_into(&mut context, "", &value);
    info!(target: "config", path = %path.display(), "context overrides loaded");
    Ok(context)
}

fn flatten_into(context: &mut Context, prefix: &str, value: &toml::Value) {
    match value {
        toml::Value::Table(table) => {
            for (key, sub) in table {
                let full = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten_into(context, &full, sub);
            }
        }
        toml::Value::String(s) => context.set(prefix, s.clone()),
        other => context.set(prefix, other.to_string()),
    }
}
