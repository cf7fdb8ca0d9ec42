//! Connection-level configuration.
//!
//! Sources, lowest to highest precedence: `Default`, a TOML file or string, then `FLEXDOC_*`
//! environment variables via [`ConnectionConfig::with_env_overrides`].

use bson::Document;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

use crate::errors::DbError;
use crate::translate::CompositePolicy;

/// Key convention applied to serialized payloads before they are written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldNaming {
    #[default]
    AsIs,
    Lowercase,
    SnakeCase,
    CamelCase,
}

impl FieldNaming {
    #[must_use]
    pub fn apply(self, key: &str) -> String {
        match self {
            Self::AsIs => key.to_string(),
            Self::Lowercase => key.to_lowercase(),
            Self::SnakeCase => {
                let mut out = String::with_capacity(key.len() + 4);
                let mut prev_lower = false;
                for c in key.chars() {
                    if c.is_uppercase() {
                        if prev_lower {
                            out.push('_');
                        }
                        out.extend(c.to_lowercase());
                        prev_lower = false;
                    } else {
                        prev_lower = c.is_lowercase() || c.is_ascii_digit();
                        out.push(c);
                    }
                }
                out
            }
            Self::CamelCase => {
                let mut out = String::with_capacity(key.len());
                let mut upper_next = false;
                for (i, c) in key.chars().enumerate() {
                    if c == '_' || c == '-' {
                        upper_next = i > 0;
                    } else if upper_next {
                        out.extend(c.to_uppercase());
                        upper_next = false;
                    } else if out.is_empty() {
                        out.extend(c.to_lowercase());
                    } else {
                        out.push(c);
                    }
                }
                out
            }
        }
    }

    /// Renames the top-level keys of `doc`; `_id` is never renamed.
    #[must_use]
    pub fn rename_keys(self, doc: Document) -> Document {
        if self == Self::AsIs {
            return doc;
        }
        doc.into_iter()
            .map(|(k, v)| if k == "_id" { (k, v) } else { (self.apply(&k), v) })
            .collect()
    }
}

impl FromStr for FieldNaming {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "as_is" | "asis" | "" => Ok(Self::AsIs),
            "lowercase" | "lower" => Ok(Self::Lowercase),
            "snake_case" | "snake" => Ok(Self::SnakeCase),
            "camel_case" | "camel" => Ok(Self::CamelCase),
            other => Err(DbError::Config(format!("unknown field naming {other}"))),
        }
    }
}

/// How `save` writes a document that already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveMode {
    /// Full-document replace-or-insert.
    #[default]
    Replace,
    /// Legacy `$set` upsert that leaves unmentioned fields in place.
    Merge,
}

impl FromStr for SaveMode {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "replace" => Ok(Self::Replace),
            "merge" => Ok(Self::Merge),
            other => Err(DbError::Config(format!("unknown save mode {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub field_naming: FieldNaming,
    pub composite_policy: CompositePolicy,
    pub save_mode: SaveMode,
    pub disable_tx: bool,
    pub fetch_batch_size: usize,
    pub blob_chunk_size: u32,
    pub watch_poll_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            field_naming: FieldNaming::AsIs,
            composite_policy: CompositePolicy::Permissive,
            save_mode: SaveMode::Replace,
            disable_tx: false,
            fetch_batch_size: 64,
            blob_chunk_size: 1024,
            watch_poll_ms: 200,
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>, DbError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(s) => s
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| DbError::Config(format!("{key}: {e}"))),
        Err(_) => Ok(None),
    }
}

impl ConnectionConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, DbError> {
        toml::from_str(s).map_err(|e| DbError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, DbError> {
        let s = std::fs::read_to_string(path)?;
        Self::from_toml_str(&s)
    }

    /// Applies `FLEXDOC_*` variables on top of `self`.
    pub fn with_env_overrides(mut self) -> Result<Self, DbError> {
        if let Some(v) = env_parse::<FieldNaming>("FLEXDOC_FIELD_NAMING")? {
            self.field_naming = v;
        }
        if let Some(v) = env_parse::<CompositePolicy>("FLEXDOC_COMPOSITE_POLICY")? {
            self.composite_policy = v;
        }
        if let Some(v) = env_parse::<SaveMode>("FLEXDOC_SAVE_MODE")? {
            self.save_mode = v;
        }
        if let Ok(s) = std::env::var("FLEXDOC_DISABLE_TX") {
            self.disable_tx = matches!(s.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Some(v) = env_parse::<usize>("FLEXDOC_FETCH_BATCH")? {
            self.fetch_batch_size = v;
        }
        if let Some(v) = env_parse::<u32>("FLEXDOC_BLOB_CHUNK")? {
            self.blob_chunk_size = v;
        }
        self.validate()
    }

    pub fn validate(self) -> Result<Self, DbError> {
        if self.fetch_batch_size == 0 {
            return Err(DbError::Config("fetch_batch_size must be positive".into()));
        }
        if self.blob_chunk_size == 0 {
            return Err(DbError::Config("blob_chunk_size must be positive".into()));
        }
        Ok(self)
    }
}
