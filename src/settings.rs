//! Generic key-value settings blob.
//!
//! Adapters persist and restore their configuration through this map; the
//! application decides where the blob itself lives (file, registry row,
//! whatever the settings layer provides).

use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A typed view over a JSON key-value map.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct Settings {
    values: BTreeMap<String, serde_json::Value>,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value under `key`, replacing any previous one.
    pub fn set<T: Serialize>(&mut self, key: &str, value: &T) -> Result<()> {
        self.values
            .insert(key.to_string(), serde_json::to_value(value)?);
        Ok(())
    }

    /// Typed read; `None` when the key is absent or the value does not
    /// deserialize as `T`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.values.get(key)?;
        serde_json::from_value(value.clone()).ok()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Serialize the whole blob.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Restore a blob serialized with [`Settings::to_json`].
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
