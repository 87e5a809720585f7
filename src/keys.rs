use std::env;
use std::fmt;

use tracing::info;

use crate::error::{PipelineError, Result};

/// Backend settings for a single generation call.
///
/// Never mutated: a rotation hands out a fresh value built from the next key.
#[derive(Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub api_key: String,
    pub model: String,
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("api_key", &key_hint(&self.api_key))
            .field("model", &self.model)
            .finish()
    }
}

pub fn key_hint(key: &str) -> String {
    let prefix: String = key.chars().take(4).collect();
    format!("{}...", prefix)
}

/// Ordered pool of API keys with a forward-only cursor.
///
/// Once the last key has been rotated past, the pool stays exhausted for the rest of the process.
#[derive(Debug)]
pub struct KeyRotationManager {
    keys: Vec<String>,
    cursor: usize,
}

impl KeyRotationManager {
    /// Reads `GEMINI_API_KEYS`, falling back to the single `GEMINI_API_KEY`.
    pub fn from_env() -> Result<Self> {
        let raw = env::var("GEMINI_API_KEYS").unwrap_or_default();
        let mut keys = parse_keys(&raw);

        if keys.is_empty() {
            if let Ok(single) = env::var("GEMINI_API_KEY") {
                keys = parse_keys(&single);
            }
        }

        Self::from_keys(keys).map_err(|_| {
            PipelineError::Configuration(
                "No API key found. Set GEMINI_API_KEYS (comma-separated) or GEMINI_API_KEY in .env"
                    .to_string(),
            )
        })
    }

    #[cfg(test)]
    pub fn from_raw(raw: &str) -> Result<Self> {
        Self::from_keys(parse_keys(raw))
    }

    pub fn from_keys(keys: Vec<String>) -> Result<Self> {
        if keys.is_empty() {
            return Err(PipelineError::Configuration(
                "API key pool is empty".to_string(),
            ));
        }
        info!(count = keys.len(), "API key pool loaded");
        Ok(Self { keys, cursor: 0 })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn position(&self) -> usize {
        self.cursor
    }

    pub fn current_key(&self) -> Result<&str> {
        self.keys
            .get(self.cursor)
            .map(String::as_str)
            .ok_or(PipelineError::PoolExhausted(self.cursor))
    }

    pub fn client_config(&self, model: &str) -> Result<ClientConfig> {
        Ok(ClientConfig {
            api_key: self.current_key()?.to_string(),
            model: model.to_string(),
        })
    }

    /// Advances to the next key. Returns `false` when already on the last one.
    pub fn rotate(&mut self) -> bool {
        if self.cursor + 1 < self.keys.len() {
            self.cursor += 1;
            println!(
                "   Quota limit hit. Switching to key #{} ({})",
                self.cursor + 1,
                key_hint(&self.keys[self.cursor])
            );
            return true;
        }
        false
    }
}

/// Splits a comma-separated key list. Newlines, quotes and blank entries are dropped.
fn parse_keys(raw: &str) -> Vec<String> {
    raw.replace(['\n', '\r'], "")
        .split(',')
        .map(|k| k.trim().trim_matches(|c: char| c == '"' || c == '\'').trim().to_string())
        .filter(|k| !k.is_empty())
        .collect()
}
