use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

pub const SECRET_ENV_PREFIX: &str = "SWEEP_SECRET_";

/// In-memory secrets keyed by a normalized name. Nothing here is persisted.
#[derive(Clone, Default)]
pub struct SecretVault {
    values: Arc<RwLock<HashMap<String, String>>>,
}

fn normalize(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

impl SecretVault {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collects every `SWEEP_SECRET_<NAME>` variable.
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    pub fn from_vars(vars: impl IntoIterator<Item = (String, String)>) -> Self {
        let vault = Self::new();
        for (key, value) in vars {
            if let Some(name) = key.strip_prefix(SECRET_ENV_PREFIX) {
                vault.set(name, value);
            }
        }
        vault
    }

    /// Blank names and values are ignored.
    pub fn set(&self, name: &str, value: impl Into<String>) -> bool {
        let name = normalize(name);
        let value = value.into();
        if name.is_empty() || value.trim().is_empty() {
            return false;
        }
        self.values.write().insert(name, value);
        true
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.values.read().get(&normalize(name)).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.read().contains_key(&normalize(name))
    }

    pub fn missing(&self, required: &[String]) -> Vec<String> {
        let values = self.values.read();
        required
            .iter()
            .filter(|name| !values.contains_key(&normalize(name)))
            .cloned()
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.values.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for SecretVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretVault")
            .field("names", &self.names())
            .finish()
    }
}
