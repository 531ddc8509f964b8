use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sweep_types::{Configuration, FunctionParams, LaunchParams};
use tokio::fs;
use tokio::sync::RwLock;

use crate::error::ConfigError;

pub const GLOBAL_CONFIG_ENV: &str = "SWEEP_GLOBAL_CONFIG";

/// Named launch configuration. Fields override the top-level defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PresetConfig {
    #[serde(default)]
    pub launch_params: Map<String, Value>,
    #[serde(default)]
    pub function_params: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacingConfig {
    #[serde(default = "default_failure_penalty_secs")]
    pub failure_penalty_secs: f64,
}

fn default_failure_penalty_secs() -> f64 {
    5.0
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            failure_penalty_secs: default_failure_penalty_secs(),
        }
    }
}

impl PacingConfig {
    /// Non-positive or non-finite values disable the penalty; values too
    /// large for a `Duration` are rejected.
    pub fn failure_penalty(&self) -> Result<Duration, ConfigError> {
        let secs = self.failure_penalty_secs;
        if !secs.is_finite() || secs <= 0.0 {
            return Ok(Duration::ZERO);
        }
        Duration::try_from_secs_f64(secs).map_err(|_| ConfigError::InvalidPenalty(secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub launch_params: Map<String, Value>,
    #[serde(default)]
    pub function_params: Map<String, Value>,
    #[serde(default)]
    pub default_preset: Option<String>,
    #[serde(default)]
    pub presets: BTreeMap<String, PresetConfig>,
    #[serde(default)]
    pub pacing: PacingConfig,
}

impl EngineConfig {
    /// Picks the preset (explicit key, then `default_preset`) and validates
    /// the merged result.
    pub fn resolve(&self, key: Option<&str>) -> Result<Configuration, ConfigError> {
        let mut launch = Value::Object(self.launch_params.clone());
        let mut function = Value::Object(self.function_params.clone());

        let key = key
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .or(self.default_preset.as_deref());
        if let Some(key) = key {
            let preset = self
                .presets
                .get(key)
                .ok_or_else(|| ConfigError::UnknownPreset(key.to_string()))?;
            deep_merge(&mut launch, &Value::Object(preset.launch_params.clone()));
            deep_merge(&mut function, &Value::Object(preset.function_params.clone()));
        }

        let has_text = |field: &str| {
            launch
                .get(field)
                .and_then(Value::as_str)
                .map(|s| !s.trim().is_empty())
                .unwrap_or(false)
        };
        if !has_text("group") || !has_text("action") {
            return Err(ConfigError::MissingAction);
        }

        let launch_params: LaunchParams =
            serde_json::from_value(launch).map_err(|err| ConfigError::Invalid(err.to_string()))?;
        if !launch_params.delay.is_valid() {
            return Err(ConfigError::InvalidDelay {
                min: launch_params.delay.min_secs,
                max: launch_params.delay.max_secs,
            });
        }
        let function_params = match function {
            Value::Object(map) => FunctionParams::from(map),
            _ => FunctionParams::default(),
        };
        Ok(Configuration::new(launch_params, function_params))
    }
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    global: Value,
    project: Value,
    env: Value,
    cli: Value,
}

/// Layered JSON configuration: global < project < env < cli.
#[derive(Clone)]
pub struct ConfigStore {
    project_path: PathBuf,
    global_path: PathBuf,
    layers: Arc<RwLock<ConfigLayers>>,
}

impl ConfigStore {
    pub async fn new(path: impl AsRef<Path>, cli_overrides: Option<Value>) -> anyhow::Result<Self> {
        let global_path = resolve_global_config_path();
        Self::new_with_global(path, global_path, cli_overrides).await
    }

    pub async fn new_with_global(
        path: impl AsRef<Path>,
        global_path: impl Into<PathBuf>,
        cli_overrides: Option<Value>,
    ) -> anyhow::Result<Self> {
        let project_path = path.as_ref().to_path_buf();
        let global_path = global_path.into();
        let global = read_json_file(&global_path).await?;
        let project = read_json_file(&project_path).await?;

        let layers = ConfigLayers {
            global,
            project,
            env: env_layer(),
            cli: cli_overrides.unwrap_or_else(empty_object),
        };
        Ok(Self {
            project_path,
            global_path,
            layers: Arc::new(RwLock::new(layers)),
        })
    }

    pub fn project_path(&self) -> &Path {
        &self.project_path
    }

    pub fn global_path(&self) -> &Path {
        &self.global_path
    }

    pub async fn get(&self) -> Result<EngineConfig, ConfigError> {
        let merged = self.get_effective_value().await;
        serde_json::from_value(merged).map_err(|err| ConfigError::Invalid(err.to_string()))
    }

    pub async fn resolve(&self, key: Option<&str>) -> Result<Configuration, ConfigError> {
        self.get().await?.resolve(key)
    }

    pub async fn get_effective_value(&self) -> Value {
        let layers = self.layers.read().await.clone();
        let mut merged = empty_object();
        deep_merge(&mut merged, &layers.global);
        deep_merge(&mut merged, &layers.project);
        deep_merge(&mut merged, &layers.env);
        deep_merge(&mut merged, &layers.cli);
        merged
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    if !path.exists() {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path).await?;
    match serde_json::from_str::<Value>(&raw) {
        Ok(value) if value.is_object() => Ok(value),
        Ok(_) | Err(_) => {
            tracing::warn!("ignoring unreadable config file {:?}", path);
            Ok(empty_object())
        }
    }
}

fn resolve_global_config_path() -> PathBuf {
    if let Ok(path) = std::env::var(GLOBAL_CONFIG_ENV) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    if let Some(config_dir) = dirs::config_dir() {
        return config_dir.join("sweep").join("config.json");
    }
    PathBuf::from(".sweep/global_config.json")
}

fn env_layer() -> Value {
    env_layer_from(|key| std::env::var(key).ok())
}

fn env_layer_from(var: impl Fn(&str) -> Option<String>) -> Value {
    let mut root = empty_object();
    let text = |key: &str| var(key).filter(|v| !v.trim().is_empty());

    if let Some(group) = text("SWEEP_GROUP") {
        deep_merge(&mut root, &json!({ "launch_params": { "group": group.trim() } }));
    }
    if let Some(action) = text("SWEEP_ACTION") {
        deep_merge(&mut root, &json!({ "launch_params": { "action": action.trim() } }));
    }
    if let Some(shuffle) = text("SWEEP_SHUFFLE").and_then(|v| parse_bool_like(&v)) {
        deep_merge(&mut root, &json!({ "launch_params": { "shuffle": shuffle } }));
    }
    if let Some(min) = text("SWEEP_DELAY_MIN_SECS").and_then(|v| v.trim().parse::<f64>().ok()) {
        deep_merge(
            &mut root,
            &json!({ "launch_params": { "delay": { "min_secs": min } } }),
        );
    }
    if let Some(max) = text("SWEEP_DELAY_MAX_SECS").and_then(|v| v.trim().parse::<f64>().ok()) {
        deep_merge(
            &mut root,
            &json!({ "launch_params": { "delay": { "max_secs": max } } }),
        );
    }
    if let Some(file) = text("SWEEP_ITEMS_FILE") {
        deep_merge(&mut root, &json!({ "launch_params": { "items_file": file.trim() } }));
    }
    if let Some(penalty) =
        text("SWEEP_FAILURE_PENALTY_SECS").and_then(|v| v.trim().parse::<f64>().ok())
    {
        deep_merge(
            &mut root,
            &json!({ "pacing": { "failure_penalty_secs": penalty } }),
        );
    }

    root
}

fn parse_bool_like(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub(crate) fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use sweep_types::DelayBounds;
    use tempfile::tempdir;

    fn engine_config(value: Value) -> EngineConfig {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn preset_overrides_top_level_defaults() {
        let config = engine_config(json!({
            "launch_params": { "group": "builtin", "action": "probe", "delay": { "min_secs": 1, "max_secs": 2 } },
            "function_params": { "latency_ms": 5 },
            "presets": {
                "fan": {
                    "launch_params": { "action": "fanout", "shuffle": true },
                    "function_params": { "per_item_delay_ms": 10 }
                }
            }
        }));

        let base = config.resolve(None).unwrap();
        assert_eq!(base.launch_params.action, "probe");
        assert_eq!(base.launch_params.delay, DelayBounds { min_secs: 1.0, max_secs: 2.0 });

        let fan = config.resolve(Some("fan")).unwrap();
        assert_eq!(fan.launch_params.action, "fanout");
        assert!(fan.launch_params.shuffle);
        assert_eq!(fan.function_params.get("latency_ms"), Some(&json!(5)));
        assert_eq!(fan.function_params.get("per_item_delay_ms"), Some(&json!(10)));

        assert!(matches!(
            config.resolve(Some("missing")),
            Err(ConfigError::UnknownPreset(_))
        ));
    }

    #[test]
    fn resolve_validates_action_and_delay() {
        let empty = EngineConfig::default();
        assert!(matches!(empty.resolve(None), Err(ConfigError::MissingAction)));

        let inverted = engine_config(json!({
            "launch_params": { "group": "builtin", "action": "probe", "delay": { "min_secs": 9, "max_secs": 1 } }
        }));
        assert!(matches!(
            inverted.resolve(None),
            Err(ConfigError::InvalidDelay { .. })
        ));
    }

    #[test]
    fn env_layer_maps_known_variables() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("SWEEP_GROUP", "builtin"),
            ("SWEEP_ACTION", " probe "),
            ("SWEEP_SHUFFLE", "yes"),
            ("SWEEP_DELAY_MIN_SECS", "0"),
            ("SWEEP_FAILURE_PENALTY_SECS", "0.5"),
        ]);
        let layer = env_layer_from(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(layer["launch_params"]["action"], "probe");
        assert_eq!(layer["launch_params"]["shuffle"], true);
        assert_eq!(layer["launch_params"]["delay"]["min_secs"], 0.0);
        assert!(layer["launch_params"]["delay"].get("max_secs").is_none());

        let config: EngineConfig = serde_json::from_value(layer).unwrap();
        assert_eq!(config.pacing.failure_penalty().unwrap(), Duration::from_millis(500));
        let resolved = config.resolve(None).unwrap();
        assert_eq!(resolved.launch_params.delay.max_secs, 15.0);
    }

    #[test]
    fn failure_penalty_rejects_unrepresentable_values() {
        let pacing = |secs: f64| PacingConfig {
            failure_penalty_secs: secs,
        };
        assert_eq!(pacing(-1.0).failure_penalty().unwrap(), Duration::ZERO);
        assert_eq!(pacing(f64::NAN).failure_penalty().unwrap(), Duration::ZERO);
        assert!(matches!(
            pacing(1e30).failure_penalty(),
            Err(ConfigError::InvalidPenalty(_))
        ));
    }

    #[tokio::test]
    async fn cli_layer_wins_over_files() {
        let temp = tempdir().unwrap();
        let project = temp.path().join("config.json");
        let global = temp.path().join("global.json");
        std::fs::write(
            &global,
            r#"{"launch_params":{"group":"builtin","action":"probe"},"pacing":{"failure_penalty_secs":9}}"#,
        )
        .unwrap();
        std::fs::write(&project, r#"{"pacing":{"failure_penalty_secs":1}}"#).unwrap();

        let store = ConfigStore::new_with_global(
            &project,
            &global,
            Some(json!({"launch_params": {"action": "fanout"}})),
        )
        .await
        .unwrap();
        let resolved = store.resolve(None).await.unwrap();
        assert_eq!(resolved.launch_params.group, "builtin");
        assert_eq!(resolved.launch_params.action, "fanout");
        assert_eq!(store.get().await.unwrap().pacing.failure_penalty_secs, 1.0);
    }
}
