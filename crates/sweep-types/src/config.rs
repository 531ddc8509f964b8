use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One handler call per work item, looped by the dispatcher.
    #[default]
    Isolated,
    /// One handler call covering the whole item set.
    Joint,
}

impl ExecutionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionMode::Isolated => "isolated",
            ExecutionMode::Joint => "joint",
        }
    }
}

/// Inter-item delay range, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelayBounds {
    pub min_secs: f64,
    pub max_secs: f64,
}

impl DelayBounds {
    pub const fn fixed(secs: f64) -> Self {
        Self {
            min_secs: secs,
            max_secs: secs,
        }
    }

    /// Both ends must fit in a `Duration`.
    pub fn is_valid(&self) -> bool {
        self.min_secs.is_finite()
            && self.min_secs >= 0.0
            && self.max_secs >= self.min_secs
            && Duration::try_from_secs_f64(self.max_secs).is_ok()
    }
}

impl Default for DelayBounds {
    fn default() -> Self {
        Self {
            min_secs: 5.0,
            max_secs: 15.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchParams {
    pub group: String,
    pub action: String,
    #[serde(default)]
    pub shuffle: bool,
    #[serde(default)]
    pub delay: DelayBounds,
    /// Name of the run document. Reusing the name of an existing document
    /// resumes that run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items_file: Option<String>,
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

impl LaunchParams {
    pub fn new(group: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            action: action.into(),
            shuffle: false,
            delay: DelayBounds::default(),
            state_name: None,
            items: Vec::new(),
            items_file: None,
            extra: Map::new(),
        }
    }
}

/// Action-specific arguments. Handlers parse these into their own typed
/// structs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct FunctionParams(pub Map<String, Value>);

impl FunctionParams {
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.0.clone()))
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Map<String, Value>> for FunctionParams {
    fn from(value: Map<String, Value>) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    pub launch_params: LaunchParams,
    #[serde(default)]
    pub function_params: FunctionParams,
}

impl Configuration {
    pub fn new(launch_params: LaunchParams, function_params: FunctionParams) -> Self {
        Self {
            launch_params,
            function_params,
        }
    }

    pub fn state_name(&self) -> Option<&str> {
        self.launch_params.state_name.as_deref()
    }
}
