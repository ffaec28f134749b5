use serde::{Deserialize, Deserializer, Serialize};
use std::{fmt, str::FromStr};

use crate::{RunId, api::opt_str_int};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredModel {
    pub name: String,
    #[serde(default, with = "opt_str_int")]
    pub creation_timestamp: Option<i64>,
    #[serde(default, with = "opt_str_int")]
    pub last_updated_timestamp: Option<i64>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub latest_versions: Vec<ModelVersion>,
    #[serde(default)]
    pub tags: Vec<ModelTag>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelVersion {
    pub name: String,
    pub version: String,
    #[serde(default, with = "opt_str_int")]
    pub creation_timestamp: Option<i64>,
    #[serde(default)]
    pub current_stage: Stage,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub source: String,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub run_id: Option<RunId>,
    #[serde(default)]
    pub status: ModelVersionStatus,
    #[serde(default)]
    pub tags: Vec<ModelTag>,
}

impl ModelVersion {
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.key == key)
            .map(|tag| tag.value.as_str())
    }
}

/// Tag of a registered model or of one of its versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelTag {
    pub key: String,
    pub value: String,
}

impl ModelTag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        ModelTag { key: key.into(), value: value.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Stage {
    None,
    Staging,
    Production,
    Archived,
}

impl Default for Stage {
    fn default() -> Self {
        Stage::None
    }
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::None => "None",
            Stage::Staging => "Staging",
            Stage::Production => "Production",
            Stage::Archived => "Archived",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown model version stage '{0}'")]
pub struct UnknownStage(pub String);

impl FromStr for Stage {
    type Err = UnknownStage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Stage::None),
            "staging" => Ok(Stage::Staging),
            "production" => Ok(Stage::Production),
            "archived" => Ok(Stage::Archived),
            _ => Err(UnknownStage(s.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelVersionStatus {
    PendingRegistration,
    FailedRegistration,
    Ready,
}

impl Default for ModelVersionStatus {
    fn default() -> Self {
        ModelVersionStatus::Ready
    }
}

// the server reports a version without run as `"run_id": ""`
fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<RunId>, D::Error>
where
    D: Deserializer<'de>,
{
    let s = Option::<String>::deserialize(deserializer)?;
    Ok(s.filter(|s| !s.is_empty()).map(RunId::from))
}
