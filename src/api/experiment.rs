use serde::{Serialize, Deserialize};

use crate::{ExperimentId, api::{client::LifecycleStage, opt_str_int}};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    pub experiment_id: ExperimentId,
    pub name: String,
    #[serde(default)]
    pub artifact_location: String,
    pub lifecycle_stage: LifecycleStage,
    #[serde(default, with = "opt_str_int")]
    pub last_update_time: Option<i64>,
    #[serde(default, with = "opt_str_int")]
    pub creation_time: Option<i64>,
    #[serde(default)]
    pub tags: Vec<ExperimentTag>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentTag {
    pub key: String,
    pub value: String,
}
