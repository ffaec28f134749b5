use serde::{Serialize, Deserialize};

use crate::api::opt_str_int;

/// One entry of a run's artifact listing. `path` is relative to the artifact root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub path: String,
    #[serde(default)]
    pub is_dir: bool,
    #[serde(default, with = "opt_str_int")]
    pub file_size: Option<i64>,
}
