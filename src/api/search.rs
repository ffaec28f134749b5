use crate::api::run::Run;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageToken(String);
impl AsRef<str> for PageToken {
    fn as_ref(&self) -> &str {
        self.0.as_ref()
    }
}
impl From<String> for PageToken {
    fn from(id: String) -> Self {
        PageToken(id)
    }
}
impl From<&str> for PageToken {
    fn from(id: &str) -> Self {
        PageToken(id.to_owned())
    }
}

/// One page of a run search.
#[derive(Debug, Default, Deserialize)]
pub struct Search {
    #[serde(default)]
    pub runs: Vec<Run>,
    #[serde(default)]
    pub next_page_token: Option<PageToken>,
}

/// Upper bound for `max_results` accepted by the tracking server.
pub const MAX_RESULTS: i32 = 1000;
