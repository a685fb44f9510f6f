//! Response bodies shared by the API and in-page request paths.

use chrono::{DateTime, Utc};
use cadence_core::{PublishOutcome, UserIdentity};
use serde::Deserialize;
use serde_json::Value;

/// List endpoints answer either with a bare array or `{"data": [...]}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum ListResponse<T> {
    Wrapped { data: Vec<T> },
    Bare(Vec<T>),
}

impl<T> ListResponse<T> {
    pub(crate) fn into_vec(self) -> Vec<T> {
        match self {
            ListResponse::Wrapped { data } => data,
            ListResponse::Bare(items) => items,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct PublishResponse {
    #[serde(default = "default_true")]
    success: bool,
    #[serde(default)]
    published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

fn default_true() -> bool {
    true
}

impl PublishResponse {
    pub(crate) fn into_outcome(self, resource_id: &str) -> PublishOutcome {
        PublishOutcome {
            resource_id: resource_id.to_string(),
            success: self.success,
            published_at: self.published_at,
            url: self.url,
            error: self.error,
        }
    }
}

/// `GET /me`. Ids may be numeric.
#[derive(Debug, Deserialize)]
pub(crate) struct MeResponse {
    #[serde(alias = "user_id")]
    id: Value,
    #[serde(alias = "display_name", alias = "username")]
    name: String,
}

impl From<MeResponse> for UserIdentity {
    fn from(me: MeResponse) -> Self {
        let user_id = match me.id {
            Value::String(id) => id,
            other => other.to_string(),
        };
        UserIdentity::new(user_id, me.name)
    }
}
