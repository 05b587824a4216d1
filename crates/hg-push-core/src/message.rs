use crate::{CoreError, Result, HG_PUSH, NEW_HG_REPO};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Routing discriminator carried in the `type` field of every message body
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// `"hg-push"`: one or more pushes landed in a repository
    HgPush,
    /// `"new-hg-repo"`: a repository was registered
    NewHgRepo,
    /// Any other `type` value
    Other(String),
    /// No string `type` field at all
    Missing,
}

impl MessageKind {
    /// Read the discriminator of a decoded message body
    pub fn of(body: &Value) -> Self {
        match body.get("type").and_then(Value::as_str) {
            Some(HG_PUSH) => MessageKind::HgPush,
            Some(NEW_HG_REPO) => MessageKind::NewHgRepo,
            Some(other) => MessageKind::Other(other.to_string()),
            None => MessageKind::Missing,
        }
    }

    /// Label used in logs and metrics
    pub fn as_str(&self) -> &str {
        match self {
            MessageKind::HgPush => HG_PUSH,
            MessageKind::NewHgRepo => NEW_HG_REPO,
            MessageKind::Other(_) => "other",
            MessageKind::Missing => "missing",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Other(kind) => write!(f, "{}", kind),
            _ => f.write_str(self.as_str()),
        }
    }
}

/// Repository identifier as sent by the publisher, either numeric or textual
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RepositoryId {
    Int(i64),
    Str(String),
}

impl fmt::Display for RepositoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepositoryId::Int(id) => write!(f, "{}", id),
            RepositoryId::Str(id) => f.write_str(id),
        }
    }
}

/// A single push, rebuilt from one entry of the `pushes` list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushEvent {
    /// The entry's `id` value, kept as sent
    pub id: Value,

    /// The full raw entry, `id` included
    pub payload: Map<String, Value>,
}

impl PushEvent {
    pub fn from_entry(entry: &Value) -> Result<Self> {
        let payload = entry
            .as_object()
            .ok_or_else(|| CoreError::MalformedPush(format!("push entry is not an object: {}", entry)))?;
        let id = payload
            .get("id")
            .cloned()
            .ok_or_else(|| CoreError::MalformedPush("push entry without id".to_string()))?;

        Ok(PushEvent {
            id,
            payload: payload.clone(),
        })
    }
}

/// Decoded body of an `hg-push` message
#[derive(Debug, Clone, PartialEq)]
pub struct PushMessage {
    pub repository_id: RepositoryId,
    pub pushes: Vec<PushEvent>,
}

impl PushMessage {
    /// Rebuild the repository id and push events from a message body.
    ///
    /// The body is not checked for its `type`; callers route first. The same
    /// body always produces the same events, so a redelivered message is
    /// handed to the push handler unchanged.
    pub fn from_body(body: &Value) -> Result<Self> {
        let repository_id = body
            .get("repository_id")
            .cloned()
            .ok_or_else(|| CoreError::MalformedPush("missing repository_id".to_string()))?;
        let repository_id: RepositoryId = serde_json::from_value(repository_id)
            .map_err(|e| CoreError::MalformedPush(format!("invalid repository_id: {}", e)))?;

        let pushes = body
            .get("pushes")
            .and_then(Value::as_array)
            .ok_or_else(|| CoreError::MalformedPush("missing pushes list".to_string()))?
            .iter()
            .map(PushEvent::from_entry)
            .collect::<Result<Vec<_>>>()?;

        Ok(PushMessage {
            repository_id,
            pushes,
        })
    }
}
