//! Task payloads stored in queue items.
//!
//! Producers serialize a [`Task`] to JSON and enqueue the bytes; the
//! dispatcher's handler deserializes it and performs the matching ticket call.

use serde::{Deserialize, Serialize};

/// One update operation to forward to the ticketing API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name")]
pub enum Task {
    /// Adds a comment to the ticket.
    #[serde(rename = "IssueAddComment")]
    AddComment {
        #[serde(flatten)]
        target: TaskTarget,
        comment: String,
    },

    /// Uploads a file as an attachment of the ticket.
    #[serde(rename = "IssueAddAttachment")]
    AddAttachment {
        #[serde(flatten)]
        target: TaskTarget,
        file_name: String,
        mime_type: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },

    /// Runs a workflow transition by its id.
    #[serde(rename = "IssueDoTransition")]
    DoTransition {
        #[serde(flatten)]
        target: TaskTarget,
        transition_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        comment: Option<String>,
    },

    /// Moves the ticket to a target status, letting the remote side pick the transition.
    #[serde(rename = "IssueDoTransitionTo")]
    DoTransitionTo {
        #[serde(flatten)]
        target: TaskTarget,
        target_status_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        comment: Option<String>,
    },
}

/// The ticket a task applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskTarget {
    /// Remote ticket key, e.g. `INCIDENT-6508`.
    pub issue_id: String,

    /// Upstream tracker id the remote ticket is expected to reference.
    ///
    /// When set, the handler verifies the remote ticket's external-id field
    /// before acting and drops the task on mismatch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<u64>,
}

impl TaskTarget {
    pub fn new(issue_id: impl Into<String>) -> Self {
        TaskTarget {
            issue_id: issue_id.into(),
            external_id: None,
        }
    }

    pub fn with_external_id(mut self, external_id: u64) -> Self {
        self.external_id = Some(external_id);
        self
    }
}

impl Task {
    pub fn target(&self) -> &TaskTarget {
        match self {
            Task::AddComment { target, .. }
            | Task::AddAttachment { target, .. }
            | Task::DoTransition { target, .. }
            | Task::DoTransitionTo { target, .. } => target,
        }
    }

    /// Wire name of the task kind, used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Task::AddComment { .. } => "IssueAddComment",
            Task::AddAttachment { .. } => "IssueAddAttachment",
            Task::DoTransition { .. } => "IssueDoTransition",
            Task::DoTransitionTo { .. } => "IssueDoTransitionTo",
        }
    }
}

/// Attachment bytes travel as standard base64 inside the JSON payload.
mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s.as_bytes()).map_err(de::Error::custom)
    }
}
