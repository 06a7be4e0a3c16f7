//! Turning one queue item into ticket API calls.

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::auth::{ApiError, ApiErrorKind};
use crate::ticket::TicketClient;
use crate::types::{ItemId, Task, TaskTarget};

/// Why an item could not be delivered.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The remote call failed.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// The item must not be delivered: a business rule says it doesn't
    /// apply to the ticket.
    #[error("skipped: {0}")]
    Skip(String),

    /// The payload is not a task this relay understands.
    #[error("malformed task: {0}")]
    Payload(#[from] serde_json::Error),
}

impl HandlerError {
    /// Whether the item should stay queued for another attempt.
    ///
    /// Only transient and authentication failures keep it. Retrying anything
    /// else would fail the same way forever and hold back the whole queue.
    pub fn keeps_item(&self) -> bool {
        matches!(
            self,
            HandlerError::Api(ApiError {
                kind: ApiErrorKind::Transient | ApiErrorKind::Authentication,
                ..
            })
        )
    }

    /// Whether operators should hear about this failure.
    pub fn needs_alert(&self) -> bool {
        match self {
            HandlerError::Api(e) => e.kind != ApiErrorKind::Transient,
            HandlerError::Skip(_) | HandlerError::Payload(_) => false,
        }
    }

    pub fn is_authentication(&self) -> bool {
        matches!(
            self,
            HandlerError::Api(ApiError {
                kind: ApiErrorKind::Authentication,
                ..
            })
        )
    }
}

/// Something that delivers queue payloads.
pub trait Handler: Send + Sync {
    fn handle(
        &self,
        id: ItemId,
        payload: &[u8],
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<(), HandlerError>> + Send;
}

impl<H: Handler + ?Sized> Handler for Arc<H> {
    fn handle(
        &self,
        id: ItemId,
        payload: &[u8],
        cancel: &CancellationToken,
    ) -> impl Future<Output = Result<(), HandlerError>> + Send {
        (**self).handle(id, payload, cancel)
    }
}

/// Delivers [`Task`] payloads through a [`TicketClient`].
#[derive(Debug, Clone)]
pub struct TaskHandler {
    client: TicketClient,

    /// Ticket field holding the upstream id, if tasks should be checked
    /// against it before delivery.
    external_id_field: Option<String>,
}

impl TaskHandler {
    pub fn new(client: TicketClient, external_id_field: Option<String>) -> Self {
        TaskHandler {
            client,
            external_id_field: external_id_field.filter(|f| !f.is_empty()),
        }
    }

    /// Refuses tasks aimed at a ticket that belongs to another upstream item.
    async fn check_external_id(&self, target: &TaskTarget, cancel: &CancellationToken) -> Result<(), HandlerError> {
        let (Some(field), Some(expected)) = (self.external_id_field.as_deref(), target.external_id) else {
            return Ok(());
        };
        if expected == 0 {
            return Ok(());
        }

        let value = self.client.field(&target.issue_id, field, cancel).await?;
        let Some(value) = value else {
            return Err(HandlerError::Skip(format!(
                "ticket {} has no {field}",
                target.issue_id
            )));
        };
        let Some(actual) = parse_external_id(&value) else {
            return Err(HandlerError::Skip(format!(
                "ticket {} has unparsable {field}: {value}",
                target.issue_id
            )));
        };
        if actual != expected {
            return Err(HandlerError::Skip(format!(
                "ticket {} belongs to {actual}, not {expected}",
                target.issue_id
            )));
        }

        debug!(issue = %target.issue_id, external_id = expected, "External id matches");
        Ok(())
    }
}

impl Handler for TaskHandler {
    #[instrument(skip(self, payload, cancel), fields(bytes = payload.len()))]
    async fn handle(&self, id: ItemId, payload: &[u8], cancel: &CancellationToken) -> Result<(), HandlerError> {
        let task: Task = serde_json::from_slice(payload).inspect_err(|e| {
            warn!(error = %e, "Undecodable task");
        })?;
        debug!(kind = task.kind(), issue = %task.target().issue_id, "Delivering task");

        self.check_external_id(task.target(), cancel).await?;

        match task {
            Task::AddComment { target, comment } => {
                self.client.add_comment(&target.issue_id, &comment, cancel).await?
            }
            Task::AddAttachment {
                target,
                file_name,
                mime_type,
                data,
            } => {
                self.client
                    .add_attachment(&target.issue_id, &file_name, &mime_type, data, cancel)
                    .await?
            }
            Task::DoTransition {
                target,
                transition_id,
                comment,
            } => {
                self.client
                    .do_transition(&target.issue_id, &transition_id, comment.as_deref(), cancel)
                    .await?
            }
            Task::DoTransitionTo {
                target,
                target_status_id,
                comment,
            } => {
                self.client
                    .transition_to(&target.issue_id, &target_status_id, comment.as_deref(), cancel)
                    .await?
            }
        }

        Ok(())
    }
}

/// Reads an upstream id from a ticket field. Accepts a number or a numeric
/// string.
fn parse_external_id(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
