//! Minimal ticket API client: the four update operations the relay forwards
//! plus a single-field read.
//!
//! Every call goes through [`AuthToken::execute`], so errors arrive already
//! classified.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::auth::{ApiError, ApiRequest, AuthToken, RequestBody};

/// Result type for ticket API calls.
pub type Result<T> = std::result::Result<T, ApiError>;

/// Multipart field name the attachment endpoint expects.
const ATTACHMENT_FIELD: &str = "file";

#[derive(Debug, Deserialize)]
struct IssueFields {
    #[serde(default)]
    fields: serde_json::Map<String, Value>,
}

/// Ticket operations against one destination.
#[derive(Debug, Clone)]
pub struct TicketClient {
    auth: Arc<AuthToken>,
}

impl TicketClient {
    pub fn new(auth: Arc<AuthToken>) -> Self {
        TicketClient { auth }
    }

    pub fn auth(&self) -> &Arc<AuthToken> {
        &self.auth
    }

    /// Adds a comment to a ticket.
    #[instrument(skip(self, body, cancel))]
    pub async fn add_comment(&self, issue_id: &str, body: &str, cancel: &CancellationToken) -> Result<()> {
        let request = ApiRequest::post_json(issue_path(issue_id, "/comment")?, json!({ "body": body }));
        self.auth.execute(request, cancel).await?;
        Ok(())
    }

    /// Uploads one file as an attachment.
    #[instrument(skip(self, data, cancel), fields(bytes = data.len()))]
    pub async fn add_attachment(
        &self,
        issue_id: &str,
        file_name: &str,
        mime_type: &str,
        data: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut request = ApiRequest::post_json(issue_path(issue_id, "/attachments")?, Value::Null);
        request.body = RequestBody::Multipart {
            field: ATTACHMENT_FIELD.to_string(),
            file_name: file_name.to_string(),
            mime_type: mime_type.to_string(),
            data,
        };
        self.auth.execute(request, cancel).await?;
        Ok(())
    }

    /// Runs a workflow transition by id, optionally commenting.
    #[instrument(skip(self, comment, cancel))]
    pub async fn do_transition(
        &self,
        issue_id: &str,
        transition_id: &str,
        comment: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut body = json!({ "transition": { "id": transition_id } });
        add_comment_update(&mut body, comment);
        let request = ApiRequest::post_json(issue_path(issue_id, "/transitions")?, body);
        self.auth.execute(request, cancel).await?;
        Ok(())
    }

    /// Moves a ticket to a target status, letting the server pick the path.
    #[instrument(skip(self, comment, cancel))]
    pub async fn transition_to(
        &self,
        issue_id: &str,
        target_status_id: &str,
        comment: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut body = json!({ "status": { "id": target_status_id } });
        add_comment_update(&mut body, comment);
        let request = ApiRequest::post_json(issue_path(issue_id, "/transitions-to")?, body);
        self.auth.execute(request, cancel).await?;
        Ok(())
    }

    /// Reads one field of a ticket. `None` if the ticket lacks it or it is null.
    #[instrument(skip(self, cancel))]
    pub async fn field(&self, issue_id: &str, field: &str, cancel: &CancellationToken) -> Result<Option<Value>> {
        let request = ApiRequest::get(issue_path(issue_id, "")?).with_query("fields", field);
        let response = self.auth.execute(request, cancel).await?;
        let mut issue: IssueFields = response.json()?;

        let value = issue.fields.remove(field).filter(|v| !v.is_null());
        debug!(found = value.is_some(), "Read ticket field");
        Ok(value)
    }
}

/// `issue/<id><suffix>`, refusing ids that would escape the path segment.
fn issue_path(issue_id: &str, suffix: &str) -> Result<String> {
    let invalid = issue_id.is_empty()
        || issue_id
            .chars()
            .any(|c| matches!(c, '/' | '?' | '#' | '%') || c.is_whitespace() || c.is_control());
    if invalid {
        return Err(ApiError::application(format!("invalid issue id {issue_id:?}")));
    }
    Ok(format!("issue/{issue_id}{suffix}"))
}

fn add_comment_update(body: &mut Value, comment: Option<&str>) {
    if let Some(comment) = comment.filter(|c| !c.is_empty()) {
        body["update"] = json!({ "comment": [{ "add": { "body": comment } }] });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::manager::testing::{LoginCounter, serve, with_login};
    use crate::auth::{ApiErrorKind, Credentials};
    use axum::extract::{Multipart, Path, Query, State};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::collections::HashMap;
    use std::sync::Mutex;

    type Recorded = Arc<Mutex<Vec<(String, Value)>>>;

    async fn record(
        State(log): State<Recorded>,
        Path(id): Path<String>,
        Json(body): Json<Value>,
    ) -> &'static str {
        log.lock().unwrap().push((id, body));
        "{}"
    }

    async fn client_for(router: Router) -> TicketClient {
        let url = serve(with_login(router, LoginCounter::default())).await;
        let auth = AuthToken::new(reqwest::Client::new(), url, Credentials::new("u", "p")).unwrap();
        TicketClient::new(Arc::new(auth))
    }

    #[tokio::test]
    async fn comment_and_transitions_post_expected_bodies() {
        let log: Recorded = Arc::default();
        let router = Router::new()
            .route("/issue/{id}/comment", post(record))
            .route("/issue/{id}/transitions", post(record))
            .route("/issue/{id}/transitions-to", post(record))
            .with_state(log.clone());
        let client = client_for(router).await;
        let cancel = CancellationToken::new();

        client.add_comment("INC-1", "hello", &cancel).await.unwrap();
        client.do_transition("INC-1", "31", Some("closing"), &cancel).await.unwrap();
        client.transition_to("INC-2", "10001", None, &cancel).await.unwrap();

        let log = log.lock().unwrap();
        assert_eq!(log[0], ("INC-1".to_string(), json!({"body": "hello"})));
        assert_eq!(
            log[1].1,
            json!({"transition": {"id": "31"}, "update": {"comment": [{"add": {"body": "closing"}}]}})
        );
        assert_eq!(log[2], ("INC-2".to_string(), json!({"status": {"id": "10001"}})));
    }

    #[tokio::test]
    async fn attachment_is_multipart_file_field() {
        let uploaded: Arc<Mutex<Vec<(String, String, Vec<u8>)>>> = Arc::default();
        let sink = uploaded.clone();
        let router = Router::new().route(
            "/issue/{id}/attachments",
            post(move |mut multipart: Multipart| {
                let sink = sink.clone();
                async move {
                    while let Some(field) = multipart.next_field().await.unwrap() {
                        let name = field.name().unwrap_or_default().to_string();
                        let file = field.file_name().unwrap_or_default().to_string();
                        let data = field.bytes().await.unwrap().to_vec();
                        sink.lock().unwrap().push((name, file, data));
                    }
                    "[]"
                }
            }),
        );
        let client = client_for(router).await;

        client
            .add_attachment("INC-1", "log.txt", "text/plain", b"line".to_vec(), &CancellationToken::new())
            .await
            .unwrap();

        let uploaded = uploaded.lock().unwrap();
        assert_eq!(
            *uploaded,
            vec![("file".to_string(), "log.txt".to_string(), b"line".to_vec())]
        );
    }

    #[tokio::test]
    async fn field_reads_requested_field() {
        let router = Router::new().route(
            "/issue/{id}",
            get(|Query(q): Query<HashMap<String, String>>| async move {
                let field = q.get("fields").cloned().unwrap_or_default();
                format!(r#"{{"fields":{{"{field}":"12345","other":null}}}}"#)
            }),
        );
        let client = client_for(router).await;
        let cancel = CancellationToken::new();

        let value = client.field("INC-1", "customfield_1", &cancel).await.unwrap();
        assert_eq!(value, Some(json!("12345")));
    }

    #[tokio::test]
    async fn unparsable_field_response_is_transient() {
        let router = Router::new().route("/issue/{id}", get(|| async { "<html>proxy</html>" }));
        let client = client_for(router).await;

        let err = client
            .field("INC-1", "customfield_1", &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ApiErrorKind::Transient);
    }

    #[test]
    fn issue_ids_cannot_escape_path() {
        assert_eq!(issue_path("INC-1", "/comment").unwrap(), "issue/INC-1/comment");
        assert!(issue_path("", "").is_err());
        assert!(issue_path("../admin", "").is_err());
        assert!(issue_path("1?x=y", "").is_err());
        assert!(issue_path("a b", "").is_err());
    }
}
