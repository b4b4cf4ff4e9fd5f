//! Push-mode signal source: GitHub `pull_request` webhook receiver.
//!
//! Deliveries are at-least-once and may arrive duplicated or out of order;
//! the handler maps them to canonical events and forwards them. Ordering
//! and duplicate rejection happen in the environment registry, which means
//! a replayed delivery is acknowledged with 200 and dropped there rather
//! than bounced back to GitHub for endless redelivery.

use crate::routing::tag::CanaryId;
use crate::signal::{EventSender, PrEvent, PrState};
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// GitHub `pull_request` event payload (only the fields we consume).
#[derive(Debug, Clone, Deserialize)]
pub struct PullRequestEvent {
    /// Action type (opened, synchronize, closed, ...)
    pub action: String,
    pub pull_request: PullRequest,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    /// Source branch head
    pub head: GitRef,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitRef {
    pub sha: String,
}

impl PullRequestEvent {
    /// Maps a delivery to its canonical lifecycle event. Actions with no
    /// lifecycle meaning (labeled, review_requested, ...) map to `None`.
    #[must_use]
    pub fn to_pr_event(&self) -> Option<PrEvent> {
        let state = match self.action.as_str() {
            "opened" | "reopened" => PrState::Open,
            "synchronize" => PrState::Updated,
            "closed" => PrState::Closed,
            _ => return None,
        };

        Some(PrEvent {
            id: CanaryId(self.pull_request.number),
            revision: self.pull_request.head.sha.clone(),
            state,
            updated_at: self.pull_request.updated_at.unwrap_or_else(Utc::now),
        })
    }
}

/// Shared state for the webhook route.
#[derive(Clone)]
pub struct WebhookState {
    pub events: EventSender,
}

/// Handle a GitHub webhook delivery.
pub async fn handle_github_webhook(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, StatusCode> {
    let event_type = headers
        .get("X-GitHub-Event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown");
    let delivery_id = headers
        .get("X-GitHub-Delivery")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown");

    debug!(
        event_type = %event_type,
        delivery_id = %delivery_id,
        "Received GitHub webhook"
    );

    if event_type != "pull_request" {
        // Not ours; acknowledge so GitHub does not redeliver.
        return Ok(Json(json!({ "status": "ignored", "event": event_type })));
    }

    let payload: PullRequestEvent = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(error) => {
            warn!(%error, delivery_id = %delivery_id, "Malformed pull_request payload");
            return Err(StatusCode::BAD_REQUEST);
        }
    };

    let Some(event) = payload.to_pr_event() else {
        debug!(action = %payload.action, "No lifecycle meaning, skipping");
        return Ok(Json(json!({ "status": "ignored", "action": payload.action })));
    };

    info!(
        id = %event.id,
        revision = %event.revision,
        state = ?event.state,
        delivery_id = %delivery_id,
        "Forwarding PR lifecycle event"
    );

    if state.events.send(event).is_err() {
        warn!("Event channel closed, controller is shutting down");
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    Ok(Json(json!({ "status": "accepted" })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::event_channel;
    use axum::http::HeaderValue;

    fn payload(action: &str, number: u64, sha: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "action": action,
            "pull_request": {
                "number": number,
                "head": { "sha": sha, "ref": format!("feature-{number}") },
                "updated_at": "2025-03-01T12:00:00Z"
            }
        }))
        .unwrap()
    }

    fn pr_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("X-GitHub-Event", HeaderValue::from_static("pull_request"));
        headers.insert("X-GitHub-Delivery", HeaderValue::from_static("d-1"));
        headers
    }

    #[tokio::test]
    async fn maps_actions_to_lifecycle_events() {
        let (tx, mut rx) = event_channel();
        let state = Arc::new(WebhookState { events: tx });

        for (action, expected) in [
            ("opened", PrState::Open),
            ("reopened", PrState::Open),
            ("synchronize", PrState::Updated),
            ("closed", PrState::Closed),
        ] {
            handle_github_webhook(
                State(state.clone()),
                pr_headers(),
                Bytes::from(payload(action, 42, "a1")),
            )
            .await
            .unwrap();

            let event = rx.try_recv().unwrap();
            assert_eq!(event.id, CanaryId(42));
            assert_eq!(event.revision, "a1");
            assert_eq!(event.state, expected);
        }
    }

    #[tokio::test]
    async fn irrelevant_actions_and_events_are_acknowledged() {
        let (tx, mut rx) = event_channel();
        let state = Arc::new(WebhookState { events: tx });

        // non-lifecycle action
        handle_github_webhook(
            State(state.clone()),
            pr_headers(),
            Bytes::from(payload("labeled", 42, "a1")),
        )
        .await
        .unwrap();

        // different event type entirely
        let mut headers = HeaderMap::new();
        headers.insert("X-GitHub-Event", HeaderValue::from_static("push"));
        handle_github_webhook(State(state.clone()), headers, Bytes::from_static(b"{}"))
            .await
            .unwrap();

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn malformed_payload_is_rejected() {
        let (tx, _rx) = event_channel();
        let state = Arc::new(WebhookState { events: tx });

        let result = handle_github_webhook(
            State(state),
            pr_headers(),
            Bytes::from_static(b"not json"),
        )
        .await;
        assert_eq!(result.unwrap_err(), StatusCode::BAD_REQUEST);
    }
}
