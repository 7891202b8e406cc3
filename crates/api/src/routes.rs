//! HTTP route handlers: health check and the turn endpoint.

use crate::rate_limit::LimitExceeded;
use crate::state::AppState;
use axum::{
    Json,
    extract::{ConnectInfo, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
};
use futures::stream::Stream;
use munin_common::{AttachmentSet, Transcript};
use munin_coordinator::TurnEvent;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::{StreamExt, wrappers::ReceiverStream};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_seconds: u64,
    /// Active triage backend: `"llm"` or `"keyword"`.
    pub triage: &'static str,
    /// Turn streams currently open across all clients.
    pub open_streams: u32,
}

/// Health check endpoint.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.uptime_seconds(),
        triage: state.coordinator.triage_mode(),
        open_streams: state.limiter.stats().open_streams,
    })
}

/// Body of `POST /api/v1/turns`.
///
/// The transcript is the whole conversation so far, ending with the user
/// turn to process. `attachments` stages the conversation's files; their
/// ordinals match the attachment parts referenced in the transcript.
#[derive(Debug, Deserialize)]
pub struct TurnRequest {
    pub transcript: Transcript,
    #[serde(default)]
    pub attachments: AttachmentSet,
}

/// API error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
    #[serde(skip)]
    status: StatusCode,
}

impl ErrorResponse {
    fn rate_limited() -> Self {
        Self {
            error: "too many requests, slow down".into(),
            code: "RATE_LIMITED",
            status: StatusCode::TOO_MANY_REQUESTS,
        }
    }

    fn too_many_streams() -> Self {
        Self {
            error: "too many turns in flight from this address".into(),
            code: "TOO_MANY_STREAMS",
            status: StatusCode::TOO_MANY_REQUESTS,
        }
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

/// Process one conversational turn, streaming progress as Server-Sent
/// Events: `delta`, `action`, `outcome` and `error` frames as work happens,
/// then a final `done` frame carrying the updated transcript. The client
/// posts that transcript back verbatim on the next turn.
pub async fn post_turn(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(request): Json<TurnRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ErrorResponse> {
    let ip = addr.ip();
    let turn_id = Uuid::new_v4();
    let permit = match state.limiter.begin_turn(ip) {
        Ok(permit) => permit,
        Err(LimitExceeded::Window) => {
            warn!(%ip, "rate limit exceeded");
            return Err(ErrorResponse::rate_limited());
        }
        Err(LimitExceeded::Streams) => {
            warn!(%ip, "too many open turn streams");
            return Err(ErrorResponse::too_many_streams());
        }
    };

    info!(
        %turn_id,
        turns = request.transcript.len(),
        attachments = request.attachments.len(),
        "processing turn"
    );

    let (events, receiver) = mpsc::channel(32);
    let budget = state.turn_budget;
    let engine = state.clone();
    tokio::spawn(async move {
        // The stream slot stays claimed until the turn finishes, even when
        // the client stops reading early.
        let _permit = permit;
        let turn = engine
            .coordinator
            .process_turn(request.transcript, request.attachments, &events);
        match tokio::time::timeout(budget, turn).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                error!(%turn_id, error = %e, "turn failed");
                let _ = events
                    .send(TurnEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
            }
            Err(_) => {
                error!(%turn_id, budget_secs = budget.as_secs(), "turn exceeded its budget");
                let _ = events
                    .send(TurnEvent::Error {
                        message: format!(
                            "the turn did not finish within {}s; nothing more will happen",
                            budget.as_secs()
                        ),
                    })
                    .await;
            }
        }
    });

    let stream = ReceiverStream::new(receiver).map(|event| Ok(sse_frame(&event)));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// SSE event name for a turn event. Mirrors the `event` tag inside the JSON
/// payload so clients can dispatch on either.
fn event_name(event: &TurnEvent) -> &'static str {
    match event {
        TurnEvent::Delta { .. } => "delta",
        TurnEvent::Action { .. } => "action",
        TurnEvent::Outcome { .. } => "outcome",
        TurnEvent::Error { .. } => "error",
        TurnEvent::Done { .. } => "done",
    }
}

fn sse_frame(event: &TurnEvent) -> Event {
    Event::default()
        .event(event_name(event))
        .json_data(event)
        .unwrap_or_else(|_| {
            Event::default()
                .event("error")
                .data("event serialization failed")
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use munin_common::WorkerId;

    #[test]
    fn test_health_response_serialization() {
        let response = HealthResponse {
            status: "healthy",
            version: "0.1.0",
            uptime_seconds: 100,
            triage: "keyword",
            open_streams: 0,
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("healthy"));
        assert!(json.contains("\"triage\":\"keyword\""));
    }

    #[test]
    fn test_turn_request_deserialization() {
        let json = r#"{
            "transcript": {
                "turns": [
                    {
                        "kind": "message",
                        "role": "user",
                        "parts": [{"type": "text", "text": "hei"}]
                    }
                ]
            }
        }"#;
        let request: TurnRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.transcript.len(), 1);
        assert!(request.attachments.is_empty());
    }

    #[test]
    fn test_turn_request_with_attachments() {
        let json = r#"{
            "transcript": {
                "turns": [
                    {
                        "kind": "message",
                        "role": "user",
                        "parts": [
                            {"type": "text", "text": "kvittering vedlagt"},
                            {"type": "attachment", "name": "kvittering.pdf", "ordinal": 1}
                        ]
                    }
                ]
            },
            "attachments": {
                "items": [
                    {
                        "name": "kvittering.pdf",
                        "media_type": "application/pdf",
                        "data": "aGVp",
                        "ordinal": 1
                    }
                ]
            }
        }"#;
        let request: TurnRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.attachments.len(), 1);
        assert_eq!(request.attachments.get(1).unwrap().name, "kvittering.pdf");
    }

    #[test]
    fn test_error_response_hides_status_field() {
        let response = ErrorResponse::rate_limited();
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("RATE_LIMITED"));
        assert!(!json.contains("429"));
    }

    #[test]
    fn test_event_names_match_json_tags() {
        let events = [
            TurnEvent::Delta {
                text: "hei".into(),
            },
            TurnEvent::Action {
                worker: WorkerId::Sales,
                action: "create_invoice".into(),
            },
            TurnEvent::Error {
                message: "oops".into(),
            },
        ];
        for event in &events {
            let json = serde_json::to_value(event).unwrap();
            assert_eq!(json["event"].as_str().unwrap(), event_name(event));
        }
    }
}
