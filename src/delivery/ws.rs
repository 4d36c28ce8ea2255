//! WebSocket delivery of one job's events at `/ws/jobs/{id}?after=N`.
//!
//! Each delivery event is sent as one JSON text frame. The socket is closed
//! by the server right after the `complete` event.

use axum::{
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::{IntoResponse, Response},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::api::{AfterQuery, ApiError, AppState};
use super::subscription::{DeliveryEvent, Subscription};

pub(super) async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(job_id): Path<Uuid>,
    Query(query): Query<AfterQuery>,
    State(state): State<AppState>,
) -> Response {
    // Resolve the job before upgrading so unknown ids get a plain 404.
    let subscription = match state
        .engine
        .subscribe(job_id, query.after.unwrap_or(0))
        .await
    {
        Ok(sub) => sub,
        Err(e) => return ApiError::from(e).into_response(),
    };
    info!(job_id = %job_id, after = query.after, "Job WebSocket client connecting");
    ws.on_upgrade(move |socket| handle_socket(socket, subscription))
}

async fn handle_socket(mut socket: WebSocket, mut subscription: Subscription) {
    let job_id = subscription.job_id();
    info!(job_id = %job_id, "Job WebSocket client connected");

    loop {
        tokio::select! {
            event = subscription.next() => {
                let Some(event) = event else { break };
                let last = matches!(event, DeliveryEvent::Complete { .. });
                match serde_json::to_string(&event) {
                    Ok(json) => {
                        if socket.send(Message::Text(json.into())).await.is_err() {
                            debug!(job_id = %job_id, "Client disconnected during send");
                            return;
                        }
                    }
                    Err(e) => warn!(job_id = %job_id, error = %e, "Failed to serialize event"),
                }
                if last {
                    break;
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(
                            job_id = %job_id,
                            last_seq = subscription.last_seq(),
                            "Job WebSocket client disconnected"
                        );
                        return;
                    }
                    Some(Err(e)) => {
                        warn!(job_id = %job_id, error = %e, "Job WebSocket error");
                        return;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    let _ = socket.send(Message::Close(None)).await;
    debug!(job_id = %job_id, "Job stream finished");
}
