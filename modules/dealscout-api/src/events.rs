//! Server-sent status feed. Every tracker mutation is offered to
//! subscribers as a full group snapshot; slow consumers lose intermediate
//! updates, never correctness — the polling endpoints stay authoritative.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use crate::AppState;

pub async fn group_events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.tracker.subscribe();

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(snapshot) => {
                    match Event::default().event("group_updated").json_data(&snapshot) {
                        Ok(event) => yield Ok(event),
                        Err(e) => warn!(error = %e, "Failed to serialize group snapshot"),
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "SSE subscriber lagged; dropping missed updates");
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}
