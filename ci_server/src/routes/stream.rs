//! Streaming responses: build output and the update feed.

use std::convert::Infallible;

use axum::body::{Body, Bytes};
use axum::http::header;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures_util::stream::{self, Stream, StreamExt};
use tokio::sync::broadcast;

use crate::events::build::BuildUpdate;
use crate::services::build_service::BuildOutput;
use crate::services::output_stream::OutputReader;

/// Decrements the reader gauge when the response body is dropped, whether
/// the build finished or the client went away.
struct ReaderGuard;

impl ReaderGuard {
    fn attach() -> Self {
        crate::metrics::stream_reader_attached();
        Self
    }
}

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        crate::metrics::stream_reader_detached();
    }
}

fn live_body(reader: OutputReader) -> Body {
    let guard = ReaderGuard::attach();
    let chunks = reader.into_stream().map(move |chunk| {
        let _attached = &guard;
        Ok::<_, Infallible>(Bytes::from(chunk))
    });
    Body::from_stream(chunks)
}

/// Plain-text response for a build's output, streamed while it runs.
pub fn output_response(output: BuildOutput) -> Response {
    let body = match output {
        BuildOutput::Live(reader) => live_body(reader),
        BuildOutput::Stored(bytes) => Body::from(bytes),
    };
    (
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
        ],
        body,
    )
        .into_response()
}

fn update_stream(
    receiver: broadcast::Receiver<BuildUpdate>,
) -> impl Stream<Item = Result<Event, Infallible>> + Send + 'static {
    stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(update) => {
                    let event = Event::default()
                        .event("build")
                        .json_data(&update)
                        .unwrap_or_else(|_| Event::default().event("build"));
                    return Some((Ok(event), receiver));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Update subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
}

/// Server-sent events for every build state change.
pub fn updates_response(
    receiver: broadcast::Receiver<BuildUpdate>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>> + Send + 'static> {
    Sse::new(update_stream(receiver)).keep_alive(KeepAlive::default())
}
