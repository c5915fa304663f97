//! Log streams as server-sent events.

use axum::response::sse::{Event, KeepAlive, Sse};
use dockyard_scheduler::LogStream;
use futures::{Stream, StreamExt};
use std::convert::Infallible;
use tokio_util::sync::CancellationToken;

/// Each line becomes one `data:` event holding its `{t, l, m}` JSON.
///
/// `cancel` fires once the response body is dropped, i.e. when the client
/// disconnects.
pub fn log_events(
    lines: LogStream,
    cancel: CancellationToken,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let guard = cancel.drop_guard();
    let events = lines.map(move |line| {
        let _connected = &guard;
        let event = Event::default()
            .json_data(&line)
            .unwrap_or_else(|_| Event::default().data(line.message));
        Ok(event)
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}
