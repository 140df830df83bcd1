use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt};
use std::convert::Infallible;
use std::time::Duration;

use crate::stream::{StreamMessage, Topic};

/// Renders run output as server-sent events.
///
/// Every event carries the message id so clients can reconnect with
/// `Last-Event-ID`. Stream parts use their mode as the event name; control
/// messages use the signal name (`done`, `interrupt`, `rollback`).
pub fn build_sse_response<S>(stream: S) -> Sse<impl Stream<Item = Result<Event, Infallible>> + Send>
where
    S: Stream<Item = StreamMessage> + Send + 'static,
{
    let stream = stream.map(|message| Ok(to_event(&message)));

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

fn to_event(message: &StreamMessage) -> Event {
    let name = match &message.topic {
        Topic::Stream(mode) => mode.as_str(),
        Topic::Control(signal) => signal.as_str(),
    };
    let data = serde_json::to_string(&message.payload).unwrap_or_else(|_| "null".to_string());

    Event::default()
        .id(message.id.to_string())
        .event(name)
        .data(data)
}
