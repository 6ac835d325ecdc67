use std::time::Duration;

use bytes::BytesMut;
use tokio::time::Instant;
use tracing::debug;

use relayhub_protocol::sse::{SseEvent, SseParser};
use relayhub_provider_core::{ApiError, ByteStream};

use super::{AttemptFailure, Relay};
use crate::guard::Downstream;
use crate::usage::Usage;

/// Copies an upstream event stream to the caller, one complete SSE frame at a time, so a
/// keep-alive written in between never lands inside a frame.
pub(super) async fn forward(
    relay: &dyn Relay,
    mut rx: ByteStream,
    downstream: &Downstream,
    usage: &mut Usage,
    started: Instant,
    first_response: &mut Option<Duration>,
) -> Result<(), AttemptFailure> {
    let mut parser = SseParser::new();
    let mut pending = BytesMut::new();

    while let Some(item) = rx.recv().await {
        let chunk = match item {
            Ok(chunk) => chunk,
            Err(failure) => {
                // Partial content from this channel cannot be continued elsewhere.
                return Err(AttemptFailure {
                    error: ApiError::from(&failure),
                    done: downstream.has_data(),
                });
            }
        };
        if first_response.is_none() {
            *first_response = Some(started.elapsed());
        }
        observe(relay, parser.push(&chunk), usage);

        pending.extend_from_slice(&chunk);
        if let Some(end) = frame_boundary(&pending) {
            let frames = pending.split_to(end).freeze();
            if !downstream.write_data(frames).await {
                debug!(event = "downstream_closed", model = %relay.original_model());
                return Ok(());
            }
        }
    }

    observe(relay, parser.finish(), usage);
    if !pending.is_empty() {
        downstream.write_data(pending.freeze()).await;
    }
    // An upstream that closed without a byte still owes the caller a stream head.
    downstream.commit_stream();
    Ok(())
}

fn observe(relay: &dyn Relay, events: Vec<SseEvent>, usage: &mut Usage) {
    for event in events {
        if !event.is_done() {
            relay.observe_event(&event.data, usage);
        }
    }
}

/// End offset of the last complete frame (`\n\n` or `\r\n\r\n`) in `buf`.
fn frame_boundary(buf: &[u8]) -> Option<usize> {
    let mut end = None;
    for i in 1..buf.len() {
        if buf[i] != b'\n' {
            continue;
        }
        if buf[i - 1] == b'\n' || (i >= 2 && &buf[i - 2..i] == b"\n\r") {
            end = Some(i + 1);
        }
    }
    end
}

#[cfg(test)]
mod tests {
    use super::frame_boundary;

    #[test]
    fn boundary_is_after_last_full_frame() {
        assert_eq!(frame_boundary(b"data: a"), None);
        assert_eq!(frame_boundary(b"data: a\n\ndata: b"), Some(9));
        assert_eq!(frame_boundary(b"data: a\n\ndata: b\n\n"), Some(18));
        assert_eq!(frame_boundary(b"data: a\r\n\r\ndata"), Some(11));
    }
}
