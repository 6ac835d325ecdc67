use std::future::Future;
use std::pin::Pin;

use super::{Event, EventSink};

/// Prints one JSON line per event on stderr.
#[derive(Debug, Default)]
pub struct TerminalEventSink;

impl TerminalEventSink {
    pub fn new() -> Self {
        Self
    }
}

impl EventSink for TerminalEventSink {
    fn write<'a>(&'a self, event: &'a Event) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            match serde_json::to_string(event) {
                Ok(line) => eprintln!("{line}"),
                Err(err) => {
                    eprintln!("{{\"event\":\"event_serialize_error\",\"error\":\"{err}\"}}")
                }
            }
        })
    }
}
