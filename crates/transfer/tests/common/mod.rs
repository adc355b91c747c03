//! Shared helpers for engine tests.

#![allow(dead_code)]

use std::time::Duration;

use tokio::sync::mpsc;

use chunkload_transfer::UploadEvent;

pub use chunkload_transfer::testing::{MockTransport, Reply};

/// Receives events until `done` matches one, returning everything seen.
pub async fn collect_until(
    events: &mut mpsc::UnboundedReceiver<UploadEvent>,
    done: impl Fn(&UploadEvent) -> bool,
) -> Vec<UploadEvent> {
    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(600), events.recv())
            .await
            .expect("timed out waiting for upload events")
            .expect("event stream closed");
        let finished = done(&event);
        seen.push(event);
        if finished {
            return seen;
        }
    }
}

pub fn count(events: &[UploadEvent], pred: impl Fn(&UploadEvent) -> bool) -> usize {
    events.iter().filter(|e| pred(e)).count()
}
