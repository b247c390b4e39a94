//! Client side of the display controller: fire-and-forget keep-alive
//! extensions from the scheduler.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use pmobus::{localhost, verbs, Envelope, ReplySink, RequestPump, DISPLAYCONTROLLER_REP_PORT};

use crate::controller::unix_now;

struct SilentSink;

#[async_trait]
impl ReplySink for SilentSink {
    async fn on_reply(&self, _reply: Envelope) {}

    fn idle_ping(&self) -> Option<Envelope> {
        None
    }
}

/// Lets the scheduler power-control the display.
pub struct DisplayClient {
    pump: RequestPump,
}

impl DisplayClient {
    pub fn new() -> DisplayClient {
        DisplayClient {
            pump: RequestPump::spawn(localhost(DISPLAYCONTROLLER_REP_PORT), Arc::new(SilentSink)),
        }
    }

    /// Keep the display alive for the given duration from now.
    pub fn keep_display_alive_for(&self, duration: Duration) {
        let until = unix_now() + duration.as_secs() as i64;
        self.pump
            .enqueue(Envelope::request(verbs::display_on(until), None));
    }

    pub async fn stop(self) {
        self.pump.stop().await;
    }
}

impl Default for DisplayClient {
    fn default() -> Self {
        DisplayClient::new()
    }
}
