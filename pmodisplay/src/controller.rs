//! Display power control.
//!
//! The controller accepts `display_on until=<unix-ts>` requests and
//! keeps the panel powered while the latest deadline has not passed;
//! once it has, and the configured timeout on top of it, the panel is
//! switched off. The concrete way a panel is switched is behind
//! [`DisplayDevice`] — serial protocols live outside this crate.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use pmobus::{localhost, verbs, Envelope, ReplyEndpoint, RequestHandler, DISPLAYCONTROLLER_REP_PORT};

const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// A physical display that can be powered on and off.
pub trait DisplayDevice: Send + Sync + 'static {
    fn set_power(&self, on: bool);
}

/// Device used when no serial device is configured: power transitions
/// only show up in the log.
pub struct LoggingDisplayDevice;

impl DisplayDevice for LoggingDisplayDevice {
    fn set_power(&self, on: bool) {
        info!("display power {}", if on { "on" } else { "off" });
    }
}

struct ControllerState {
    /// Unix timestamp until which the display must stay on.
    keep_alive_until: Mutex<i64>,
    device: Arc<dyn DisplayDevice>,
    /// Extra time the panel stays on after the deadline passes.
    display_timeout: Duration,
}

struct ControllerRpc(Arc<ControllerState>);

#[async_trait]
impl RequestHandler for ControllerRpc {
    async fn handle(&self, request: Envelope) -> Option<Envelope> {
        match request.verb() {
            "ping" => Some(Envelope::reply(verbs::pong(), request.token.as_deref())),
            "display_on" => {
                let until: i64 = request
                    .body()
                    .attributes
                    .get("until")
                    .and_then(|raw| raw.parse().ok())?;
                let mut deadline = self.0.keep_alive_until.lock().await;
                // Deadlines only ever move forward.
                if until > *deadline {
                    *deadline = until;
                    debug!("display keep-alive extended to {until}");
                }
                Some(Envelope::reply(verbs::pong(), None))
            }
            other => {
                warn!("unexpected display controller verb '{other}'");
                None
            }
        }
    }
}

/// The display controller endpoint plus its power tick task.
pub struct DisplayController {
    state: Arc<ControllerState>,
    endpoint: Option<ReplyEndpoint>,
    tick: Option<JoinHandle<()>>,
    stop_tx: Option<watch::Sender<bool>>,
}

impl DisplayController {
    pub fn new(device: Arc<dyn DisplayDevice>, display_timeout: Duration) -> DisplayController {
        DisplayController {
            state: Arc::new(ControllerState {
                keep_alive_until: Mutex::new(0),
                device,
                display_timeout,
            }),
            endpoint: None,
            tick: None,
            stop_tx: None,
        }
    }

    pub async fn start(&mut self) -> Result<(), pmobus::BusError> {
        let rpc: Arc<dyn RequestHandler> = Arc::new(ControllerRpc(Arc::clone(&self.state)));
        self.endpoint = Some(ReplyEndpoint::bind(&localhost(DISPLAYCONTROLLER_REP_PORT), rpc).await?);

        let (stop_tx, mut stop_rx) = watch::channel(false);
        self.stop_tx = Some(stop_tx);
        let state = Arc::clone(&self.state);
        self.tick = Some(tokio::spawn(async move {
            let mut powered = false;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(TICK_INTERVAL) => {}
                    _ = stop_rx.changed() => return,
                }
                let deadline = *state.keep_alive_until.lock().await;
                let now = unix_now();
                let should_be_on = now < deadline;
                let should_be_off =
                    now > deadline + state.display_timeout.as_secs() as i64;
                if should_be_on && !powered {
                    state.device.set_power(true);
                    powered = true;
                } else if should_be_off && powered {
                    state.device.set_power(false);
                    powered = false;
                }
            }
        }));
        Ok(())
    }

    pub async fn stop(mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(true);
        }
        if let Some(tick) = self.tick.take() {
            let _ = tick.await;
        }
        if let Some(endpoint) = self.endpoint.take() {
            endpoint.stop().await;
        }
    }
}

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
