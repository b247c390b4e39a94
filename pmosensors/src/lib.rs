//! # pmosensors
//!
//! The sensor manager: it supervises sensor handler subprocesses
//! (touch panels, presence beacons, socket feeds) and forwards their
//! `sensor_update` requests to the scheduler, which writes them into
//! the context store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use pmobus::{
    localhost, verbs, Envelope, ReplySink, RequestPump, SENSORMANAGER_REP_PORT,
    SENSORMANAGER_REQ_PORT,
};
use pmoproc::{HandlerStub, Manager, ManagerDelegate};

struct SchedulerLink {
    registered: AtomicBool,
}

#[async_trait]
impl ReplySink for SchedulerLink {
    async fn on_reply(&self, reply: Envelope) {
        if reply.verb() == "pong" {
            self.registered.store(true, Ordering::SeqCst);
        }
    }

    fn idle_ping(&self) -> Option<Envelope> {
        if self.registered.load(Ordering::SeqCst) {
            Some(Envelope::request(verbs::ping(), None))
        } else {
            None
        }
    }
}

struct SensorDelegate {
    scheduler_pump: Arc<RequestPump>,
}

#[async_trait]
impl ManagerDelegate for SensorDelegate {
    async fn handle_verb(&self, _manager: &Manager, request: &Envelope) -> Option<Envelope> {
        if request.verb() != "sensor_update" {
            return None;
        }
        // Pass the update through to the scheduler untouched; the
        // handler's token stays between the handler and us.
        self.scheduler_pump
            .enqueue(Envelope::request(request.body().clone(), None));
        Some(Envelope::reply(verbs::pong(), None))
    }
}

/// Manages sensor handlers.
pub struct SensorManager {
    manager: Manager,
    scheduler_pump: Arc<RequestPump>,
}

impl SensorManager {
    pub fn new() -> SensorManager {
        let manager = Manager::new(localhost(SENSORMANAGER_REP_PORT), "Manage sensors");
        let scheduler_pump = Arc::new(RequestPump::spawn(
            localhost(SENSORMANAGER_REQ_PORT),
            Arc::new(SchedulerLink {
                registered: AtomicBool::new(false),
            }),
        ));
        SensorManager {
            manager,
            scheduler_pump,
        }
    }

    pub fn manager(&self) -> &Manager {
        &self.manager
    }

    /// Register a sensor handler stub under its URI scheme.
    pub fn add_handler(&self, scheme: &str, stub: HandlerStub) {
        self.manager.add_handler(scheme, stub);
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        self.manager
            .set_delegate(Arc::new(SensorDelegate {
                scheduler_pump: Arc::clone(&self.scheduler_pump),
            }))
            .await;
        self.manager.start().await?;
        info!("sensor manager started");
        Ok(())
    }

    /// Start one handler for the given sensor URI.
    pub async fn start_sensor(&self, uri: &str) -> anyhow::Result<String> {
        let stub = self.manager.uri_handler_stub(uri)?;
        Ok(self.manager.start_handler(stub).await?)
    }

    pub async fn stop(self) {
        self.manager.stop().await;
        self.manager.clear_delegate().await;
        match Arc::try_unwrap(self.scheduler_pump) {
            Ok(pump) => pump.stop().await,
            Err(_) => warn!("scheduler pump still shared at shutdown"),
        }
    }
}

impl Default for SensorManager {
    fn default() -> Self {
        SensorManager::new()
    }
}
