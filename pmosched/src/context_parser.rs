//! The context & constraints parser: the scheduler's two reply
//! endpoints.
//!
//! Subscription updates from the subscription manager are parsed into
//! descriptor sets and queued for the scheduling manager; sensor
//! updates are written into the context store before scheduling is
//! re-triggered. A touch-button push is special: it opens the app
//! selection overlay instead of writing context.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use pmobus::{
    localhost, verbs, Envelope, ReplyEndpoint, RequestHandler, SENSORMANAGER_REQ_PORT,
    SUBSMANAGER_REQ_PORT,
};
use pmocds::parse_subscription_update;
use pmostore::ContextStore;
use pmoutils::xml::{child_elements, element_to_string, normalized_text};

use crate::manager::SchedulingManager;

struct SubscriptionRpc {
    scheduler: SchedulingManager,
}

#[async_trait]
impl RequestHandler for SubscriptionRpc {
    async fn handle(&self, request: Envelope) -> Option<Envelope> {
        let pong = Some(Envelope::reply(verbs::pong(), None));
        match request.verb() {
            "ping" => pong,
            "subscription_update" => {
                debug!("handling subscription update");
                match parse_subscription_update(request.body()) {
                    Ok((_, cds)) => self.scheduler.enqueue_cds_update(cds),
                    // The previous set stays in force.
                    Err(e) => error!("parsing raw descriptor set failed: {e}"),
                }
                pong
            }
            other => {
                warn!("unexpected subscription verb '{other}'");
                None
            }
        }
    }
}

struct SensorRpc {
    scheduler: SchedulingManager,
    context_store: ContextStore,
}

#[async_trait]
impl RequestHandler for SensorRpc {
    async fn handle(&self, request: Envelope) -> Option<Envelope> {
        let pong = Some(Envelope::reply(verbs::pong(), None));
        match request.verb() {
            "ping" => pong,
            "sensor_update" => {
                info!("receiving sensor update");

                // A touch-button push opens the selection overlay and
                // writes nothing.
                if let Some(touch) = request.body().get_child("touch_input") {
                    if normalized_text(touch) == "touch_button_push" {
                        self.scheduler.show_touch_selection();
                        return pong;
                    }
                }

                let Some(context_type) = request.body().attributes.get("event").cloned() else {
                    warn!("sensor update without an event attribute");
                    return pong;
                };
                let payload = child_elements(request.body())
                    .next()
                    .map(element_to_string);

                let store = self.context_store.clone();
                let write = tokio::task::spawn_blocking(move || {
                    store.add_context(&context_type, payload.as_deref())
                })
                .await;
                match write {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => error!("trying to write unsupported sensor update: {e}"),
                    Err(e) => error!("context write task failed: {e}"),
                }

                // New context may change what should play right now.
                self.scheduler.trigger_item_scheduling();
                pong
            }
            other => {
                warn!("unexpected sensor verb '{other}'");
                None
            }
        }
    }
}

/// Owns the two endpoints for the scheduler's inbound traffic.
pub struct ContextConstraintsParser {
    subscription_endpoint: Option<ReplyEndpoint>,
    sensor_endpoint: Option<ReplyEndpoint>,
    scheduler: SchedulingManager,
    context_store: ContextStore,
}

impl ContextConstraintsParser {
    pub fn new(scheduler: SchedulingManager, context_store: ContextStore) -> ContextConstraintsParser {
        ContextConstraintsParser {
            subscription_endpoint: None,
            sensor_endpoint: None,
            scheduler,
            context_store,
        }
    }

    pub async fn start(&mut self) -> Result<(), pmobus::BusError> {
        let subscription: Arc<dyn RequestHandler> = Arc::new(SubscriptionRpc {
            scheduler: self.scheduler.clone(),
        });
        self.subscription_endpoint =
            Some(ReplyEndpoint::bind(&localhost(SUBSMANAGER_REQ_PORT), subscription).await?);

        let sensor: Arc<dyn RequestHandler> = Arc::new(SensorRpc {
            scheduler: self.scheduler.clone(),
            context_store: self.context_store.clone(),
        });
        self.sensor_endpoint =
            Some(ReplyEndpoint::bind(&localhost(SENSORMANAGER_REQ_PORT), sensor).await?);
        Ok(())
    }

    pub async fn stop(mut self) {
        if let Some(endpoint) = self.subscription_endpoint.take() {
            endpoint.stop().await;
        }
        if let Some(endpoint) = self.sensor_endpoint.take() {
            endpoint.stop().await;
        }
    }
}
