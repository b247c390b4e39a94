//! Renderer lifecycle and per-position visibility transitions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};
use uuid::Uuid;

use pmobus::{localhost, verbs, Envelope, ReplyEndpoint, RequestHandler, RENDERER_REQ_PORT};
use pmocache::{Cache, RendererRegistry};
use pmocds::ContentItem;
use pmoconfig::ParamKind;
use pmoproc::{HandlerStub, Subprocess};

use crate::{RendererError, FADING_ANIMATION_DURATION};

/// Position of the main content on the display.
pub const DEFAULT_POSITION: &str = "main";

/// Layout parameters handed to a renderer subprocess, e.g.
/// `layout_style`, `layout_x`, `layout_width`,
/// `layout_window_level_increase`.
pub type Layout = HashMap<String, String>;

/// Callbacks from the display manager back into scheduling. Passed in
/// at construction so the two managers need not own each other.
pub trait ScheduleTrigger: Send + Sync + 'static {
    /// A renderer failed to prepare its item; pick something else.
    fn trigger_item_scheduling(&self);
    /// An item became visible on the display.
    fn report_pageview(&self, item: &ContentItem);
}

/// One renderer that is, or is about to be, showing an item.
struct ExecutingRenderer {
    subprocess: Subprocess,
    position: String,
    renderer_id: String,
    item: ContentItem,
    is_visible: bool,
    active_timestamp: Option<Instant>,
    has_registered: bool,
}

struct DisplayInner {
    renderers: Mutex<HashMap<String, ExecutingRenderer>>,
    registry: Arc<RendererRegistry>,
    cache: Cache,
    trigger: Arc<dyn ScheduleTrigger>,
    endpoint: Mutex<Option<ReplyEndpoint>>,
    rep_addr: String,
    /// Command prefix used to start any renderer; the module name is
    /// appended with `-m`.
    renderer_starter: Vec<String>,
    fade_duration: std::time::Duration,
}

/// Manages the renderers and the items they show on screen.
///
/// Holds references to every running renderer behind one lock and
/// maintains at most one visible renderer per position: when a new
/// renderer reports that it finished loading, the previous renderer at
/// its position is stopped and dropped once the fade has played.
#[derive(Clone)]
pub struct DisplayManager {
    inner: Arc<DisplayInner>,
}

struct DisplayRpc(DisplayManager);

#[async_trait]
impl RequestHandler for DisplayRpc {
    async fn handle(&self, request: Envelope) -> Option<Envelope> {
        self.0.handle_request(request).await
    }
}

impl DisplayManager {
    pub fn new(
        registry: Arc<RendererRegistry>,
        cache: Cache,
        trigger: Arc<dyn ScheduleTrigger>,
        renderer_starter: Vec<String>,
    ) -> DisplayManager {
        Self::with_fade_duration(
            registry,
            cache,
            trigger,
            renderer_starter,
            FADING_ANIMATION_DURATION,
        )
    }

    /// As [`DisplayManager::new`], with a platform-specific fade time.
    pub fn with_fade_duration(
        registry: Arc<RendererRegistry>,
        cache: Cache,
        trigger: Arc<dyn ScheduleTrigger>,
        renderer_starter: Vec<String>,
        fade_duration: std::time::Duration,
    ) -> DisplayManager {
        DisplayManager {
            inner: Arc::new(DisplayInner {
                renderers: Mutex::new(HashMap::new()),
                registry,
                cache,
                trigger,
                endpoint: Mutex::new(None),
                rep_addr: localhost(RENDERER_REQ_PORT),
                renderer_starter,
                fade_duration,
            }),
        }
    }

    /// Start listening for renderer requests.
    pub async fn start(&self) -> Result<(), pmobus::BusError> {
        let rpc: Arc<dyn RequestHandler> = Arc::new(DisplayRpc(self.clone()));
        let endpoint = ReplyEndpoint::bind(&self.inner.rep_addr, rpc).await?;
        *self.inner.endpoint.lock().await = Some(endpoint);
        Ok(())
    }

    /// Stop the endpoint and take every renderer off the screen.
    pub async fn stop(&self) {
        if let Some(endpoint) = self.inner.endpoint.lock().await.take() {
            endpoint.stop().await;
        }
        self.remove_items().await;
    }

    /// Show an item. Non-blocking: renderer startup happens on its own
    /// task, failures end up re-triggering item scheduling.
    pub fn display_item(&self, item: ContentItem, layout: Option<Layout>, position: &str) {
        let this = self.clone();
        let position = position.to_string();
        tokio::spawn(async move {
            if let Err(e) = this.display_item_inner(item, layout, &position).await {
                error!("could not display item at {position}: {e}");
                this.inner.trigger.trigger_item_scheduling();
            }
        });
    }

    async fn display_item_inner(
        &self,
        item: ContentItem,
        layout: Option<Layout>,
        position: &str,
    ) -> Result<(), RendererError> {
        debug!("display {} at position {position}", item.uri());

        let entry = self
            .inner
            .registry
            .lookup(item.content_type())
            .ok_or_else(|| RendererError::UnsupportedContentType(item.content_type().to_string()))?
            .clone();

        // If the item is already up at this position and its renderer
        // does not need a restart, leave it alone.
        if !entry.restart_renderer && self.item_is_at_position(&item, position).await {
            debug!("item already at position {position}, not taking it off again");
            return Ok(());
        }

        self.start_renderer(item, entry.module, entry.param_kind, layout, position)
            .await?;
        Ok(())
    }

    async fn item_is_at_position(&self, item: &ContentItem, position: &str) -> bool {
        let renderers = self.inner.renderers.lock().await;
        renderers
            .values()
            .any(|r| r.position == position && r.is_visible && r.item == *item)
    }

    /// Resolve what the renderer subprocess should be pointed at: a
    /// local cache path for precached path-renderers, a URI otherwise
    /// (converting a bare local path to `file://` when needed).
    fn resolve_item_value(
        &self,
        item: &ContentItem,
        param_kind: ParamKind,
    ) -> Result<String, RendererError> {
        let precache = self
            .inner
            .registry
            .lookup(item.content_type())
            .map(|entry| entry.precache)
            .unwrap_or(false);

        let mut value = item.uri().to_string();
        if precache {
            match self.inner.cache.file_cached(item, false) {
                Some(path) => value = path.display().to_string(),
                None => return Err(RendererError::NotCached(item.uri().to_string())),
            }
        }

        if param_kind == ParamKind::Uri && !value.contains("://") {
            value = pmoutils::uri_from_local_path(std::path::Path::new(&value));
        }
        Ok(value)
    }

    async fn start_renderer(
        &self,
        item: ContentItem,
        module: String,
        param_kind: ParamKind,
        layout: Option<Layout>,
        position: &str,
    ) -> Result<String, RendererError> {
        let renderer_id = Uuid::new_v4().to_string();
        let value = self.resolve_item_value(&item, param_kind)?;

        let mut params: HashMap<String, String> = HashMap::new();
        let param_name = match param_kind {
            ParamKind::Path => "path",
            ParamKind::Uri => "uri",
        };
        params.insert(param_name.to_string(), value);
        if let Some(layout) = layout {
            params.extend(layout);
        }

        let mut args = self.inner.renderer_starter.clone();
        args.push("-m".to_string());
        args.push(module);
        let mut stub = HandlerStub::new(args);
        stub.params = params;
        stub.trailing_args = vec!["--uuid".to_string(), renderer_id.clone()];

        let mut subprocess = Subprocess::new(stub);
        subprocess.start(&self.inner.rep_addr)?;
        debug!("started renderer {renderer_id} ({})", subprocess.id());

        let renderer = ExecutingRenderer {
            subprocess,
            position: position.to_string(),
            renderer_id: renderer_id.clone(),
            item,
            is_visible: false,
            active_timestamp: None,
            has_registered: false,
        };
        self.inner
            .renderers
            .lock()
            .await
            .insert(renderer_id.clone(), renderer);
        Ok(renderer_id)
    }

    /// The visible item at a position, with the moment it became
    /// visible.
    pub async fn get_active_item(&self, position: &str) -> Option<(ContentItem, Instant)> {
        let renderers = self.inner.renderers.lock().await;
        renderers
            .values()
            .find(|r| r.position == position && r.is_visible)
            .and_then(|r| r.active_timestamp.map(|ts| (r.item.clone(), ts)))
    }

    /// Take the item at a position off the display.
    pub async fn remove_item(&self, position: &str) {
        let record = {
            let mut renderers = self.inner.renderers.lock().await;
            let id = renderers
                .values()
                .find(|r| r.position == position && r.is_visible)
                .map(|r| r.renderer_id.clone());
            id.and_then(|id| renderers.remove(&id))
        };
        match record {
            Some(record) => stop_in_background(record),
            None => warn!("no renderer found to remove at {position}"),
        }
    }

    /// Take every item off the screen.
    pub async fn remove_items(&self) {
        let records: Vec<ExecutingRenderer> = {
            let mut renderers = self.inner.renderers.lock().await;
            renderers.drain().map(|(_, record)| record).collect()
        };
        for record in records {
            stop_in_background(record);
        }
    }

    async fn handle_request(&self, request: Envelope) -> Option<Envelope> {
        match request.verb() {
            "register" => self.handle_register(&request).await,
            "ping" => {
                self.touch_checkin(&request).await;
                Some(Envelope::reply(verbs::pong(), request.token.as_deref()))
            }
            "finished_loading" => self.handle_finished_loading(&request).await,
            "preparation_failed" => self.handle_preparation_failed(&request).await,
            other => {
                warn!("unexpected renderer verb '{other}'");
                None
            }
        }
    }

    async fn handle_register(&self, request: &Envelope) -> Option<Envelope> {
        let token = request.token.as_deref()?;
        let mut renderers = self.inner.renderers.lock().await;
        let renderer = renderers
            .values_mut()
            .find(|r| r.subprocess.has_token(token));
        let Some(renderer) = renderer else {
            warn!("spoof renderer registration attempt: token is {token}");
            return None;
        };

        renderer.subprocess.register();
        renderer.has_registered = true;

        let mut params = renderer.subprocess.stub().params.clone();
        params.insert(
            "token".to_string(),
            renderer.subprocess.security_token().to_string(),
        );
        debug!("registered renderer {}", renderer.renderer_id);
        Some(Envelope::reply(verbs::params(&params), None))
    }

    async fn touch_checkin(&self, request: &Envelope) {
        let Some(token) = request.token.as_deref() else {
            return;
        };
        let mut renderers = self.inner.renderers.lock().await;
        match renderers
            .values_mut()
            .find(|r| r.subprocess.has_token(token))
        {
            Some(renderer) => renderer.subprocess.touch_checkin(),
            None => warn!("ping received for unknown renderer: token is {token}"),
        }
    }

    fn renderer_id_of(&self, request: &Envelope) -> Option<String> {
        match request.body().attributes.get("id") {
            Some(id) => Some(id.clone()),
            None => {
                error!("renderer message without an id attribute");
                None
            }
        }
    }

    /// A renderer finished loading its content: after the fade it
    /// becomes the one visible renderer at its position and the
    /// pageview is reported.
    async fn handle_finished_loading(&self, request: &Envelope) -> Option<Envelope> {
        let pong = Some(Envelope::reply(verbs::pong(), None));
        let Some(renderer_id) = self.renderer_id_of(request) else {
            return pong;
        };

        let item = {
            let renderers = self.inner.renderers.lock().await;
            match renderers.get(&renderer_id) {
                Some(renderer) => renderer.item.clone(),
                None => {
                    warn!("unknown renderer {renderer_id} finished loading");
                    return pong;
                }
            }
        };
        debug!("renderer {renderer_id} finished loading {}", item.uri());

        // Give the display time to play the fade before the old item
        // goes away and the pageview is counted.
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(this.inner.fade_duration).await;
            this.set_renderer_visible(&renderer_id).await;
            this.inner.trigger.report_pageview(&item);
        });

        pong
    }

    /// There can be only one visible renderer at a position: mark this
    /// one visible, stop every other registered renderer at the same
    /// position and drop the leftovers.
    async fn set_renderer_visible(&self, renderer_id: &str) {
        let to_stop: Vec<ExecutingRenderer> = {
            let mut renderers = self.inner.renderers.lock().await;
            let Some(renderer) = renderers.get_mut(renderer_id) else {
                return;
            };
            debug!("making {} visible at {}", renderer.item.uri(), renderer.position);
            renderer.is_visible = true;
            renderer.active_timestamp = Some(Instant::now());
            let position = renderer.position.clone();

            let stale_ids: Vec<String> = renderers
                .values()
                .filter(|r| {
                    r.renderer_id != renderer_id && r.has_registered && r.position == position
                })
                .map(|r| r.renderer_id.clone())
                .collect();
            stale_ids
                .into_iter()
                .filter_map(|id| renderers.remove(&id))
                .collect()
        };

        for mut record in to_stop {
            record.is_visible = false;
            stop_in_background(record);
        }
    }

    /// A renderer could not prepare its item: stop it, forget it and
    /// let the scheduler pick something else.
    async fn handle_preparation_failed(&self, request: &Envelope) -> Option<Envelope> {
        let pong = Some(Envelope::reply(verbs::pong(), None));
        let Some(renderer_id) = self.renderer_id_of(request) else {
            return pong;
        };

        let record = self.inner.renderers.lock().await.remove(&renderer_id);
        match record {
            Some(record) => {
                error!(
                    "failed to load {} by renderer {renderer_id} at position {}",
                    record.item.uri(),
                    record.position
                );
                stop_in_background(record);
            }
            None => warn!("unknown renderer {renderer_id} reported preparation failure"),
        }

        self.inner.trigger.trigger_item_scheduling();
        pong
    }
}

fn stop_in_background(mut record: ExecutingRenderer) {
    tokio::spawn(async move {
        record.subprocess.stop().await;
    });
}
