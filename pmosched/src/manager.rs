//! The scheduling manager: consumes descriptor-set updates, runs the
//! filter pipeline and the lottery, and drives the display manager.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use pmocache::{Cache, CacheManager, RendererRegistry, DEFAULT_NUMBER_OF_THREADS};
use pmocds::{ContentItem, ContentSet};
use pmoconfig::Config;
use pmodisplay::{DisplayClient, DisplayManager, Layout, ScheduleTrigger, DEFAULT_POSITION};
use pmostore::{ContextStore, CONTEXT_TYPE_PAGEVIEW};

use crate::filters::{FilterContext, FilterPipeline};
use crate::lottery::LotteryScheduler;
use crate::{
    DEFAULT_CONTENT_DURATION, DISPLAY_ADDITIONAL_KEEP_ALIVE, TOUCH_INPUT_APP_SELECTION_POSITION,
    TOUCH_INPUT_APP_SELECTION_TIMEOUT, TOUCH_INPUT_BUTTON_POSITION,
    TOUCH_INPUT_CONTENT_TYPE_APP_SELECTION, TOUCH_INPUT_CONTENT_TYPE_BUTTON,
    TOUCH_INPUT_LAYOUT_MARGIN,
};

/// Retry interval when there is nothing schedulable.
const EMPTY_SCHEDULE_RETRY: Duration = Duration::from_secs(5);

/// Serialises `item_scheduling`: one executor at a time, at most one
/// queued re-run. Extra concurrent callers return immediately.
struct SchedulingGate {
    state: Mutex<(bool, bool)>, // (running, pending)
}

impl SchedulingGate {
    fn new() -> SchedulingGate {
        SchedulingGate {
            state: Mutex::new((false, false)),
        }
    }

    /// True when the caller becomes the executor.
    fn try_enter(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.0 {
            state.1 = true;
            return false;
        }
        state.0 = true;
        true
    }

    /// True when a re-run was queued while executing; the pending flag
    /// is consumed and the caller stays the executor.
    fn exit_or_rerun(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.1 {
            state.1 = false;
            return true;
        }
        state.0 = false;
        false
    }
}

struct SchedInner {
    default_duration: f64,
    display_width: u32,
    display_height: u32,
    cds: Mutex<Option<ContentSet>>,
    cds_tx: mpsc::UnboundedSender<ContentSet>,
    cds_rx: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<ContentSet>>>,
    context_store: ContextStore,
    cache: Cache,
    registry: Arc<RendererRegistry>,
    cache_manager: Mutex<CacheManager>,
    display_manager: DisplayManager,
    display_client: Mutex<Option<DisplayClient>>,
    pipeline: FilterPipeline,
    scheduler: LotteryScheduler,
    item_timer: Mutex<Option<JoinHandle<()>>>,
    selection_timer: Mutex<Option<JoinHandle<()>>>,
    gate: SchedulingGate,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
    update_loop: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Orchestrates filtering, the lottery, the display and the timers.
#[derive(Clone)]
pub struct SchedulingManager {
    inner: Arc<SchedInner>,
}

impl SchedulingManager {
    pub fn new(
        config: &Config,
        context_store: ContextStore,
        cache: Cache,
        registry: Arc<RendererRegistry>,
        cache_manager: CacheManager,
        display_manager: DisplayManager,
        display_client: DisplayClient,
    ) -> SchedulingManager {
        let default_duration = config
            .scheduling
            .default_content_duration_secs()
            .map(|secs| secs as f64)
            .unwrap_or(DEFAULT_CONTENT_DURATION);
        let (cds_tx, cds_rx) = mpsc::unbounded_channel();

        SchedulingManager {
            inner: Arc::new(SchedInner {
                default_duration,
                display_width: 1920,
                display_height: 1080,
                cds: Mutex::new(None),
                cds_tx,
                cds_rx: tokio::sync::Mutex::new(Some(cds_rx)),
                context_store,
                cache,
                registry,
                cache_manager: Mutex::new(cache_manager),
                display_manager,
                display_client: Mutex::new(Some(display_client)),
                pipeline: FilterPipeline::standard(),
                scheduler: LotteryScheduler::standard(),
                item_timer: Mutex::new(None),
                selection_timer: Mutex::new(None),
                gate: SchedulingGate::new(),
                stop_tx: Mutex::new(None),
                update_loop: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Queue a freshly parsed descriptor set. Updates equal to the
    /// current set are dropped in the consumer.
    pub fn enqueue_cds_update(&self, cds: ContentSet) {
        let _ = self.inner.cds_tx.send(cds);
    }

    /// Start the cache workers, the display endpoint and the update
    /// consumer.
    pub async fn start(&self) -> anyhow::Result<()> {
        info!("starting scheduler");
        self.inner
            .cache_manager
            .lock()
            .unwrap()
            .start(DEFAULT_NUMBER_OF_THREADS);
        self.inner.display_manager.start().await?;

        let (stop_tx, stop_rx) = watch::channel(false);
        *self.inner.stop_tx.lock().unwrap() = Some(stop_tx);
        let rx = self
            .inner
            .cds_rx
            .lock()
            .await
            .take()
            .expect("scheduling manager started twice");
        let this = self.clone();
        *self.inner.update_loop.lock().await = Some(tokio::spawn(this.update_loop(rx, stop_rx)));
        Ok(())
    }

    pub async fn stop(&self) {
        if let Some(stop_tx) = self.inner.stop_tx.lock().unwrap().take() {
            let _ = stop_tx.send(true);
        }
        if let Some(task) = self.inner.update_loop.lock().await.take() {
            let _ = task.await;
        }
        cancel_timer(&self.inner.item_timer);
        cancel_timer(&self.inner.selection_timer);
        self.inner.display_manager.stop().await;
        let client = self.inner.display_client.lock().unwrap().take();
        if let Some(client) = client {
            client.stop().await;
        }
        let inner = Arc::clone(&self.inner);
        let _ = tokio::task::spawn_blocking(move || {
            inner.cache_manager.lock().unwrap().stop();
        })
        .await;
    }

    /// Waits for updates through the queue and re-initiates caching
    /// and scheduling whenever a genuinely new set arrives.
    async fn update_loop(
        self,
        mut rx: mpsc::UnboundedReceiver<ContentSet>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        debug!("waiting for subscription updates");
        loop {
            let update = tokio::select! {
                update = rx.recv() => match update {
                    Some(update) => update,
                    None => return,
                },
                _ = stop_rx.changed() => return,
            };

            // Skip updates that deep-equal the current set.
            let changed = {
                let mut cds = self.inner.cds.lock().unwrap();
                if cds.as_ref() == Some(&update) {
                    false
                } else {
                    *cds = Some(update.clone());
                    true
                }
            };
            if !changed {
                continue;
            }
            debug!(
                "received new subscription update with {} items",
                update.len()
            );

            // Cache all items since we got some new ones.
            {
                let cache_manager = self.inner.cache_manager.lock().unwrap();
                for item in update.content_items() {
                    cache_manager.cache_file(item.clone());
                }
            }

            self.trigger_item_scheduling();
            self.initialise_touch_button().await;
        }
    }

    /// Kick `item_scheduling` without blocking the caller.
    pub fn trigger_item_scheduling(&self) {
        let this = self.clone();
        tokio::spawn(async move { this.run_item_scheduling().await });
    }

    async fn run_item_scheduling(&self) {
        if !self.inner.gate.try_enter() {
            debug!("item scheduling already running, queued a re-run");
            return;
        }
        loop {
            self.item_scheduling_once().await;
            if !self.inner.gate.exit_or_rerun() {
                break;
            }
            debug!("re-running item scheduling for a queued caller");
        }
    }

    /// One scheduling round: filter, draw, display, re-arm the timer.
    async fn item_scheduling_once(&self) {
        cancel_timer(&self.inner.item_timer);

        let Some(cds) = self.inner.cds.lock().unwrap().clone() else {
            self.start_item_scheduling_timeout(EMPTY_SCHEDULE_RETRY);
            return;
        };

        // Filtering touches SQLite and the filesystem; keep it off the
        // async workers.
        let inner = Arc::clone(&self.inner);
        let filtered = tokio::task::spawn_blocking(move || {
            let ctx = FilterContext {
                context_store: inner.context_store.clone(),
                cache: inner.cache.clone(),
                registry: (*inner.registry).clone(),
            };
            inner.pipeline.filter_cds(&cds, &ctx)
        })
        .await
        .unwrap_or_else(|e| {
            error!("filter pipeline panicked: {e}");
            ContentSet {
                kind: pmocds::ElementKind::Inline,
                constraints: Vec::new(),
                files: Vec::new(),
                children: Vec::new(),
            }
        });

        if filtered.is_empty() {
            // Take the current item offline and try again later.
            self.inner.display_manager.remove_items().await;
            self.start_item_scheduling_timeout(EMPTY_SCHEDULE_RETRY);
            return;
        }

        let inner = Arc::clone(&self.inner);
        let mut drawn = tokio::task::spawn_blocking(move || {
            inner
                .scheduler
                .get_items_to_schedule(&filtered, &inner.context_store, 1)
        })
        .await
        .unwrap_or_default();

        let Some(new_item) = drawn.pop() else {
            self.start_item_scheduling_timeout(EMPTY_SCHEDULE_RETRY);
            return;
        };

        let new_item_duration = new_item.duration().unwrap_or(self.inner.default_duration);

        // Keep the panel awake a little beyond the item itself.
        let keep_alive = Duration::from_secs_f64(new_item_duration) + DISPLAY_ADDITIONAL_KEEP_ALIVE;
        self.keep_display_alive(keep_alive);

        // Only re-present when the winner differs from what is already
        // showing.
        if let Some((active_item, active_since)) = self
            .inner
            .display_manager
            .get_active_item(DEFAULT_POSITION)
            .await
        {
            if active_item == new_item {
                debug!("scheduler drew the item already on screen");
                match active_item.duration() {
                    None => {
                        // Nothing to restart; report the pageview so
                        // a one-item schedule still counts plays.
                        self.report_pageview_for(&active_item);
                        self.start_item_scheduling_timeout(Duration::from_secs_f64(
                            self.inner.default_duration,
                        ));
                        return;
                    }
                    Some(active_duration) => {
                        let remaining = active_duration - active_since.elapsed().as_secs_f64();
                        if remaining > 0.0 {
                            self.start_item_scheduling_timeout(Duration::from_secs_f64(remaining));
                            return;
                        }
                        // Time is up: fall through and re-present.
                    }
                }
            }
        }

        debug!("new item to schedule: {}", new_item.uri());
        self.inner
            .display_manager
            .display_item(new_item, None, DEFAULT_POSITION);
        self.start_item_scheduling_timeout(Duration::from_secs_f64(new_item_duration));
    }

    fn start_item_scheduling_timeout(&self, timeout: Duration) {
        cancel_timer(&self.inner.item_timer);
        let this = self.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            this.run_item_scheduling().await;
        });
        *self.inner.item_timer.lock().unwrap() = Some(task);
    }

    fn keep_display_alive(&self, duration: Duration) {
        if let Some(client) = self.inner.display_client.lock().unwrap().as_ref() {
            client.keep_display_alive_for(duration);
        }
    }

    /// Record that an item became visible.
    pub fn report_pageview_for(&self, item: &ContentItem) {
        let store = self.inner.context_store.clone();
        let xml = item.to_xml_string();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = store.add_context(CONTEXT_TYPE_PAGEVIEW, Some(&xml)) {
                error!("could not record pageview: {e}");
            }
        });
    }

    /// Put the touch button up when the schedule is touch-enabled,
    /// i.e. contains both the button and the app selection page.
    async fn initialise_touch_button(&self) {
        let cds = self.inner.cds.lock().unwrap().clone();
        let Some(cds) = cds else {
            return;
        };

        if self
            .inner
            .display_manager
            .get_active_item(TOUCH_INPUT_BUTTON_POSITION)
            .await
            .is_some()
        {
            debug!("touch button was already initialised");
            return;
        }

        let button = cds.item_by_content_type(TOUCH_INPUT_CONTENT_TYPE_BUTTON);
        let selection = cds.item_by_content_type(TOUCH_INPUT_CONTENT_TYPE_APP_SELECTION);
        let (Some(button), Some(_)) = (button, selection) else {
            debug!("touch button and/or app selection page not in the schedule");
            return;
        };

        // A small square-ish button aligned bottom right.
        let width = 200u32;
        let height = 130u32;
        let layout = self.layout(
            self.inner.display_width - width - TOUCH_INPUT_LAYOUT_MARGIN,
            TOUCH_INPUT_LAYOUT_MARGIN,
            width,
            height,
            1,
        );
        self.inner.display_manager.display_item(
            button.clone(),
            Some(layout),
            TOUCH_INPUT_BUTTON_POSITION,
        );
    }

    /// Show the app selection overlay; it hides itself after a while.
    pub fn show_touch_selection(&self) {
        let this = self.clone();
        tokio::spawn(async move {
            let cds = this.inner.cds.lock().unwrap().clone();
            let Some(cds) = cds else {
                return;
            };
            let Some(selection) =
                cds.item_by_content_type(TOUCH_INPUT_CONTENT_TYPE_APP_SELECTION)
            else {
                return;
            };

            let width = this.inner.display_width - TOUCH_INPUT_LAYOUT_MARGIN * 2;
            let height = 130u32;
            let layout = this.layout(
                TOUCH_INPUT_LAYOUT_MARGIN,
                TOUCH_INPUT_LAYOUT_MARGIN,
                width,
                height,
                2,
            );
            this.inner.display_manager.display_item(
                selection.clone(),
                Some(layout),
                TOUCH_INPUT_APP_SELECTION_POSITION,
            );

            cancel_timer(&this.inner.selection_timer);
            let hide = this.clone();
            let timer = tokio::spawn(async move {
                tokio::time::sleep(TOUCH_INPUT_APP_SELECTION_TIMEOUT).await;
                hide.inner
                    .display_manager
                    .remove_item(TOUCH_INPUT_APP_SELECTION_POSITION)
                    .await;
            });
            *this.inner.selection_timer.lock().unwrap() = Some(timer);
        });
    }

    fn layout(&self, x: u32, y: u32, width: u32, height: u32, window_level_increase: u32) -> Layout {
        let mut layout: Layout = HashMap::new();
        layout.insert("layout_style".into(), "x_y_width_height".into());
        layout.insert("layout_x".into(), x.to_string());
        layout.insert("layout_y".into(), y.to_string());
        layout.insert("layout_width".into(), width.to_string());
        layout.insert("layout_height".into(), height.to_string());
        layout.insert(
            "layout_window_level_increase".into(),
            window_level_increase.to_string(),
        );
        layout
    }
}

fn cancel_timer(slot: &Mutex<Option<JoinHandle<()>>>) {
    if let Some(task) = slot.lock().unwrap().take() {
        task.abort();
    }
}

/// Late-bound [`ScheduleTrigger`]: the display manager is built before
/// the scheduling manager, so it gets this cell and the scheduling
/// manager is slotted in afterwards.
pub struct TriggerCell {
    cell: OnceLock<SchedulingManager>,
}

impl TriggerCell {
    pub fn new() -> Arc<TriggerCell> {
        Arc::new(TriggerCell {
            cell: OnceLock::new(),
        })
    }

    pub fn set(&self, manager: SchedulingManager) {
        let _ = self.cell.set(manager);
    }
}

impl ScheduleTrigger for TriggerCell {
    fn trigger_item_scheduling(&self) {
        if let Some(manager) = self.cell.get() {
            manager.trigger_item_scheduling();
        }
    }

    fn report_pageview(&self, item: &ContentItem) {
        if let Some(manager) = self.cell.get() {
            manager.report_pageview_for(item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::SchedulingGate;

    #[test]
    fn gate_admits_one_executor() {
        let gate = SchedulingGate::new();
        assert!(gate.try_enter());
        assert!(!gate.try_enter());
        // The queued caller makes the executor loop once more.
        assert!(gate.exit_or_rerun());
        // No further callers queued: the executor releases the gate.
        assert!(!gate.exit_or_rerun());
        assert!(gate.try_enter());
    }

    #[test]
    fn gate_queues_at_most_one_waiter() {
        let gate = SchedulingGate::new();
        assert!(gate.try_enter());
        assert!(!gate.try_enter());
        assert!(!gate.try_enter());
        assert!(!gate.try_enter());
        // All the extra callers collapsed into a single re-run.
        assert!(gate.exit_or_rerun());
        assert!(!gate.exit_or_rerun());
    }
}
