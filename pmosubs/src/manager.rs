//! The subscription manager itself.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use pmobus::{localhost, verbs, Envelope, ReplySink, RequestPump, SUBSMANAGER_REP_PORT, SUBSMANAGER_REQ_PORT};
use pmocds::{parse_subscription_update, CdsNode, ContentSet, ElementKind};
use pmoconfig::Config;
use pmoproc::{HandlerStub, Manager, ManagerDelegate};
use pmostore::SubscriptionStore;
use pmoutils::uri_from_local_path;

// When reading in subscriptions, one subscription may contain a
// reference to another. For security reasons not every scheme may be
// referenced from every other: a remote collection naming a local file
// source would be a significant flaw. The allow-list below maps parent
// scheme to the child schemes it may spawn; a scheme always nests into
// itself.
const ACCEPTABLE_NESTING: &[(&str, &[&str])] = &[("file", &["http"])];

/// Whether a child source scheme may be contained within a parent
/// source scheme.
pub fn can_nest(parent: &str, child: &str) -> bool {
    if parent == child {
        return true;
    }
    ACCEPTABLE_NESTING
        .iter()
        .find(|(p, _)| *p == parent)
        .map(|(_, children)| children.contains(&child))
        .unwrap_or(false)
}

fn uri_scheme(uri: &str) -> Option<String> {
    url::Url::parse(uri).ok().map(|u| u.scheme().to_string())
}

/// Paths of the pull handler binaries, keyed by scheme.
#[derive(Debug, Clone)]
pub struct HandlerBinaries {
    pub file: PathBuf,
    pub http: PathBuf,
}

impl HandlerBinaries {
    /// Look for the handler binaries next to the current executable.
    pub fn beside_current_exe() -> HandlerBinaries {
        let dir = std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(Path::to_path_buf))
            .unwrap_or_default();
        HandlerBinaries {
            file: dir.join("pmosubs-file-handler"),
            http: dir.join("pmosubs-http-handler"),
        }
    }
}

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

/// Manages subscriptions: one pull handler for the configured root
/// feed, one more per remote child encountered in delivered trees.
pub struct SubscriptionManager {
    manager: Manager,
    store: Arc<SubscriptionStore>,
    scheduler_pump: Arc<RequestPump>,
    subscription_root_uri: String,
    refresh_rate: Option<String>,
}

impl SubscriptionManager {
    pub fn new(config: &Config, binaries: HandlerBinaries) -> anyhow::Result<SubscriptionManager> {
        let store = Arc::new(SubscriptionStore::open(
            &config.subscription_management.persist_to,
        )?);

        let manager = Manager::new(localhost(SUBSMANAGER_REP_PORT), "Manage subscriptions");
        manager.add_handler(
            "file",
            HandlerStub::new([binaries.file.display().to_string()]),
        );
        manager.add_handler(
            "http",
            HandlerStub::new([binaries.http.display().to_string()]),
        );

        let scheduler_pump = Arc::new(RequestPump::spawn(
            localhost(SUBSMANAGER_REQ_PORT),
            Arc::new(SchedulerLink {
                registered: AtomicBool::new(false),
            }),
        ));

        // The subscription root may be given as a local path or as a
        // full URI.
        let root = &config.subscription_management.subscription_root;
        let subscription_root_uri = if root.contains("://") {
            root.clone()
        } else {
            uri_from_local_path(Path::new(root))
        };

        let refresh_rate = match config.subscription_management.refresh_rate.as_str() {
            "" => None,
            rate => Some(rate.to_string()),
        };

        Ok(SubscriptionManager {
            manager,
            store,
            scheduler_pump,
            subscription_root_uri,
            refresh_rate,
        })
    }

    pub fn manager(&self) -> &Manager {
        &self.manager
    }

    /// The main execution method: start supervising, then start the
    /// root handler.
    pub async fn start(&self) -> anyhow::Result<()> {
        self.manager
            .set_delegate(Arc::new(SubscriptionDelegate {
                store: Arc::clone(&self.store),
                scheduler_pump: Arc::clone(&self.scheduler_pump),
                subscription_root_uri: self.subscription_root_uri.clone(),
            }))
            .await;
        self.manager.start().await?;

        let mut stub = self.manager.uri_handler_stub(&self.subscription_root_uri)?;
        if let Some(rate) = &self.refresh_rate {
            stub.params.insert("refresh".to_string(), rate.clone());
        }
        self.manager.start_handler(stub).await?;
        info!("subscription manager started for {}", self.subscription_root_uri);
        Ok(())
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

struct SubscriptionDelegate {
    store: Arc<SubscriptionStore>,
    scheduler_pump: Arc<RequestPump>,
    subscription_root_uri: String,
}

#[async_trait]
impl ManagerDelegate for SubscriptionDelegate {
    async fn handle_verb(&self, manager: &Manager, request: &Envelope) -> Option<Envelope> {
        if request.verb() != "subscription_update" {
            return None;
        }
        let pong = Some(Envelope::reply(verbs::pong(), None));

        // 1. Parse the payload into a descriptor set.
        let (update_uri, descriptor_set) = match parse_subscription_update(request.body()) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("failed to parse subscription update: {e}");
                return pong;
            }
        };

        // 2. Persist it, raw tree plus the URI it arrived under.
        let set_elem = request.body().get_child("content-set")?;
        if let Err(e) = self
            .store
            .store_descriptor_set(set_elem, &[update_uri.clone()])
        {
            warn!("failed to persist subscription update: {e}");
            return pong;
        }

        // 3. Launch handlers for any remote child without one.
        self.launch_child_handlers(manager, &update_uri, &descriptor_set)
            .await;

        // 4. Reassemble the full tree and forward it to the scheduler.
        match self.store.select_root_id_for_uri(&update_uri) {
            Ok(Some(root_id)) => match self.store.reassemble(root_id) {
                Ok(Some(tree)) => {
                    let update =
                        verbs::subscription_update(&self.subscription_root_uri, tree);
                    self.scheduler_pump
                        .enqueue(Envelope::request(update, None));
                }
                Ok(None) => debug!("not ready to send update yet (reassembly incomplete)"),
                Err(e) => warn!("reassembly failed: {e}"),
            },
            Ok(None) => warn!("no persisted root for {update_uri}"),
            Err(e) => warn!("root lookup failed: {e}"),
        }

        pong
    }
}

impl SubscriptionDelegate {
    async fn launch_child_handlers(
        &self,
        manager: &Manager,
        parent_uri: &str,
        descriptor_set: &ContentSet,
    ) {
        let parent_scheme = uri_scheme(parent_uri).unwrap_or_default();

        for child in &descriptor_set.children {
            let CdsNode::Set(child_set) = child else {
                continue;
            };
            if child_set.kind != ElementKind::Remote {
                continue;
            }
            let sources = &child_set.files[0].sources;

            // Skip children that already have a running handler for
            // any of their sources.
            let mut is_handled = false;
            for source in sources {
                if manager
                    .lookup_running_handler_for_uri(&source.uri)
                    .await
                    .is_some()
                {
                    is_handled = true;
                    break;
                }
            }
            if is_handled {
                continue;
            }

            let source = &sources[0];
            let child_scheme = uri_scheme(&source.uri).unwrap_or_default();
            if !can_nest(&parent_scheme, &child_scheme) {
                warn!(
                    "refusing to nest scheme '{child_scheme}' under '{parent_scheme}' for {}",
                    source.uri
                );
                continue;
            }

            let mut stub = match manager.uri_handler_stub(&source.uri) {
                Ok(stub) => stub,
                Err(e) => {
                    warn!("no handler for {}: {e}", source.uri);
                    continue;
                }
            };
            if let Some(refresh) = &source.refresh {
                stub.params.insert("refresh".to_string(), refresh.clone());
            }
            if let Err(e) = manager.start_handler(stub).await {
                warn!("could not start handler for {}: {e}", source.uri);
            }
        }
    }
}
