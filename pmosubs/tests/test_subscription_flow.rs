//! End-to-end: a real file pull handler is spawned, registers with the
//! one-off token, delivers the feed, and the reassembled tree reaches
//! the (fake) scheduler endpoint.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use pmobus::{localhost, verbs, Envelope, ReplyEndpoint, RequestHandler, SUBSMANAGER_REQ_PORT};
use pmoconfig::Config;
use pmosubs::{HandlerBinaries, SubscriptionManager};

const FEED: &str = "\
<content-set type='inline'>\
  <content-item content-type='image/jpeg'>\
    <requires-file><sources><uri>http://example.com/a.jpg</uri></sources></requires-file>\
  </content-item>\
</content-set>";

struct CapturingScheduler {
    updates: mpsc::UnboundedSender<Envelope>,
}

#[async_trait]
impl RequestHandler for CapturingScheduler {
    async fn handle(&self, request: Envelope) -> Option<Envelope> {
        if request.verb() == "subscription_update" {
            let _ = self.updates.send(request.clone());
        }
        Some(Envelope::reply(verbs::pong(), None))
    }
}

fn binaries() -> HandlerBinaries {
    HandlerBinaries {
        file: env!("CARGO_BIN_EXE_pmosubs-file-handler").into(),
        http: env!("CARGO_BIN_EXE_pmosubs-http-handler").into(),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn feed_travels_from_file_to_scheduler() {
    let dir = tempfile::tempdir().unwrap();
    let root_path = dir.path().join("root.xml");
    std::fs::write(&root_path, FEED).unwrap();

    // A fake scheduler on the real port captures what would normally
    // feed the filter pipeline.
    let (updates_tx, mut updates_rx) = mpsc::unbounded_channel();
    let scheduler = ReplyEndpoint::bind(
        &localhost(SUBSMANAGER_REQ_PORT),
        Arc::new(CapturingScheduler {
            updates: updates_tx,
        }),
    )
    .await
    .unwrap();

    let config = Config::from_yaml(&format!(
        "subscription_management:\n  subscription_root: \"{}\"\n  refresh_rate: \"1 HOUR\"\n  persist_to: \"{}\"\n",
        root_path.display(),
        dir.path().join("subs.sqlite").display(),
    ))
    .unwrap();

    let manager = SubscriptionManager::new(&config, binaries()).unwrap();
    manager.start().await.unwrap();

    // The handler registers, reads near-immediately and the update is
    // persisted, reassembled and forwarded.
    let update = tokio::time::timeout(Duration::from_secs(15), updates_rx.recv())
        .await
        .expect("no subscription update reached the scheduler")
        .unwrap();

    assert_eq!(update.verb(), "subscription_update");
    let uri = update.body().attributes.get("uri").unwrap();
    assert!(uri.starts_with("file://"), "forwarded uri: {uri}");
    let tree = update.body().get_child("content-set").unwrap();
    let item = tree.get_child("content-item").unwrap();
    assert_eq!(
        item.attributes.get("content-type").map(String::as_str),
        Some("image/jpeg")
    );

    manager.stop().await;
    scheduler.stop().await;
}
