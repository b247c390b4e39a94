//! Pool de workers de mise en cache.
//!
//! Les éléments à mettre en cache arrivent dans une file non bornée ;
//! N workers la drainent, chacun vérifiant qu'un autre worker (ou
//! processus) n'a pas déjà pris l'élément en charge. Une source
//! injoignable est remise en file après un délai.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error};

use pmocds::ContentItem;

use crate::cache::Cache;
use crate::renderers::{needs_caching, RendererRegistry};
use crate::CachingError;

pub const DEFAULT_NUMBER_OF_THREADS: usize = 5;
pub const RETRY_FAILED_TIMEOUT: Duration = Duration::from_secs(5 * 60);

const QUEUE_POLL: Duration = Duration::from_secs(1);

/// Démarre et supervise les workers qui attendent sur la file de mise
/// en cache.
pub struct CacheManager {
    queue_tx: Sender<ContentItem>,
    queue_rx: Receiver<ContentItem>,
    cache: Cache,
    registry: Arc<RendererRegistry>,
    stop: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl CacheManager {
    pub fn new(cache: Cache, registry: Arc<RendererRegistry>) -> CacheManager {
        let (queue_tx, queue_rx) = unbounded();
        CacheManager {
            queue_tx,
            queue_rx,
            cache,
            registry,
            stop: Arc::new(AtomicBool::new(false)),
            workers: Vec::new(),
        }
    }

    /// Ajoute un élément à la file de mise en cache.
    pub fn cache_file(&self, item: ContentItem) {
        let _ = self.queue_tx.send(item);
    }

    /// Démarre N workers en attente sur la file.
    pub fn start(&mut self, number_of_threads: usize) {
        std::fs::create_dir_all(self.cache.cache_dir()).ok();
        for i in 0..number_of_threads {
            debug!("starting caching-listener-thread-{i}");
            let worker = CacheListener {
                cache: self.cache.clone(),
                registry: Arc::clone(&self.registry),
                queue_rx: self.queue_rx.clone(),
                queue_tx: self.queue_tx.clone(),
                stop: Arc::clone(&self.stop),
            };
            let handle = std::thread::Builder::new()
                .name(format!("caching-listener-thread-{i}"))
                .spawn(move || worker.run())
                .expect("failed to spawn caching listener thread");
            self.workers.push(handle);
        }
    }

    /// Arrête les workers (les reprises différées en vol sont
    /// abandonnées).
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for CacheManager {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

/// Un worker : prend les éléments de la file et lance leur mise en
/// cache.
struct CacheListener {
    cache: Cache,
    registry: Arc<RendererRegistry>,
    queue_rx: Receiver<ContentItem>,
    queue_tx: Sender<ContentItem>,
    stop: Arc<AtomicBool>,
}

impl CacheListener {
    fn run(self) {
        debug!("listening for cache queue");
        while !self.stop.load(Ordering::SeqCst) {
            let item = match self.queue_rx.recv_timeout(QUEUE_POLL) {
                Ok(item) => item,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            self.process(item);
        }
    }

    fn process(&self, item: ContentItem) {
        let uri = item.uri().to_string();

        // Un autre worker est déjà dessus.
        if self.cache.file_downloading(&item) {
            debug!("{uri} already downloading, skipping");
            return;
        }

        // Déjà en cache, par exemple si un autre processus a terminé
        // entre-temps.
        if self.cache.file_cached(&item, true).is_some() {
            return;
        }

        if !needs_caching(&self.registry, &item) {
            return;
        }

        debug!("trying to cache {uri}");
        match self.cache.cache_file(&item, false) {
            Ok(_) => {}
            Err(CachingError::Url { .. }) => {
                error!("can't cache {uri}, will retry later");
                let queue_tx = self.queue_tx.clone();
                let stop = Arc::clone(&self.stop);
                std::thread::spawn(move || {
                    std::thread::sleep(RETRY_FAILED_TIMEOUT);
                    if !stop.load(Ordering::SeqCst) {
                        let _ = queue_tx.send(item);
                    }
                });
            }
            Err(CachingError::Io(e)) => {
                error!("i/o error while caching {uri}: {e}");
            }
        }
    }
}
