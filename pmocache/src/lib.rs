//! Module de cache de contenu de PMOSignage.
//!
//! Les fichiers sont adressés par contenu de leur URI : le nom sur
//! disque est `sha1(uri sans extension) + extension`, les
//! téléchargements en cours portent le suffixe `.download` et sont
//! renommés atomiquement une fois complets. Un pool de workers draine
//! la file des éléments à mettre en cache, avec reprise différée quand
//! une source est injoignable.

pub mod cache;
pub mod manager;
pub mod renderers;

use thiserror::Error;

pub use cache::{Cache, DOWNLOAD_SUFFIX};
pub use manager::{CacheManager, DEFAULT_NUMBER_OF_THREADS, RETRY_FAILED_TIMEOUT};
pub use renderers::{needs_caching, RendererRegistry};

#[derive(Debug, Error)]
pub enum CachingError {
    /// La source est injoignable ou a expiré : l'élément repassera
    /// dans la file plus tard.
    #[error("error while opening source '{uri}': {reason}")]
    Url { uri: String, reason: String },
    /// Le système de fichiers a refusé l'écriture : l'élément est
    /// traité comme non mis en cache.
    #[error("error while writing cache file: {0}")]
    Io(#[from] std::io::Error),
}
