//! Cache de fichiers adressé par URI.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use md5::Md5;
use sha1::{Digest, Sha1};
use tracing::{debug, error};

use pmocds::ContentItem;

use crate::renderers::{needs_caching, RendererRegistry};
use crate::CachingError;

/// Taille des blocs lus depuis la source pendant un téléchargement.
pub const CACHE_URLOPEN_DEFAULT_CHUNK: usize = 16 * 1024;
/// Taille des blocs lus pour le calcul des empreintes sur disque.
pub const CACHE_HASH_GEN_DEFAULT_CHUNK: usize = 32 * 1024;
/// Suffixe des téléchargements en cours.
pub const DOWNLOAD_SUFFIX: &str = ".download";

const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(20);

/// Accès au répertoire de cache.
///
/// Le répertoire est partagé entre threads et processus : les
/// téléchargements passent par un fichier `.download` renommé
/// atomiquement, si bien qu'un lecteur ne voit jamais de fichier final
/// partiel.
#[derive(Debug, Clone)]
pub struct Cache {
    cache_dir: PathBuf,
    fetch_timeout: Duration,
}

impl Cache {
    /// `cache_dir` doit être un chemin absolu.
    pub fn new<P: Into<PathBuf>>(cache_dir: P) -> Cache {
        Cache {
            cache_dir: cache_dir.into(),
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Cache {
        self.fetch_timeout = timeout;
        self
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Nom de fichier pour une URI : sha1 de l'URI sans extension,
    /// suivie de l'extension d'origine (conservée pour les renderers
    /// qui s'y fient).
    pub fn file_name_for_uri(uri: &str) -> String {
        let (stem, extension) = split_extension(uri);
        let mut hasher = Sha1::new();
        hasher.update(stem.as_bytes());
        format!("{}{}", hex::encode(hasher.finalize()), extension)
    }

    pub fn file_path(&self, item: &ContentItem) -> PathBuf {
        self.cache_dir.join(Self::file_name_for_uri(item.uri()))
    }

    fn download_path(&self, item: &ContentItem) -> PathBuf {
        let mut name = self.file_path(item).into_os_string();
        name.push(DOWNLOAD_SUFFIX);
        PathBuf::from(name)
    }

    /// Empreintes (sha1, md5) d'un fichier sur disque, calculées bloc
    /// par bloc pour supporter les gros fichiers.
    pub fn file_hashes(path: &Path) -> Result<[String; 2], CachingError> {
        let mut file = File::open(path)?;
        let mut sha1 = Sha1::new();
        let mut md5 = Md5::new();
        let mut chunk = vec![0u8; CACHE_HASH_GEN_DEFAULT_CHUNK];
        loop {
            let n = file.read(&mut chunk)?;
            if n == 0 {
                break;
            }
            sha1.update(&chunk[..n]);
            md5.update(&chunk[..n]);
        }
        Ok([hex::encode(sha1.finalize()), hex::encode(md5.finalize())])
    }

    /// Chemin du fichier si l'URI est déjà en cache, `None` sinon.
    ///
    /// En mode strict les empreintes md5/sha1 du fichier sont comparées
    /// à l'identité déclarée de l'élément ; un fichier périmé est
    /// supprimé. En mode non strict seule l'existence compte (beaucoup
    /// plus rapide, utilisé par le filtre de cache).
    pub fn file_cached(&self, item: &ContentItem, strict: bool) -> Option<PathBuf> {
        let cache_path = self.file_path(item);
        if !cache_path.is_file() {
            return None;
        }
        if !strict {
            debug!("file {} exists, not strict so returning cache path", item.uri());
            return Some(cache_path);
        }

        let mut hashes = match Self::file_hashes(&cache_path) {
            Ok(hashes) => hashes.to_vec(),
            Err(e) => {
                error!("could not hash {}: {e}", cache_path.display());
                return None;
            }
        };
        // L'URI elle-même compte comme identité de repli : un élément
        // sans empreinte déclarée ne doit pas être re-téléchargé en
        // boucle.
        hashes.push(item.uri().to_string());

        let identity = item.files[0].identity();
        if hashes.iter().any(|h| h == identity) {
            debug!("file {} is cached", item.uri());
            return Some(cache_path);
        }

        debug!(
            "hashes don't match for {}: local {hashes:?} vs declared {identity}",
            item.uri()
        );
        if let Err(e) = std::fs::remove_file(&cache_path) {
            error!("error deleting stale file {}: {e}", cache_path.display());
        }
        None
    }

    /// Vrai si un téléchargement est en cours pour cet élément.
    pub fn file_downloading(&self, item: &ContentItem) -> bool {
        self.download_path(item).is_file()
    }

    /// Vrai si l'élément doit être mis en cache (voir
    /// [`needs_caching`]).
    pub fn needs_to_be_cached(registry: &RendererRegistry, item: &ContentItem) -> bool {
        needs_caching(registry, item)
    }

    /// Met l'élément en cache s'il ne l'est pas déjà et retourne le
    /// chemin local du fichier.
    pub fn cache_file(&self, item: &ContentItem, refresh: bool) -> Result<PathBuf, CachingError> {
        if !refresh {
            if let Some(cached) = self.file_cached(item, true) {
                return Ok(cached);
            }
        }
        self.save_file(item)
    }

    fn save_file(&self, item: &ContentItem) -> Result<PathBuf, CachingError> {
        let cache_path = self.file_path(item);
        let download_path = self.download_path(item);
        let uri = item.uri();

        debug!("trying to cache {uri} into {}", cache_path.display());

        let mut reader = open_source(uri, self.fetch_timeout)?;
        write_chunked(&mut *reader, &download_path, uri)?;

        // Le téléchargement est complet : le renommage rend le fichier
        // visible d'un coup.
        std::fs::rename(&download_path, &cache_path)?;
        Ok(cache_path)
    }
}

fn split_extension(uri: &str) -> (&str, &str) {
    let last_segment_start = uri.rfind('/').map(|i| i + 1).unwrap_or(0);
    match uri[last_segment_start..].rfind('.') {
        Some(dot) => uri.split_at(last_segment_start + dot),
        None => (uri, ""),
    }
}

fn open_source(uri: &str, timeout: Duration) -> Result<Box<dyn Read>, CachingError> {
    let url_err = |reason: String| CachingError::Url {
        uri: uri.to_string(),
        reason,
    };

    if let Some(path) = pmoutils::local_path_from_uri(uri) {
        let file = File::open(&path).map_err(|e| url_err(e.to_string()))?;
        return Ok(Box::new(file));
    }

    if uri.starts_with("http://") || uri.starts_with("https://") {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build();
        let agent: ureq::Agent = config.into();
        let response = agent.get(uri).call().map_err(|e| url_err(e.to_string()))?;
        return Ok(Box::new(response.into_body().into_reader()));
    }

    Err(url_err("unsupported scheme".to_string()))
}

fn write_chunked(reader: &mut dyn Read, path: &Path, uri: &str) -> Result<(), CachingError> {
    let mut file = File::create(path)?;
    let mut chunk = vec![0u8; CACHE_URLOPEN_DEFAULT_CHUNK];
    loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                // Une lecture interrompue laisse un .download orphelin
                // que la prochaine tentative écrasera.
                return Err(CachingError::Url {
                    uri: uri.to_string(),
                    reason: e.to_string(),
                });
            }
        };
        file.write_all(&chunk[..n])?;
    }
    file.flush()?;
    Ok(())
}
