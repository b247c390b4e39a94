use std::sync::Arc;

use pmocache::{needs_caching, Cache, CacheManager, RendererRegistry, DOWNLOAD_SUFFIX};
use pmocds::{ContentItem, ContentSet};
use pmoconfig::Config;
use pmoutils::xml::parse_str;
use tempfile::TempDir;

fn item_for_uri(uri: &str, content_type: &str) -> ContentItem {
    let xml = format!(
        "<content-item content-type='{content_type}'>\
           <requires-file><sources><uri>{uri}</uri></sources></requires-file>\
         </content-item>"
    );
    ContentItem::parse(&parse_str(&xml).unwrap()).unwrap()
}

fn item_with_md5(uri: &str, md5: &str) -> ContentItem {
    let xml = format!(
        "<content-item content-type='image/jpeg'>\
           <requires-file>\
             <hashes><hash type='md5'>{md5}</hash></hashes>\
             <sources><uri>{uri}</uri></sources>\
           </requires-file>\
         </content-item>"
    );
    ContentItem::parse(&parse_str(&xml).unwrap()).unwrap()
}

fn registry() -> Arc<RendererRegistry> {
    Arc::new(RendererRegistry::from_config(&Config::builtin().unwrap()))
}

/// Une source locale servie en file:// pour éviter tout réseau.
fn local_source(dir: &TempDir, name: &str, contents: &[u8]) -> String {
    let path = dir.path().join(name);
    std::fs::write(&path, contents).unwrap();
    format!("file://{}", path.display())
}

#[test]
fn file_name_is_sha1_of_uri_without_extension() {
    let name = Cache::file_name_for_uri("http://example.com/award.jpg");
    assert!(name.ends_with(".jpg"));
    assert_eq!(name.len(), 40 + 4);

    // Sans extension, rien n'est ajouté après le hash.
    let bare = Cache::file_name_for_uri("http://example.com/feed");
    assert_eq!(bare.len(), 40);

    // Le nom ne dépend que de l'URI.
    assert_eq!(name, Cache::file_name_for_uri("http://example.com/award.jpg"));
}

#[test]
fn dots_in_the_path_do_not_leak_into_the_extension() {
    let name = Cache::file_name_for_uri("http://example.com/v1.2/feed");
    assert_eq!(name.len(), 40, "no extension expected: {name}");
}

#[test]
fn cache_file_downloads_and_renames_atomically() {
    let source_dir = tempfile::tempdir().unwrap();
    let cache_dir = tempfile::tempdir().unwrap();
    let uri = local_source(&source_dir, "a.jpg", b"JPEG DATA");
    let item = item_for_uri(&uri, "image/jpeg");

    let cache = Cache::new(cache_dir.path());
    let path = cache.cache_file(&item, false).unwrap();

    assert!(path.exists());
    assert_eq!(std::fs::read(&path).unwrap(), b"JPEG DATA");
    assert_eq!(
        path.file_name().unwrap().to_str().unwrap(),
        Cache::file_name_for_uri(&uri)
    );

    // Aucun fichier .download ne survit à un téléchargement réussi.
    let sidecar = format!("{}{}", path.display(), DOWNLOAD_SUFFIX);
    assert!(!std::path::Path::new(&sidecar).exists());
    assert!(!cache.file_downloading(&item));
}

#[test]
fn cached_file_is_returned_without_refetching() {
    let source_dir = tempfile::tempdir().unwrap();
    let cache_dir = tempfile::tempdir().unwrap();
    let uri = local_source(&source_dir, "a.jpg", b"DATA");
    let item = item_for_uri(&uri, "image/jpeg");

    let cache = Cache::new(cache_dir.path());
    let first = cache.cache_file(&item, false).unwrap();

    // La source disparaît : le cache doit suffire.
    std::fs::remove_file(pmoutils::local_path_from_uri(&uri).unwrap()).unwrap();
    let second = cache.cache_file(&item, false).unwrap();
    assert_eq!(first, second);
}

#[test]
fn strict_check_accepts_matching_hash_and_uri_fallback() {
    let source_dir = tempfile::tempdir().unwrap();
    let cache_dir = tempfile::tempdir().unwrap();
    let uri = local_source(&source_dir, "a.jpg", b"DATA");

    let cache = Cache::new(cache_dir.path());
    // md5("DATA")
    let good = item_with_md5(&uri, "e44f9e348e41cb272efa87387728571b");
    cache.cache_file(&good, false).unwrap();
    assert!(cache.file_cached(&good, true).is_some());

    // Sans hash déclaré, l'URI sert d'identité de repli.
    let no_hash = item_for_uri(&uri, "image/jpeg");
    assert!(cache.file_cached(&no_hash, true).is_some());
}

#[test]
fn strict_check_deletes_stale_files() {
    let source_dir = tempfile::tempdir().unwrap();
    let cache_dir = tempfile::tempdir().unwrap();
    let uri = local_source(&source_dir, "a.jpg", b"OLD CONTENTS");

    let cache = Cache::new(cache_dir.path());
    let fetched = item_for_uri(&uri, "image/jpeg");
    let path = cache.cache_file(&fetched, false).unwrap();
    assert!(path.exists());

    // Le flux déclare désormais une autre empreinte : le fichier sur
    // disque est périmé et doit disparaître.
    let stale = item_with_md5(&uri, "0123456789abcdef0123456789abcdef");
    assert!(cache.file_cached(&stale, true).is_none());
    assert!(!path.exists(), "stale file should have been deleted");
}

#[test]
fn unreachable_source_is_a_url_error() {
    let cache_dir = tempfile::tempdir().unwrap();
    let cache = Cache::new(cache_dir.path());
    let item = item_for_uri("file:///does/not/exist.jpg", "image/jpeg");
    assert!(matches!(
        cache.cache_file(&item, false),
        Err(pmocache::CachingError::Url { .. })
    ));
}

#[test]
fn needs_caching_follows_the_renderer_table() {
    let registry = registry();
    assert!(needs_caching(
        &registry,
        &item_for_uri("http://e.com/a.jpg", "image/jpeg")
    ));
    // Le contenu web n'est pas pré-caché.
    assert!(!needs_caching(
        &registry,
        &item_for_uri("http://e.com/page.html", "text/html")
    ));
    // Type inconnu : pas de mise en cache.
    assert!(!needs_caching(
        &registry,
        &item_for_uri("http://e.com/x.bin", "model/gltf")
    ));
}

#[test]
fn inline_items_are_never_cached() {
    let xml = "<content-set type='inline'>\
                 <content-item type='inline' content-type='image/jpeg'>\
                   <requires-file><sources><uri>http://e.com/a.jpg</uri></sources></requires-file>\
                 </content-item>\
               </content-set>";
    let set = ContentSet::parse(&parse_str(xml).unwrap()).unwrap();
    let items = set.content_items();
    assert!(!needs_caching(&registry(), items[0]));
}

#[test]
fn concurrent_requests_for_one_item_converge() {
    let source_dir = tempfile::tempdir().unwrap();
    let cache_dir = tempfile::tempdir().unwrap();
    let uri = local_source(&source_dir, "race.jpg", b"RACE CONTENTS");
    let item = item_for_uri(&uri, "image/jpeg");

    let cache = Cache::new(cache_dir.path());
    let mut manager = CacheManager::new(cache.clone(), registry());
    manager.start(3);
    // Plusieurs workers voient le même élément ; un seul téléchargement
    // doit aboutir (les autres constatent le .download ou le fichier
    // final).
    for _ in 0..5 {
        manager.cache_file(item.clone());
    }

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while cache.file_cached(&item, false).is_none() {
        assert!(std::time::Instant::now() < deadline, "item never cached");
        std::thread::sleep(std::time::Duration::from_millis(50));
    }
    // Laisse les workers finir de traiter les doublons.
    std::thread::sleep(std::time::Duration::from_millis(300));
    manager.stop();

    let path = cache.file_cached(&item, true).unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), b"RACE CONTENTS");
    assert!(!cache.file_downloading(&item));
}

#[test]
fn manager_drains_the_queue() {
    let source_dir = tempfile::tempdir().unwrap();
    let cache_dir = tempfile::tempdir().unwrap();
    let uri = local_source(&source_dir, "a.jpg", b"POOLED");
    let item = item_for_uri(&uri, "image/jpeg");

    let cache = Cache::new(cache_dir.path());
    let mut manager = CacheManager::new(cache.clone(), registry());
    manager.start(2);
    manager.cache_file(item.clone());

    // Laisse un worker prendre l'élément.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while cache.file_cached(&item, false).is_none() {
        assert!(std::time::Instant::now() < deadline, "item never cached");
        std::thread::sleep(std::time::Duration::from_millis(50));
    }
    manager.stop();

    let path = cache.file_cached(&item, true).unwrap();
    assert_eq!(std::fs::read(path).unwrap(), b"POOLED");
}
