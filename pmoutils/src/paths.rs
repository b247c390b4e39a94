//! Conversion entre chemins locaux et URI `file://`.

use std::path::{Path, PathBuf};

/// Construit une URI `file://` à partir d'un chemin local.
pub fn uri_from_local_path(path: &Path) -> String {
    format!("file://{}", path.display())
}

/// Extrait le chemin local d'une URI `file://`, `None` pour tout autre
/// schéma.
pub fn local_path_from_uri(uri: &str) -> Option<PathBuf> {
    uri.strip_prefix("file://").map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let path = Path::new("/tmp/subscriptions/root.xml");
        let uri = uri_from_local_path(path);
        assert_eq!(uri, "file:///tmp/subscriptions/root.xml");
        assert_eq!(local_path_from_uri(&uri).unwrap(), path);
    }

    #[test]
    fn non_file_scheme() {
        assert!(local_path_from_uri("http://example.com/x").is_none());
    }
}
