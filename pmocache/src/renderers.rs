//! Table des renderers par type MIME.
//!
//! Chaque entrée décrit le module de rendu à lancer pour un type de
//! contenu, la forme du paramètre attendu (chemin ou URI), et les
//! indicateurs `precache`, `stream` et `restart_renderer`.

use std::collections::HashMap;

use pmocds::{ContentItem, ElementKind};
use pmoconfig::{Config, RendererEntry};

/// Registre mime → renderer, construit depuis la configuration.
#[derive(Debug, Clone)]
pub struct RendererRegistry {
    entries: HashMap<String, RendererEntry>,
}

impl RendererRegistry {
    pub fn from_config(config: &Config) -> RendererRegistry {
        RendererRegistry {
            entries: config.renderers.clone(),
        }
    }

    /// Recherche l'entrée pour un type de contenu.
    ///
    /// La recherche est tolérante : le type complet d'abord, puis la
    /// partie avant `;` (« application/pdf; charset=binary »), puis la
    /// partie avant `/` (« image/jpeg » retombe sur « image »).
    pub fn lookup(&self, content_type: &str) -> Option<&RendererEntry> {
        if let Some(entry) = self.entries.get(content_type) {
            return Some(entry);
        }
        for sep in [';', '/'] {
            let simple = content_type.split(sep).next().unwrap_or("").trim();
            if let Some(entry) = self.entries.get(simple) {
                return Some(entry);
            }
        }
        None
    }
}

/// Vrai si l'élément doit (et peut) être mis en cache : un élément non
/// inline dont le type de contenu est connu et marqué `precache`.
pub fn needs_caching(registry: &RendererRegistry, item: &ContentItem) -> bool {
    if item.kind == ElementKind::Inline {
        return false;
    }
    registry
        .lookup(item.content_type())
        .map(|entry| entry.precache)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> RendererRegistry {
        RendererRegistry::from_config(&Config::builtin().unwrap())
    }

    #[test]
    fn exact_then_fuzzy_lookup() {
        let registry = registry();
        assert!(registry.lookup("application/pdf").is_some());
        assert!(registry.lookup("image/jpeg").is_some());
        assert!(registry.lookup("image/jpeg; charset=binary").is_some());
        assert!(registry.lookup("video/quicktime").is_some());
        assert!(registry.lookup("model/gltf").is_none());
    }

    #[test]
    fn vlc_entry_wins_over_generic_video() {
        let registry = registry();
        let vlc = registry.lookup("video/vnd.vlc").unwrap();
        assert!(vlc.stream);
        assert!(!vlc.precache);
        let generic = registry.lookup("video/mp4").unwrap();
        assert!(generic.precache);
    }
}
