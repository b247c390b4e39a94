//! Magasin des arbres d'abonnement.
//!
//! Trois tables : `xml` (le texte XML de chaque content-set), `uri`
//! (les URI sources pointant vers un xml_id, plusieurs-vers-un) et
//! `xml_link` (les liens parent/enfant entre sous-arbres distants).
//! Le réassemblage recompose l'arbre complet en remplaçant chaque
//! content-set distant par le sous-arbre correspondant et en fusionnant
//! les contraintes du placeholder dans la racine du sous-arbre.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};
use xmltree::{Element, XMLNode};

use pmoutils::xml::{child_elements, element_to_string, normalized_text, parse_str};

use crate::StoreError;

// NOTE - INT plutôt qu'INTEGER dans xml_link pour éviter un champ
// AUTOINCREMENT implicite.
const SQL_CREATE_TABLES: &str = "
    CREATE TABLE IF NOT EXISTS xml (xml_id INTEGER PRIMARY KEY, xml TEXT);
    CREATE TABLE IF NOT EXISTS uri (xml_id INTEGER, uri TEXT PRIMARY KEY);
    CREATE TABLE IF NOT EXISTS xml_link (
        parent_id INTEGER, child_id INT PRIMARY KEY
    );
";
const SQL_DELETE_URIS: &str = "DELETE FROM uri WHERE xml_id = ?1";
const SQL_INSERT_XML: &str = "INSERT INTO xml (xml) VALUES (?1)";
const SQL_REPLACE_LINK: &str = "REPLACE INTO xml_link (parent_id, child_id) VALUES (?1, ?2)";
const SQL_REPLACE_URI: &str = "REPLACE INTO uri (xml_id, uri) VALUES (?1, ?2)";
const SQL_SELECT_CHILDREN: &str = "SELECT child_id FROM xml_link WHERE parent_id = ?1";
const SQL_SELECT_PARENT: &str = "SELECT parent_id FROM xml_link WHERE child_id = ?1";
const SQL_SELECT_ID_GIVEN_URI: &str = "SELECT xml_id FROM uri WHERE uri = ?1";
const SQL_SELECT_XML: &str = "SELECT xml FROM xml WHERE xml_id = ?1";
const SQL_UPDATE_XML: &str = "UPDATE xml SET xml = ?1 WHERE xml_id = ?2";

/// Magasin persistant des abonnements.
#[derive(Clone)]
pub struct SubscriptionStore {
    db_path: PathBuf,
}

impl SubscriptionStore {
    /// Ouvre (ou crée) le fichier SQLite et ses tables.
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<SubscriptionStore, StoreError> {
        let store = SubscriptionStore {
            db_path: db_path.as_ref().to_path_buf(),
        };
        let conn = store.connect()?;
        conn.execute_batch(SQL_CREATE_TABLES)
            .map_err(|e| store.db_err(e))?;
        Ok(store)
    }

    fn connect(&self) -> Result<Connection, StoreError> {
        Connection::open(&self.db_path).map_err(|e| self.db_err(e))
    }

    fn db_err(&self, source: rusqlite::Error) -> StoreError {
        StoreError::Database {
            path: self.db_path.clone(),
            source,
        }
    }

    /// Les enfants directs (liens) d'un xml_id.
    pub fn select_child_ids(&self, xml_id: i64) -> Result<Vec<i64>, StoreError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(SQL_SELECT_CHILDREN).map_err(|e| self.db_err(e))?;
        let ids = stmt
            .query_map([xml_id], |row| row.get(0))
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<i64>>>())
            .map_err(|e| self.db_err(e))?;
        Ok(ids)
    }

    /// Le parent d'un xml_id, `None` pour une racine.
    pub fn select_parent_id(&self, xml_id: i64) -> Result<Option<i64>, StoreError> {
        let conn = self.connect()?;
        conn.query_row(SQL_SELECT_PARENT, [xml_id], |row| row.get(0))
            .optional()
            .map_err(|e| self.db_err(e))
    }

    /// Remonte les liens parent depuis l'URI donnée jusqu'à la racine.
    pub fn select_root_id_for_uri(&self, uri: &str) -> Result<Option<i64>, StoreError> {
        let Some(mut xml_id) = self.select_xml_id_for_uri(uri)? else {
            return Ok(None);
        };
        while let Some(parent_id) = self.select_parent_id(xml_id)? {
            xml_id = parent_id;
        }
        Ok(Some(xml_id))
    }

    pub fn select_xml(&self, xml_id: i64) -> Result<Option<String>, StoreError> {
        let conn = self.connect()?;
        conn.query_row(SQL_SELECT_XML, [xml_id], |row| row.get(0))
            .optional()
            .map_err(|e| self.db_err(e))
    }

    pub fn select_xml_id_for_uri(&self, uri: &str) -> Result<Option<i64>, StoreError> {
        let conn = self.connect()?;
        conn.query_row(SQL_SELECT_ID_GIVEN_URI, [uri], |row| row.get(0))
            .optional()
            .map_err(|e| self.db_err(e))
    }

    /// Enregistre un content-set et, récursivement, ses enfants
    /// distants. `extra_uris` complète les sources propres de l'élément
    /// (l'URI de l'update pour la racine). Retourne le xml_id.
    pub fn store_descriptor_set(
        &self,
        set_elem: &Element,
        extra_uris: &[String],
    ) -> Result<i64, StoreError> {
        let mut uris = element_source_uris(set_elem);
        uris.extend(extra_uris.iter().cloned());

        // Une URI déjà connue identifie un enregistrement existant.
        let mut xml_id = None;
        for uri in &uris {
            if let Some(found) = self.select_xml_id_for_uri(uri)? {
                xml_id = Some(found);
                break;
            }
        }

        // Seul le contenu inline est stocké tel quel : un set distant
        // reste vide jusqu'à ce que son propre flux arrive.
        let is_inline = set_elem.attributes.get("type").map(String::as_str) == Some("inline");
        let inline_xml = if is_inline {
            element_to_string(set_elem)
        } else {
            String::new()
        };

        let xml_id = {
            let conn = self.connect()?;
            match xml_id {
                None => {
                    conn.execute(SQL_INSERT_XML, params![inline_xml])
                        .map_err(|e| self.db_err(e))?;
                    conn.last_insert_rowid()
                }
                Some(existing) => {
                    if !inline_xml.is_empty() {
                        conn.execute(SQL_UPDATE_XML, params![inline_xml, existing])
                            .map_err(|e| self.db_err(e))?;
                    }
                    existing
                }
            }
        };

        {
            let conn = self.connect()?;
            conn.execute(SQL_DELETE_URIS, params![xml_id])
                .map_err(|e| self.db_err(e))?;
            for uri in &uris {
                conn.execute(SQL_REPLACE_URI, params![xml_id, uri])
                    .map_err(|e| self.db_err(e))?;
            }
        }

        for child in child_elements(set_elem) {
            if child.name == "content-set" && is_remote(child) {
                let child_id = self.store_descriptor_set(child, &[])?;
                let conn = self.connect()?;
                conn.execute(SQL_REPLACE_LINK, params![xml_id, child_id])
                    .map_err(|e| self.db_err(e))?;
            }
        }

        Ok(xml_id)
    }

    /// Recompose l'arbre complet pour un xml_id.
    ///
    /// Retourne `None` quand le XML stocké est vide ou invalide, ou
    /// quand un placeholder référence une URI jamais persistée — dans
    /// ce cas l'appelant n'a rien d'utilisable à transmettre.
    pub fn reassemble(&self, xml_id: i64) -> Result<Option<Element>, StoreError> {
        let Some(stored_xml) = self.select_xml(xml_id)? else {
            return Ok(None);
        };
        let Ok(mut root) = parse_str(&stored_xml) else {
            return Ok(None);
        };

        let db_children = self.select_child_ids(xml_id)?;
        let mut used_children = Vec::new();

        // Positions des placeholders distants parmi les enfants.
        let mut index = 0;
        while index < root.children.len() {
            let XMLNode::Element(child) = &root.children[index] else {
                index += 1;
                continue;
            };
            if child.name != "content-set" || !is_remote(child) {
                index += 1;
                continue;
            }

            let Some(uri) = first_source_uri(child) else {
                return Ok(None);
            };
            let Some(child_id) = self.select_xml_id_for_uri(&uri)? else {
                return Ok(None);
            };

            if !db_children.contains(&child_id) {
                warn!("integrity: {child_id} is not a recorded child of {xml_id}");
                index += 1;
                continue;
            }
            used_children.push(child_id);

            let placeholder_constraints = collect_constraint_elements(child);
            match self.reassemble(child_id)? {
                Some(mut subtree) => {
                    merge_constraints(&mut subtree, placeholder_constraints);
                    root.children[index] = XMLNode::Element(subtree);
                    index += 1;
                }
                None => {
                    // Le flux de l'enfant n'est pas encore arrivé : le
                    // placeholder disparaît de l'arbre transmis.
                    root.children.remove(index);
                }
            }
        }

        let mut missing = db_children.clone();
        missing.retain(|id| !used_children.contains(id));
        if !missing.is_empty() {
            debug!("integrity: children {missing:?} of {xml_id} are not referenced any more");
        }

        Ok(Some(root))
    }
}

fn is_remote(elem: &Element) -> bool {
    elem.attributes.get("type").map(String::as_str) != Some("inline")
}

/// Toutes les URI sources d'un élément (requires-file > sources > uri).
fn element_source_uris(elem: &Element) -> Vec<String> {
    let mut uris = Vec::new();
    for requires in child_elements(elem) {
        if requires.name != "requires-file" {
            continue;
        }
        if let Some(sources) = requires.get_child("sources") {
            for uri_elem in child_elements(sources) {
                let uri = normalized_text(uri_elem);
                if !uri.is_empty() {
                    uris.push(uri);
                }
            }
        }
    }
    uris
}

fn first_source_uri(elem: &Element) -> Option<String> {
    element_source_uris(elem).into_iter().next()
}

/// Les éléments de contrainte d'un nœud, wrappers
/// `<scheduling-constraints>` aplatis.
fn collect_constraint_elements(elem: &Element) -> Vec<Element> {
    let Some(constraints) = elem.get_child("constraints") else {
        return Vec::new();
    };
    let mut collected = Vec::new();
    for child in child_elements(constraints) {
        if child.name == "scheduling-constraints" {
            collected.extend(child_elements(child).cloned());
        } else {
            collected.push(child.clone());
        }
    }
    collected
}

/// Étend le `<constraints>` du sous-arbre avec ceux du placeholder, en
/// le créant au besoin.
fn merge_constraints(subtree: &mut Element, extra: Vec<Element>) {
    match subtree.get_mut_child("constraints") {
        Some(constraints) => {
            constraints
                .children
                .extend(extra.into_iter().map(XMLNode::Element));
        }
        None => {
            let mut constraints = Element::new("constraints");
            constraints
                .children
                .extend(extra.into_iter().map(XMLNode::Element));
            subtree.children.push(XMLNode::Element(constraints));
        }
    }
}
