//! The content descriptor set tree: sets, items and the files behind
//! them.

use thiserror::Error;
use tracing::warn;
use xmltree::Element;

use pmoutils::xml::{child_elements, element_to_string, elements_equal, normalized_text};

use crate::constraint::{Constraint, ConstraintError};

#[derive(Debug, Error)]
pub enum CdsError {
    #[error("expected element '{expected}' not found")]
    MissingElement { expected: &'static str },
    #[error("invalid element type '{0}'")]
    InvalidElementKind(String),
    #[error("remote items must have a sources tag containing at least one source")]
    MissingSources,
    #[error("tag 'uri' must contain text, not found")]
    EmptyUri,
    #[error("tag 'hash' must contain a type attribute and text")]
    InvalidHash,
    #[error("remote item must contain at least one requires-file tag")]
    MissingRequiresFile,
    #[error("a remote content set must be composed of exactly one file, found {0}")]
    RemoteSetFileCount(usize),
    #[error(transparent)]
    Constraint(#[from] ConstraintError),
}

/// Whether a node's body is embedded in place or fetched from a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ElementKind {
    Inline,
    #[default]
    Remote,
}

impl ElementKind {
    fn from_elem(elem: &Element) -> Result<ElementKind, CdsError> {
        match elem.attributes.get("type").map(String::as_str) {
            None | Some("remote") => Ok(ElementKind::Remote),
            Some("inline") => Ok(ElementKind::Inline),
            Some(other) => Err(CdsError::InvalidElementKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Md5,
    Sha1,
}

impl HashAlgorithm {
    fn from_attr(value: &str) -> Option<HashAlgorithm> {
        match value.to_ascii_lowercase().as_str() {
            "md5" => Some(HashAlgorithm::Md5),
            "sha1" => Some(HashAlgorithm::Sha1),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHash {
    pub algorithm: HashAlgorithm,
    pub value: String,
}

/// One way of retrieving a file: a URI plus an optional refresh rate
/// (a time-interval string such as `"30 MINS"`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSource {
    pub uri: String,
    pub refresh: Option<String>,
}

/// The physical file behind a remote set or a content item: one or more
/// source URIs and zero or more content hashes keyed by algorithm.
#[derive(Debug, Clone, PartialEq)]
pub struct RequiresFile {
    pub sources: Vec<FileSource>,
    pub hashes: Vec<FileHash>,
}

impl RequiresFile {
    /// Parse a `<requires-file>` element.
    ///
    /// Duplicate hashes of one algorithm that disagree are all dropped;
    /// agreeing duplicates collapse to one entry.
    pub fn parse(elem: &Element) -> Result<RequiresFile, CdsError> {
        let sources_elem = elem.get_child("sources").ok_or(CdsError::MissingSources)?;
        let mut sources = Vec::new();
        for uri_elem in child_elements(sources_elem) {
            let uri = normalized_text(uri_elem);
            if uri.is_empty() {
                return Err(CdsError::EmptyUri);
            }
            sources.push(FileSource {
                uri,
                refresh: uri_elem.attributes.get("refresh").cloned(),
            });
        }
        if sources.is_empty() {
            return Err(CdsError::MissingSources);
        }

        let mut hashes: Vec<FileHash> = Vec::new();
        if let Some(hashes_elem) = elem.get_child("hashes") {
            for hash_elem in child_elements(hashes_elem) {
                let algorithm = hash_elem
                    .attributes
                    .get("type")
                    .and_then(|value| HashAlgorithm::from_attr(value))
                    .ok_or(CdsError::InvalidHash)?;
                let value = normalized_text(hash_elem);
                if value.is_empty() {
                    return Err(CdsError::InvalidHash);
                }
                match hashes.iter().position(|h| h.algorithm == algorithm) {
                    Some(idx) if hashes[idx].value != value => {
                        hashes.retain(|h| h.algorithm != algorithm);
                    }
                    Some(_) => {}
                    None => hashes.push(FileHash { algorithm, value }),
                }
            }
        }

        Ok(RequiresFile { sources, hashes })
    }

    pub fn first_uri(&self) -> &str {
        &self.sources[0].uri
    }

    pub fn hash(&self, algorithm: HashAlgorithm) -> Option<&str> {
        self.hashes
            .iter()
            .find(|h| h.algorithm == algorithm)
            .map(|h| h.value.as_str())
    }

    /// Identity string for comparisons: prefer a hash, fall back to the
    /// first source URI.
    pub fn identity(&self) -> &str {
        self.hash(HashAlgorithm::Md5)
            .or_else(|| self.hash(HashAlgorithm::Sha1))
            .unwrap_or_else(|| self.first_uri())
    }
}

/// A leaf of the tree: one playable artifact.
#[derive(Debug, Clone)]
pub struct ContentItem {
    pub kind: ElementKind,
    pub content_type: Option<String>,
    pub constraints: Vec<Constraint>,
    pub files: Vec<RequiresFile>,
    /// The source XML, kept for context-store records and structural
    /// comparison against sensed events.
    xml: Element,
}

impl ContentItem {
    pub fn parse(elem: &Element) -> Result<ContentItem, CdsError> {
        let kind = ElementKind::from_elem(elem)?;
        let constraints = parse_node_constraints(elem)?;
        let files = parse_requires_files(elem, kind)?;
        Ok(ContentItem {
            kind,
            content_type: elem.attributes.get("content-type").cloned(),
            constraints,
            files,
            xml: elem.clone(),
        })
    }

    pub fn content_type(&self) -> &str {
        self.content_type.as_deref().unwrap_or("unknown/unknown")
    }

    /// The item's primary URI (first source of the first file).
    pub fn uri(&self) -> &str {
        self.files[0].first_uri()
    }

    /// Preferred playout duration in seconds, when one is constrained.
    pub fn duration(&self) -> Option<f64> {
        self.constraints.iter().find_map(|c| match c {
            Constraint::PreferredDuration(seconds) => Some(*seconds),
            _ => None,
        })
    }

    /// The playback ratio declared directly on this item, if any.
    pub fn unscaled_ratio(&self) -> Option<f64> {
        unscaled_ratio_of(&self.constraints)
    }

    pub fn to_element(&self) -> &Element {
        &self.xml
    }

    pub fn to_xml_string(&self) -> String {
        element_to_string(&self.xml)
    }

    /// Structural comparison of the underlying XML, ignoring formatting.
    pub fn same_xml(&self, other: &Element) -> bool {
        elements_equal(&self.xml, other)
    }
}

impl PartialEq for ContentItem {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.content_type == other.content_type
            && self.constraints == other.constraints
            && file_identities(&self.files) == file_identities(&other.files)
    }
}

fn file_identities(files: &[RequiresFile]) -> Vec<&str> {
    files.iter().map(|f| f.identity()).collect()
}

/// The playback ratio found in a constraint list, if any.
pub(crate) fn unscaled_ratio_of(constraints: &[Constraint]) -> Option<f64> {
    constraints.iter().find_map(|c| match c {
        Constraint::Playback { ratio, .. } => *ratio,
        _ => None,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub enum CdsNode {
    Set(ContentSet),
    Item(ContentItem),
}

impl CdsNode {
    pub fn constraints(&self) -> &[Constraint] {
        match self {
            CdsNode::Set(set) => &set.constraints,
            CdsNode::Item(item) => &item.constraints,
        }
    }

    pub fn unscaled_ratio(&self) -> Option<f64> {
        unscaled_ratio_of(self.constraints())
    }
}

/// An interior node of the tree.
#[derive(Debug, Clone)]
pub struct ContentSet {
    pub kind: ElementKind,
    pub constraints: Vec<Constraint>,
    pub files: Vec<RequiresFile>,
    pub children: Vec<CdsNode>,
}

impl ContentSet {
    /// Parse a `<content-set>` element and its subtree.
    ///
    /// Children that fail to parse are dropped with a warning rather
    /// than failing the whole tree; an error on the set itself
    /// propagates.
    pub fn parse(elem: &Element) -> Result<ContentSet, CdsError> {
        let kind = ElementKind::from_elem(elem)?;
        let constraints = parse_node_constraints(elem)?;
        let files = parse_requires_files(elem, kind)?;
        if kind == ElementKind::Remote && files.len() != 1 {
            return Err(CdsError::RemoteSetFileCount(files.len()));
        }

        let mut children = Vec::new();
        for child in child_elements(elem) {
            let parsed = match child.name.as_str() {
                "content-set" => ContentSet::parse(child).map(CdsNode::Set),
                "content-item" => ContentItem::parse(child).map(CdsNode::Item),
                _ => continue,
            };
            match parsed {
                Ok(node) => children.push(node),
                Err(e) => warn!("dropping unparsable {} child: {e}", child.name),
            }
        }

        Ok(ContentSet {
            kind,
            constraints,
            files,
            children,
        })
    }

    /// All content items in the subtree, depth first.
    pub fn content_items(&self) -> Vec<&ContentItem> {
        let mut items = Vec::new();
        collect_items(self, &mut items);
        items
    }

    /// Number of content items in the subtree.
    pub fn len(&self) -> usize {
        self.content_items().len()
    }

    /// True when the subtree holds no content items at all.
    pub fn is_empty(&self) -> bool {
        self.content_items().is_empty()
    }

    /// The first content item of the given content type, if any.
    pub fn item_by_content_type(&self, content_type: &str) -> Option<&ContentItem> {
        self.content_items()
            .into_iter()
            .find(|item| item.content_type() == content_type)
    }

    /// Depth-first removal of content items.
    ///
    /// `keep` is called for every item with the item's own constraints
    /// first, followed by its ancestors' constraint lists up to the
    /// root. Items for which it returns `false` are removed from their
    /// parent; sets themselves are never removed, an emptied set simply
    /// carries no items.
    pub fn prune<F>(&mut self, keep: &mut F)
    where
        F: FnMut(&ContentItem, &[&[Constraint]]) -> bool,
    {
        let mut ancestors: Vec<Vec<Constraint>> = Vec::new();
        prune_inner(self, &mut ancestors, keep);
    }
}

impl PartialEq for ContentSet {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.constraints == other.constraints
            && file_identities(&self.files) == file_identities(&other.files)
            && self.children == other.children
    }
}

fn collect_items<'a>(set: &'a ContentSet, out: &mut Vec<&'a ContentItem>) {
    for child in &set.children {
        match child {
            CdsNode::Item(item) => out.push(item),
            CdsNode::Set(inner) => collect_items(inner, out),
        }
    }
}

fn prune_inner<F>(set: &mut ContentSet, ancestors: &mut Vec<Vec<Constraint>>, keep: &mut F)
where
    F: FnMut(&ContentItem, &[&[Constraint]]) -> bool,
{
    ancestors.push(set.constraints.clone());
    set.children.retain_mut(|child| match child {
        CdsNode::Item(item) => {
            let mut chains: Vec<&[Constraint]> = Vec::with_capacity(ancestors.len() + 1);
            chains.push(&item.constraints);
            for ancestor in ancestors.iter().rev() {
                chains.push(ancestor.as_slice());
            }
            keep(item, &chains)
        }
        CdsNode::Set(inner) => {
            prune_inner(inner, ancestors, keep);
            true
        }
    });
    ancestors.pop();
}

fn parse_node_constraints(elem: &Element) -> Result<Vec<Constraint>, CdsError> {
    match elem.get_child("constraints") {
        Some(constraints_elem) => Ok(Constraint::parse_constraints(constraints_elem)?),
        None => Ok(Vec::new()),
    }
}

fn parse_requires_files(elem: &Element, kind: ElementKind) -> Result<Vec<RequiresFile>, CdsError> {
    let mut files = Vec::new();
    for child in child_elements(elem) {
        if child.name == "requires-file" {
            files.push(RequiresFile::parse(child)?);
        }
    }
    if kind == ElementKind::Remote && files.is_empty() {
        return Err(CdsError::MissingRequiresFile);
    }
    Ok(files)
}

/// Parse a subscription update (an element carrying a `uri` attribute
/// and exactly one `<content-set>` child) into the update's URI and its
/// descriptor set. The URI is attached to the root set as its
/// requires-file so the root can be identified by source later on.
pub fn parse_subscription_update(elem: &Element) -> Result<(String, ContentSet), CdsError> {
    let content_set_elem = elem.get_child("content-set").ok_or(CdsError::MissingElement {
        expected: "content-set",
    })?;
    let uri = elem
        .attributes
        .get("uri")
        .cloned()
        .ok_or(CdsError::MissingElement { expected: "@uri" })?;

    let mut root = ContentSet::parse(content_set_elem)?;
    root.files.push(RequiresFile {
        sources: vec![FileSource {
            uri: uri.clone(),
            refresh: None,
        }],
        hashes: Vec::new(),
    });
    Ok((uri, root))
}
