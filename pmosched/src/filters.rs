//! The filter pipeline: a chain of `CDS → CDS` passes, each pruning
//! content items depth first on its own copy of the tree.
//!
//! Filter order matters: first the passes that decide whether the
//! display can technically play an item (touch input, content type,
//! cache), then the ones applying declared constraints (tacita
//! triggers, scheduling constraints, priority sweep). An empty result
//! short-circuits the chain.

use chrono::Local;
use tracing::{debug, info, warn};
use xmltree::Element;

use pmocache::{needs_caching, Cache, RendererRegistry};
use pmocds::{constraints_are_met, Condition, Constraint, ContentItem, ContentSet, Priority};
use pmostore::{ContextStore, CONTEXT_TYPE_CONTENT_TRIGGER, CONTEXT_TYPE_TOUCH_INPUT};
use pmoutils::xml::{child_elements, parse_str};

use crate::{TACITA_CONTENT_TRIGGER_THRESHOLD, TOUCH_INPUT_TIME_THRESHOLD};

/// Shared context the filters read: the event log, the cache and the
/// renderer table.
pub struct FilterContext {
    pub context_store: ContextStore,
    pub cache: Cache,
    pub registry: RendererRegistry,
}

/// One pass of the pipeline. Implementations never mutate the input.
pub trait CdsFilter: Send + Sync {
    fn name(&self) -> &'static str;
    fn filter(&self, cds: &ContentSet, ctx: &FilterContext) -> ContentSet;
}

/// Depth-first removal on a copy: items for which `keep` returns false
/// leave the tree, structure stays.
fn depth_first<F>(cds: &ContentSet, mut keep: F) -> ContentSet
where
    F: FnMut(&ContentItem, &[&[Constraint]]) -> bool,
{
    let mut copy = cds.clone();
    copy.prune(&mut keep);
    copy
}

/// Runs all filters on the content descriptor set in order. If at
/// least one filter removes every item, nothing plays.
pub struct FilterPipeline {
    filters: Vec<Box<dyn CdsFilter>>,
}

impl FilterPipeline {
    /// The standard chain. Tacita comes before the priority sweep.
    pub fn standard() -> FilterPipeline {
        FilterPipeline {
            filters: vec![
                Box::new(TouchInputFilter),
                Box::new(ContentTypeFilter),
                Box::new(CacheFilter),
                Box::new(TacitaFilter),
                Box::new(ConstraintsAreMetFilter),
                Box::new(PriorityFilter),
            ],
        }
    }

    pub fn new(filters: Vec<Box<dyn CdsFilter>>) -> FilterPipeline {
        FilterPipeline { filters }
    }

    pub fn filter_cds(&self, cds: &ContentSet, ctx: &FilterContext) -> ContentSet {
        let mut filtered = cds.clone();
        for filter in &self.filters {
            debug!(
                "starting filter {} with {} items",
                filter.name(),
                filtered.len()
            );
            filtered = filter.filter(&filtered, ctx);
            if filtered.is_empty() {
                break;
            }
        }
        filtered
    }
}

/// Pass-through, useful as a placeholder in custom chains.
pub struct NullFilter;

impl CdsFilter for NullFilter {
    fn name(&self) -> &'static str {
        "NullFilter"
    }

    fn filter(&self, cds: &ContentSet, _ctx: &FilterContext) -> ContentSet {
        cds.clone()
    }
}

/// Keeps only the item a recent touch selection asked for. Without a
/// recent touch input, or when the touched item is not part of the
/// schedule at all, the set passes through unchanged.
pub struct TouchInputFilter;

impl TouchInputFilter {
    /// The content-item element of the most recent touch input, when
    /// it is still within the threshold.
    fn touched_element(ctx: &FilterContext) -> Option<Element> {
        let records = ctx
            .context_store
            .latest_by_type(CONTEXT_TYPE_TOUCH_INPUT, 1)
            .unwrap_or_default();
        let record = records.first()?;

        let cutoff = Local::now().naive_local()
            - chrono::Duration::from_std(TOUCH_INPUT_TIME_THRESHOLD).unwrap_or_default();
        if record.created_localtime < cutoff {
            return None;
        }

        let elem = parse_str(record.content_item_xml.as_deref()?).ok()?;
        if elem.name == "content-item" {
            return Some(elem);
        }
        if elem.name == "content-set" {
            return child_elements(&elem)
                .find(|child| child.name == "content-item")
                .cloned();
        }
        None
    }
}

impl CdsFilter for TouchInputFilter {
    fn name(&self) -> &'static str {
        "TouchInputFilter"
    }

    fn filter(&self, cds: &ContentSet, ctx: &FilterContext) -> ContentSet {
        let Some(touched) = Self::touched_element(ctx) else {
            return cds.clone();
        };
        debug!("touch input found in context store");

        let filtered = depth_first(cds, |item, _| item.same_xml(&touched));
        if filtered.is_empty() {
            info!("touch input not part of original set, ignoring it");
            return cds.clone();
        }
        filtered
    }
}

/// Drops items of content types no renderer can play.
pub struct ContentTypeFilter;

impl CdsFilter for ContentTypeFilter {
    fn name(&self) -> &'static str {
        "ContentTypeFilter"
    }

    fn filter(&self, cds: &ContentSet, ctx: &FilterContext) -> ContentSet {
        depth_first(cds, |item, _| {
            let known = ctx.registry.lookup(item.content_type()).is_some();
            if !known {
                debug!("unrecognised mime type for {}", item.uri());
            }
            known
        })
    }
}

/// Drops items that need caching but are not on disk yet. Presence
/// only, no hash check: this runs on every scheduling round.
pub struct CacheFilter;

impl CdsFilter for CacheFilter {
    fn name(&self) -> &'static str {
        "CacheFilter"
    }

    fn filter(&self, cds: &ContentSet, ctx: &FilterContext) -> ContentSet {
        depth_first(cds, |item, _| {
            if needs_caching(&ctx.registry, item) {
                ctx.cache.file_cached(item, false).is_some()
            } else {
                true
            }
        })
    }
}

/// Boosts personalised content: when a recent content trigger names
/// some source URIs, only items under those URIs stay. Without a
/// recent trigger, or when nothing matches, the set passes through.
pub struct TacitaFilter;

impl TacitaFilter {
    fn requested_uris(ctx: &FilterContext) -> Vec<String> {
        let records = ctx
            .context_store
            .latest_by_type(CONTEXT_TYPE_CONTENT_TRIGGER, 1)
            .unwrap_or_default();
        let Some(record) = records.first() else {
            return Vec::new();
        };

        let cutoff = Local::now().naive_local()
            - chrono::Duration::from_std(TACITA_CONTENT_TRIGGER_THRESHOLD).unwrap_or_default();
        if record.created_localtime < cutoff {
            return Vec::new();
        }
        let Some(xml) = record.content_item_xml.as_deref() else {
            return Vec::new();
        };
        let Ok(elem) = parse_str(xml) else {
            return Vec::new();
        };

        let mut uris = Vec::new();
        match elem.name.as_str() {
            "content-item" => {
                if let Ok(item) = ContentItem::parse(&elem) {
                    uris.extend(item.files.iter().map(|f| f.first_uri().to_string()));
                }
            }
            "content-set" => {
                if let Ok(set) = ContentSet::parse(&elem) {
                    for item in set.content_items() {
                        uris.extend(item.files.iter().map(|f| f.first_uri().to_string()));
                    }
                }
            }
            other => warn!("unexpected content trigger element '{other}'"),
        }
        uris
    }
}

impl CdsFilter for TacitaFilter {
    fn name(&self) -> &'static str {
        "TacitaFilter"
    }

    fn filter(&self, cds: &ContentSet, ctx: &FilterContext) -> ContentSet {
        let requested = Self::requested_uris(ctx);
        if requested.is_empty() {
            return cds.clone();
        }
        debug!("content trigger requests {requested:?}");

        let filtered = depth_first(cds, |item, _| {
            requested.iter().any(|uri| item.uri().starts_with(uri))
        });
        if filtered.is_empty() {
            info!("triggered content not part of original set, ignoring it");
            return cds.clone();
        }
        filtered
    }
}

/// Drops items whose scheduling constraints (own plus inherited) do
/// not hold right now. Constraints nobody can evaluate are ignored.
pub struct ConstraintsAreMetFilter;

impl CdsFilter for ConstraintsAreMetFilter {
    fn name(&self) -> &'static str {
        "ConstraintsAreMetFilter"
    }

    fn filter(&self, cds: &ContentSet, _ctx: &FilterContext) -> ContentSet {
        depth_first(cds, |_, chains| constraints_are_met(chains, None, true))
    }
}

/// Sweeps priority levels from highest to lowest and keeps the first
/// non-empty level. Items without a priority constraint only match the
/// default (medium) level.
pub struct PriorityFilter;

impl CdsFilter for PriorityFilter {
    fn name(&self) -> &'static str {
        "PriorityFilter"
    }

    fn filter(&self, cds: &ContentSet, _ctx: &FilterContext) -> ContentSet {
        for level in Priority::ALL.iter().rev() {
            let condition = Condition::Priority(*level);
            let filtered = depth_first(cds, |_, chains| {
                constraints_are_met(chains, Some(&condition), true)
            });
            let count = filtered.len();
            if count > 0 {
                debug!("stopping at priority level {} with {count} items", level.as_str());
                return filtered;
            }
        }
        cds.clone()
    }
}

/// Probes non-cacheable (web) items and drops the unreachable ones.
/// Not part of the standard chain; useful where web content dominates
/// the schedule.
pub struct WebContentStatusFilter;

impl CdsFilter for WebContentStatusFilter {
    fn name(&self) -> &'static str {
        "WebContentStatusFilter"
    }

    fn filter(&self, cds: &ContentSet, ctx: &FilterContext) -> ContentSet {
        depth_first(cds, |item, _| {
            // Cached content is the cache manager's concern.
            if needs_caching(&ctx.registry, item) {
                return true;
            }
            let uri = item.uri();
            if !uri.starts_with("http") {
                return true;
            }
            // Some servers 403 unless a browser identifies itself.
            let result = ureq::get(uri)
                .header("User-Agent", "Mozilla/5.0")
                .call();
            match result {
                Ok(response) => {
                    let status = response.status().as_u16();
                    (200..400).contains(&status)
                }
                Err(e) => {
                    info!("content item does not exist: {uri} ({e})");
                    false
                }
            }
        })
    }
}
