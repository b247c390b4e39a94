//! Recency-based ticket allocation: the longer an item has gone
//! unplayed, the more tickets it gets.

use std::time::Duration;

use chrono::Utc;
use tracing::debug;
use xmltree::Element;

use pmocds::ContentSet;
use pmostore::{ContextStore, CONTEXT_TYPE_PAGEVIEW};
use pmoutils::xml::parse_str;

use super::TicketAllocator;

/// Pageviews older than this no longer count.
const RECENCY_WINDOW: Duration = Duration::from_secs(2 * 60 * 60);
/// Upper bound on the pageview records consulted per round.
const RECENCY_RECORD_LIMIT: usize = 1000;

/// Walk the items from least recently played to most recently played,
/// handing ⌈remaining/2⌉+1 tickets at each step, circling round until
/// the tickets run out. Items with no pageview at all go first.
pub struct RecencyBasedAllocator;

impl TicketAllocator for RecencyBasedAllocator {
    fn name(&self) -> &'static str {
        "RecencyBasedAllocator"
    }

    fn allocate(&self, cds: &ContentSet, store: &ContextStore, ticket_count: usize) -> Vec<usize> {
        let items = cds.content_items();
        if items.is_empty() {
            return Vec::new();
        }

        // Most recent first; only records inside the window count.
        let cutoff = Utc::now().naive_utc()
            - chrono::Duration::from_std(RECENCY_WINDOW).unwrap_or_default();
        let records = store
            .latest_by_type(CONTEXT_TYPE_PAGEVIEW, RECENCY_RECORD_LIMIT)
            .unwrap_or_default();
        let played: Vec<Element> = records
            .into_iter()
            .filter(|record| record.created_utc > cutoff)
            .filter_map(|record| record.content_item_xml)
            .filter_map(|xml| parse_str(&xml).ok())
            .collect();

        // Recency rank per item: position of its most recent pageview
        // (0 = just played), None = never played.
        let ranks: Vec<Option<usize>> = items
            .iter()
            .map(|item| played.iter().position(|elem| item.same_xml(elem)))
            .collect();

        // Never-played first, then oldest-played to newest-played.
        let mut order: Vec<usize> = (0..items.len()).collect();
        order.sort_by_key(|&index| match ranks[index] {
            None => (0, 0isize),
            Some(rank) => (1, -(rank as isize)),
        });

        let mut tickets = Vec::with_capacity(ticket_count);
        let mut left = ticket_count;
        let mut pointer = 0;
        while left > 0 {
            let want = (left.div_ceil(2) + 1).min(left);
            debug!(
                "{want} tickets for {}",
                items[order[pointer]].uri()
            );
            for _ in 0..want {
                tickets.push(order[pointer]);
            }
            left -= want;
            pointer = (pointer + 1) % order.len();
        }
        tickets
    }
}
