//! The simpler ticket allocators: random, equal distribution and
//! duration based.

use rand::seq::SliceRandom;
use rand::Rng;
use tracing::debug;

use pmocds::{ContentSet, ContentItem};
use pmostore::ContextStore;

use crate::DEFAULT_CONTENT_DURATION;

use super::TicketAllocator;

pub(super) fn duration_of(item: &ContentItem) -> f64 {
    item.duration().unwrap_or(DEFAULT_CONTENT_DURATION)
}

/// Randomly distribute available tickets to content items. Makes no
/// guarantee that every item gets tickets.
pub struct RandomAllocator;

impl TicketAllocator for RandomAllocator {
    fn name(&self) -> &'static str {
        "RandomAllocator"
    }

    fn allocate(&self, cds: &ContentSet, _store: &ContextStore, ticket_count: usize) -> Vec<usize> {
        let item_count = cds.content_items().len();
        if item_count == 0 {
            return Vec::new();
        }
        let mut rng = rand::rng();
        (0..ticket_count)
            .map(|_| rng.random_range(0..item_count))
            .collect()
    }
}

/// Give every item the same number of tickets, round-robin over a
/// shuffled order so the remainder does not always land on the same
/// items.
pub struct EqualDistributionAllocator;

impl TicketAllocator for EqualDistributionAllocator {
    fn name(&self) -> &'static str {
        "EqualDistributionAllocator"
    }

    fn allocate(&self, cds: &ContentSet, _store: &ContextStore, ticket_count: usize) -> Vec<usize> {
        let item_count = cds.content_items().len();
        if item_count == 0 {
            return Vec::new();
        }
        let mut order: Vec<usize> = (0..item_count).collect();
        order.shuffle(&mut rand::rng());

        (0..ticket_count)
            .map(|ticket| order[ticket % item_count])
            .collect()
    }
}

/// Weight items by their playout duration so long items are not
/// starved of screen time.
pub struct DurationBasedAllocator {
    favour_long_items: bool,
}

impl DurationBasedAllocator {
    pub fn new() -> DurationBasedAllocator {
        DurationBasedAllocator {
            favour_long_items: true,
        }
    }

    pub fn favouring_short_items() -> DurationBasedAllocator {
        DurationBasedAllocator {
            favour_long_items: false,
        }
    }
}

impl Default for DurationBasedAllocator {
    fn default() -> Self {
        DurationBasedAllocator::new()
    }
}

impl TicketAllocator for DurationBasedAllocator {
    fn name(&self) -> &'static str {
        "DurationBasedAllocator"
    }

    fn allocate(&self, cds: &ContentSet, _store: &ContextStore, ticket_count: usize) -> Vec<usize> {
        let items = cds.content_items();
        if items.is_empty() {
            return Vec::new();
        }

        // Sort so the items we favour come first.
        let mut pairs: Vec<(usize, f64)> = items
            .iter()
            .enumerate()
            .map(|(index, item)| (index, duration_of(item)))
            .collect();
        pairs.sort_by(|a, b| a.1.total_cmp(&b.1));
        if self.favour_long_items {
            pairs.reverse();
        }

        let mut tickets = Vec::with_capacity(ticket_count);
        let mut left = ticket_count;

        // Ensure (if possible) that every item gets at least one
        // ticket.
        for (index, duration) in &pairs {
            if left == 0 {
                break;
            }
            debug!("item {index} with duration {duration}s gets its guaranteed ticket");
            tickets.push(*index);
            left -= 1;
        }
        if left == 0 {
            return tickets;
        }

        let total_duration: f64 = pairs.iter().map(|(_, duration)| duration).sum();
        let tickets_per_second = left as f64 / total_duration;

        let last = pairs.len() - 1;
        for (position, (index, duration)) in pairs.iter().enumerate() {
            // Rounding errors sweep into the last item: it takes
            // whatever is left.
            let want = if position == last {
                left
            } else {
                ((tickets_per_second * duration).round() as usize).min(left)
            };
            for _ in 0..want {
                tickets.push(*index);
            }
            left -= want;
            if left == 0 {
                break;
            }
        }
        tickets
    }
}
