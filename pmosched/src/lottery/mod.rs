//! The lottery scheduler.
//!
//! Every scheduling round, each configured allocator distributes a
//! block of tickets over the filtered content items according to its
//! own strategy; all allocators run in parallel and their tickets are
//! pooled. One ticket (or k) is then drawn uniformly at random, and
//! the item on it plays.

mod allocators;
mod ratio;
mod recency;

use std::sync::Arc;

use rand::Rng;
use tracing::debug;

use pmocds::{ContentItem, ContentSet};
use pmostore::ContextStore;

pub use allocators::{DurationBasedAllocator, EqualDistributionAllocator, RandomAllocator};
pub use ratio::{scaled_ratios, RatioAllocator};
pub use recency::RecencyBasedAllocator;

/// Tickets handed to each allocator per round.
pub const DEFAULT_TICKET_COUNT: usize = 1000;

/// A ticket with an item assigned to it. Items are indices into the
/// round's flattened item list.
#[derive(Debug, Clone, Copy)]
pub struct LotteryTicket {
    pub item_index: usize,
    pub allocated_by: &'static str,
}

/// A strategy distributing tickets over content items.
///
/// Returns one entry per assigned ticket; an allocator may assign
/// fewer tickets than offered but never more.
pub trait TicketAllocator: Send + Sync {
    fn name(&self) -> &'static str;
    fn allocate(
        &self,
        cds: &ContentSet,
        context_store: &ContextStore,
        ticket_count: usize,
    ) -> Vec<usize>;
}

/// Runs the allocators and draws the winners.
pub struct LotteryScheduler {
    allocators: Vec<Arc<dyn TicketAllocator>>,
    ticket_count: usize,
}

impl LotteryScheduler {
    /// The default configuration: the ratio allocator alone.
    pub fn standard() -> LotteryScheduler {
        LotteryScheduler::new(
            vec![Arc::new(RatioAllocator) as Arc<dyn TicketAllocator>],
            DEFAULT_TICKET_COUNT,
        )
    }

    /// At least one allocator must be present.
    pub fn new(
        allocators: Vec<Arc<dyn TicketAllocator>>,
        ticket_count: usize,
    ) -> LotteryScheduler {
        assert!(!allocators.is_empty(), "a lottery needs at least one allocator");
        LotteryScheduler {
            allocators,
            ticket_count,
        }
    }

    /// Draw `count` items from the filtered set. Returns fewer (or
    /// none) when the set is empty or no allocator assigned anything.
    pub fn get_items_to_schedule(
        &self,
        cds: &ContentSet,
        context_store: &ContextStore,
        count: usize,
    ) -> Vec<ContentItem> {
        let items: Vec<&ContentItem> = cds.content_items();
        if items.is_empty() {
            return Vec::new();
        }

        let pool = self.ticket_pool(cds, context_store);
        if pool.is_empty() {
            return Vec::new();
        }

        let mut rng = rand::rng();
        (0..count)
            .map(|_| {
                let winner = pool[rng.random_range(0..pool.len())];
                debug!(
                    "winning ticket for {} allocated by {}",
                    items[winner.item_index].uri(),
                    winner.allocated_by
                );
                items[winner.item_index].clone()
            })
            .collect()
    }

    /// Run every allocator on its own thread and pool the tickets.
    fn ticket_pool(&self, cds: &ContentSet, context_store: &ContextStore) -> Vec<LotteryTicket> {
        std::thread::scope(|scope| {
            let handles: Vec<_> = self
                .allocators
                .iter()
                .map(|allocator| {
                    let allocator = Arc::clone(allocator);
                    let ticket_count = self.ticket_count;
                    scope.spawn(move || {
                        let name = allocator.name();
                        debug!("starting ticket allocator {name}");
                        allocator
                            .allocate(cds, context_store, ticket_count)
                            .into_iter()
                            .map(|item_index| LotteryTicket {
                                item_index,
                                allocated_by: name,
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|handle| handle.join().unwrap_or_default())
                .collect()
        })
    }
}
