//! Ratio-based ticket allocation.
//!
//! Each item's share of the schedule follows from the playback ratios
//! declared in the tree: siblings without a ratio share what their
//! siblings left unclaimed, shares are normalised to sum to one at
//! every level, and a node's final ratio is its sibling share times
//! its parent's final ratio.

use rand::seq::SliceRandom;
use tracing::debug;

use pmocds::{CdsNode, ContentSet};
use pmostore::ContextStore;

use super::allocators::duration_of;
use super::TicketAllocator;

/// Final (scaled) ratio of every content item in the tree, in the
/// same order as `ContentSet::content_items`.
pub fn scaled_ratios(cds: &ContentSet) -> Vec<f64> {
    let mut out = Vec::new();
    walk(cds, 1.0, &mut out);
    out
}

fn walk(set: &ContentSet, parent_ratio: f64, out: &mut Vec<f64>) {
    let children = &set.children;
    if children.is_empty() {
        return;
    }

    let unscaled: Vec<Option<f64>> = children.iter().map(CdsNode::unscaled_ratio).collect();
    let specified_sum: f64 = unscaled.iter().flatten().sum();
    let specified_count = unscaled.iter().flatten().count();
    let unspecified_count = unscaled.len() - specified_count;

    // Unclaimed share for unspecified siblings; when the declared
    // ratios already claim everything, fall back to their mean.
    let default_ratio = if unspecified_count > 0 {
        if specified_sum < 1.0 {
            (1.0 - specified_sum) / unspecified_count as f64
        } else {
            specified_sum / specified_count as f64
        }
    } else {
        0.0
    };

    let total = specified_sum + default_ratio * unspecified_count as f64;
    let scale = if total > 0.0 { 1.0 / total } else { 0.0 };

    for (child, ratio) in children.iter().zip(unscaled) {
        let share = ratio.unwrap_or(default_ratio) * scale;
        let final_ratio = share * parent_ratio;
        match child {
            CdsNode::Item(_) => out.push(final_ratio),
            CdsNode::Set(inner) => walk(inner, final_ratio, out),
        }
    }
}

/// Allocate tickets proportionally to each item's scaled ratio,
/// corrected for the item's duration so a long item's share of *time*
/// (not of plays) follows its ratio.
pub struct RatioAllocator;

impl TicketAllocator for RatioAllocator {
    fn name(&self) -> &'static str {
        "RatioAllocator"
    }

    fn allocate(&self, cds: &ContentSet, _store: &ContextStore, ticket_count: usize) -> Vec<usize> {
        let items = cds.content_items();
        if items.is_empty() {
            return Vec::new();
        }

        let ratios = scaled_ratios(cds);
        let durations: Vec<f64> = items.iter().map(|item| duration_of(item)).collect();
        let total_duration: f64 = durations.iter().sum();

        // Turn the time share into a play share, then renormalise.
        let mut revised: Vec<f64> = ratios
            .iter()
            .zip(&durations)
            .map(|(ratio, duration)| ratio * total_duration / duration)
            .collect();
        let revised_sum: f64 = revised.iter().sum();
        if revised_sum > 0.0 {
            for ratio in &mut revised {
                *ratio /= revised_sum;
            }
        }

        // Randomly order the items so rounding leftovers don't always
        // favour the same one.
        let mut order: Vec<usize> = (0..items.len()).collect();
        order.shuffle(&mut rand::rng());

        let mut tickets = Vec::with_capacity(ticket_count);
        let mut left = ticket_count;
        let last = order.len() - 1;
        for (position, &index) in order.iter().enumerate() {
            if left == 0 {
                debug!("no more tickets to allocate");
                break;
            }
            let want = if position == last {
                // The last item takes whatever is left.
                left
            } else {
                ((ticket_count as f64 * revised[index]).round() as usize)
                    .max(1)
                    .min(left)
            };
            debug!(
                "item {} with ratio {:.4} has been allocated {want}/{ticket_count} tickets",
                items[index].uri(),
                revised[index]
            );
            for _ in 0..want {
                tickets.push(index);
            }
            left -= want;
        }
        tickets
    }
}
