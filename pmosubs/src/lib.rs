//! # pmosubs
//!
//! The subscription manager: it spawns pull handlers for content
//! feeds, persists every descriptor set they deliver, spawns further
//! handlers for nested remote sets (subject to the scheme nesting
//! policy), and forwards the reassembled full tree to the scheduler.

pub mod handlers;
pub mod manager;

pub use manager::{can_nest, HandlerBinaries, SubscriptionManager};
