//! # pmosched
//!
//! The scheduling side of PMOSignage: deciding, at every instant,
//! which piece of content plays.
//!
//! Incoming descriptor-set and sensor updates arrive through the
//! context & constraints parser, the filter pipeline prunes the tree
//! down to what may play right now, the lottery scheduler draws one
//! item from weighted ticket allocations, and the scheduling manager
//! orchestrates the loop: duration timers, display keep-alives,
//! pageview reporting and the touch overlays.

pub mod context_parser;
pub mod filters;
pub mod lottery;
pub mod manager;

use std::time::Duration;

pub use context_parser::ContextConstraintsParser;
pub use filters::{CdsFilter, FilterContext, FilterPipeline};
pub use lottery::{LotteryScheduler, TicketAllocator};
pub use manager::{SchedulingManager, TriggerCell};

/// Played when an item carries no preferred duration.
pub const DEFAULT_CONTENT_DURATION: f64 = 15.0;
/// The display keep-alive extends this far beyond the item duration.
pub const DISPLAY_ADDITIONAL_KEEP_ALIVE: Duration = Duration::from_secs(20);

/// Window in which a stored touch input still drives selection.
pub const TOUCH_INPUT_TIME_THRESHOLD: Duration = Duration::from_secs(5);
/// Window in which a stored content trigger still boosts content.
pub const TACITA_CONTENT_TRIGGER_THRESHOLD: Duration = Duration::from_secs(30);

pub const TOUCH_INPUT_CONTENT_TYPE_BUTTON: &str = "text/html; touch_button";
pub const TOUCH_INPUT_CONTENT_TYPE_APP_SELECTION: &str = "text/html; touch_app_selection";
pub const TOUCH_INPUT_LAYOUT_MARGIN: u32 = 20;
pub const TOUCH_INPUT_APP_SELECTION_TIMEOUT: Duration = Duration::from_secs(10);
pub const TOUCH_INPUT_APP_SELECTION_POSITION: &str = "touch_interaction_app_selection";
pub const TOUCH_INPUT_BUTTON_POSITION: &str = "touch_interaction_button";
