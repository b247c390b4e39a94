//! # pmodisplay
//!
//! Everything between the scheduler and the glass: the display manager
//! supervising renderer subprocesses and their per-position visibility
//! transitions, the display controller keeping the panel powered while
//! content plays, and the client the scheduler uses to talk to it.

pub mod client;
pub mod controller;
pub mod display;

use std::time::Duration;

use thiserror::Error;

pub use client::DisplayClient;
pub use controller::{DisplayController, DisplayDevice, LoggingDisplayDevice};
pub use display::{DisplayManager, Layout, ScheduleTrigger, DEFAULT_POSITION};

/// Time a renderer's fade-in animation takes; the previous renderer at
/// the same position stays up until it has elapsed.
pub const FADING_ANIMATION_DURATION: Duration = Duration::from_millis(2500);

#[derive(Debug, Error)]
pub enum RendererError {
    #[error("no renderer is configured for content type '{0}'")]
    UnsupportedContentType(String),
    #[error("item '{0}' must be cached before it can be rendered")]
    NotCached(String),
    #[error("failed to spawn renderer: {0}")]
    Spawn(#[from] pmoproc::ManagerError),
}
