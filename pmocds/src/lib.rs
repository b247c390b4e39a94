//! # pmocds
//!
//! Content descriptor set model for PMOSignage.
//!
//! A content descriptor set (CDS) is a tree: interior nodes are content
//! sets, leaves are playable content items. Every node carries a possibly
//! empty list of scheduling constraints and, when remote, the file
//! (sources + hashes) it was fetched from. This crate owns the XML
//! parsing, the constraint semantics and the tree operations the filter
//! pipeline and schedulers rely on.

pub mod constraint;
pub mod model;

pub use constraint::{
    constraints_are_met, Condition, Constraint, ConstraintError, ConstraintVerdict,
    PlaybackOrder, Priority,
};
pub use model::{
    parse_subscription_update, CdsError, CdsNode, ContentItem, ContentSet, ElementKind,
    FileHash, FileSource, HashAlgorithm, RequiresFile,
};
