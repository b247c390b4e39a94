//! Persistance SQLite de PMOSignage.
//!
//! Deux magasins distincts partagent les mêmes conventions :
//! [`SubscriptionStore`] conserve les arbres d'abonnement morceau par
//! morceau et sait les réassembler, [`ContextStore`] est un journal en
//! append-only des évènements de contexte (capteurs, touch, pageviews).
//!
//! Chaque opération ouvre sa propre connexion SQLite puis la referme,
//! ce qui autorise l'accès simultané depuis plusieurs threads et
//! plusieurs processus.

pub mod context;
pub mod subscription;

use std::path::PathBuf;

use thiserror::Error;

pub use context::{
    ContextRecord, ContextStore, CONTEXT_TYPES, CONTEXT_TYPE_CONTENT_TRIGGER,
    CONTEXT_TYPE_PAGEVIEW, CONTEXT_TYPE_SENSOR_UPDATE, CONTEXT_TYPE_TOUCH_INPUT,
};
pub use subscription::SubscriptionStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error on {path}: {source}")]
    Database {
        path: PathBuf,
        source: rusqlite::Error,
    },
    #[error("unsupported context type '{0}'")]
    UnsupportedContextType(String),
}
