//! Utilitaires partagés par l'ensemble du workspace PMOSignage :
//! conversions d'unités, manipulation XML et conversions chemin/URI.

pub mod conversions;
pub mod paths;
pub mod xml;

pub use conversions::{
    time_interval_in_seconds, unit_of_information_in_bytes, ConversionError,
};
pub use paths::{local_path_from_uri, uri_from_local_path};
