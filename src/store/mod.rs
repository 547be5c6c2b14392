//! Durable job state: entities, SQLite persistence, async facade.

pub mod db;
pub mod models;

pub use db::{JobMeta, Store, StoreHandle};
pub use models::*;
