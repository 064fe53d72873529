//! C1: durable module records plus a cascade-resolving shared cache.

pub mod cache;
pub mod config;
pub mod durable;
pub mod store;

pub use config::StoreConfig;
pub use store::{ModuleRecord, ModuleStore};
