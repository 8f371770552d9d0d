//! Thread persistence: entities, SQLite store, and the async handle the
//! rest of the service goes through.

pub mod db;
pub mod models;

pub use db::{DbHandle, Store};
pub use models::*;
