//! Helpers for peer adapters: change detection and resumption state.

mod hashtable;
mod state;

pub use hashtable::HashTable;
pub use state::SinkStateDb;
