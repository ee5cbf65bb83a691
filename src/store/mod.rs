//! File-backed and in-memory stores, one per entity kind.
//!
//! Every durable store here takes the same shape: a small struct wrapping a
//! `std::sync::Mutex`-guarded path (or set of paths), loading and rewriting
//! plain `|`-delimited text on every call. [`session::SessionRegistry`] is
//! the one exception — it is pure in-memory state behind a `tokio::sync::Mutex`
//! because it must be awaited from async worker tasks.

pub mod account;
pub mod fileutil;
pub mod friendship;
pub mod gm;
pub mod group;
pub mod msgid;
pub mod pm;
pub mod session;
