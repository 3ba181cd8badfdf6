//! Durable, crash-safe storage shared by every foreman process.
//!
//! A [`Ledger`] is a directory holding one snapshot document with every
//! entity collection and an append-only event log. Writers serialize through
//! an in-process mutex plus an exclusive OS lock on a lock file, so
//! independent processes never interleave read-modify-write cycles. The
//! snapshot is replaced atomically (temp file, fsync, rename) and records how
//! many log bytes are committed, which lets readers run without any lock.
//!
//! # Main types
//!
//! - [`Ledger`]: The store handle: [`Ledger::transact`] and lock-free reads.
//! - [`Txn`]: Mutable view handed to a transaction closure.
//! - [`EventRecord`] / [`NewEvent`]: Committed and pending log entries.

/// Atomic file replacement helpers.
pub mod atomic;
/// Event log records.
pub mod event;
/// The ledger itself.
pub mod ledger;

pub use atomic::write_atomic;
pub use event::{EventRecord, NewEvent};
pub use ledger::{Ledger, Snapshot, Txn, View};
