//! Optimistic software transactional memory with epoch-bounded group-commit
//! durability.
//!
//! Worker threads execute transactions against shared objects implementing
//! the [`Transactable`] contract. Reads are validated and writes installed at
//! commit time under two-phase locking over per-object version words. When a
//! durability log is configured, committed writes are appended to per-worker
//! log buffers, batched to disk by writer threads, and acknowledged once the
//! system-wide durable epoch has caught up with the transaction's epoch.

#![forbid(unsafe_code)]
#![warn(
    clippy::cargo,
    missing_docs,
    clippy::nursery,
    clippy::pedantic,
    future_incompatible,
    rust_2018_idioms,
)]
#![cfg_attr(doc, deny(rustdoc::all))]
#![allow(
    clippy::missing_errors_doc, // TODO clippy::missing_errors_doc
    clippy::option_if_let_else,
    clippy::module_name_repetitions,
)]

mod cell;
mod epoch;
mod error;
pub mod log;
mod mvcc;
mod object;
mod reclaim;
mod runtime;
pub mod transaction;
pub mod tree;
mod version;

#[cfg(test)]
mod test_util;

pub use self::{
    cell::TCell,
    error::{Error, ErrorKind, InternalError},
    log::LogConfig,
    mvcc::{MvObject, MvRegistry},
    object::{LogWrite, Loggable, ObjectId, Transactable},
    runtime::{Options, Runtime, Worker},
    transaction::{Abort, Transaction, TxResult},
    tree::TxRbTree,
    version::{TVersion, Tid},
};
