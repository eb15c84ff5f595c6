//! Backing store boundary for Tessera
//!
//! This crate defines the transactional blob store contract every higher
//! layer is written against:
//! - ReadTx / WriteTx: scoped transaction handles over string keys and byte values
//! - Store: `view` and `update` entry points that run a closure in a transaction
//! - MemoryStore: BTreeMap-backed implementation with a single serialized writer
//!
//! On-disk or SQL-backed stores implement the same three traits.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod memory;
pub mod traits;

pub use memory::MemoryStore;
pub use traits::{ReadTx, Store, WriteTx};
