//! Primitives layer for Tessera
//!
//! Typed data access built on the storage boundary:
//! - **Table**: namespaced CRUD over records with set/delete hooks
//! - **Singleton**: one well-known value per namespace
//! - **SecondaryIndex** / **UniqueIndex**: hashed lookup keys maintained by hooks
//! - **ManyToOne**: child-to-parent relation with optional cascade delete
//! - **CacheStore**: TTL cache in front of a table, expired by **CacheGc**
//! - **IdAllocator**: block-reserving record id generator
//!
//! ## Transactions
//!
//! Every operation takes the caller's transaction. Hooks write through the
//! same transaction, so a record, its index entries and anything a hook
//! records alongside commit or abort together:
//!
//! ```rust,ignore
//! store.update(|tx| {
//!     let user = users.insert(tx, user)?;
//!     posts.insert(tx, Post { id: ids.generate_id()?, author: user.id, ..post })?;
//!     Ok(())
//! })?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod gc;
pub mod id;
pub mod index;
pub mod many_to_one;
pub mod singleton;
pub mod table;
pub mod unique_index;

pub use cache::{CacheAccessor, CacheOptions, CacheStats, CacheStore};
pub use gc::{CacheGc, Collectable};
pub use id::{IdAllocator, IdCounter, IdGenerator};
pub use index::{
    hash_key, IndexKey, SecondaryIndex, SecondaryIndexOptions, MAX_SALT_LEN,
};
pub use many_to_one::{ManyToOne, ManyToOneOptions};
pub use singleton::Singleton;
pub use table::{DeleteHook, SetHook, Table, WeakTable};
pub use unique_index::{ConflictResolver, UniqueIndex, UniqueIndexOptions};
