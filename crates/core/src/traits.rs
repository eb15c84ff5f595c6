//! Traits implemented by persisted values
//!
//! Storage is generic over record kinds: a table is parameterized by a type
//! implementing [`Record`], and its namespace is fixed when the table is
//! constructed. Nothing is resolved through reflection.

use crate::version_vector::VersionVector;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// A value that can be persisted by a table or singleton
///
/// Implemented automatically for every serde-serializable value type.
/// `Default` supplies the zero value handed to `transform_or_default` and
/// `PartialEq` lets writes that change nothing skip hooks and the store.
pub trait Stored:
    Serialize + DeserializeOwned + Clone + Default + PartialEq + Send + Sync + 'static
{
}

impl<T> Stored for T where
    T: Serialize + DeserializeOwned + Clone + Default + PartialEq + Send + Sync + 'static
{
}

/// A table record with a stable, externally assigned id
pub trait Record: Stored {
    /// Unique id of the record within its table
    fn id(&self) -> u64;
}

/// A value that carries a version vector and can be replicated
pub trait Replicated: Stored {
    /// Version vector of the value
    fn version(&self) -> &VersionVector;

    /// Mutable access to the version vector
    fn version_mut(&mut self) -> &mut VersionVector;
}
