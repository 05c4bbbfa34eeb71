pub mod checkpoint;
pub mod delta;
pub mod edit_set;
pub mod store;

#[cfg(test)]
mod tests;

pub use checkpoint::{Checkpoint, ObjectSnapshot};
pub use delta::{DeltaBook, DeltaChange, FieldDelta, ObjectDelta};
pub use edit_set::{EditSet, EditedObject};
pub use store::{DeleteLockManager, MemoryObjectStore, ObjectStatus, ObjectStore, SessionDeleteLocks};
