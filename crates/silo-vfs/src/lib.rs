//! Volume I/O abstraction and the lock adapter.
//!
//! The appliance's underlying filesystem offers no cooperative locking, no
//! offset-addressed I/O, and no notion of shared handles. This crate bridges
//! that gap for the relational engine:
//!
//! - [`Volume`]/[`VolumeFile`] define the narrow cursor-based contract the
//!   backing filesystem must provide.
//! - [`MemoryVolume`] is an in-memory backend for tests; [`DiskVolume`] maps
//!   the contract onto `std::fs`.
//! - [`LockAdapter`] layers the engine-facing file interface on top: a
//!   path-keyed registry of reference-counted handles, the five-level lock
//!   ladder, atomic seek+transfer, zero-filled short reads, and zero-extended
//!   sparse writes.

mod adapter;
mod disk;
mod memory;
mod traits;

pub use adapter::{AdapterFile, ControlReply, LockAdapter, IOCAP_UNDELETABLE_WHEN_OPEN};
pub use disk::DiskVolume;
pub use memory::MemoryVolume;
pub use traits::{FileAttributes, Volume, VolumeFile};
