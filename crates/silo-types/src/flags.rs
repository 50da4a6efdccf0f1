//! Flag sets used across the volume and adapter boundary.

use bitflags::bitflags;

bitflags! {
    /// Flags for opening a file through the lock adapter.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: u32 {
        /// Open for reading.
        const READ_ONLY = 0x0000_0001;
        /// Open for reading and writing.
        const READ_WRITE = 0x0000_0002;
        /// Create the file if it does not exist.
        const CREATE = 0x0000_0004;
        /// Fail if the file already exists. Only meaningful with `CREATE`.
        const EXCLUSIVE = 0x0000_0010;
        /// Delete the file when the last handle closes.
        const DELETE_ON_CLOSE = 0x0000_0008;
        /// Main store file. Writes require an Exclusive lock.
        const MAIN_STORE = 0x0000_0100;
        /// Rollback or WAL journal file. Pre-locked to the opening thread.
        const JOURNAL = 0x0000_0800;
        /// Scratch file. Pre-locked to the opening thread; a null path
        /// requests an adapter-generated unique name.
        const TEMP = 0x0000_1000;
    }
}

bitflags! {
    /// What an existence/permission probe should check.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessCheck: u32 {
        /// Does the file exist at all.
        const EXISTS = 0x01;
        /// Can the file be opened read-write.
        const READ_WRITE = 0x02;
    }
}

bitflags! {
    /// Durability flags for sync requests.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SyncFlags: u32 {
        /// Normal barrier: data reaches the volume.
        const NORMAL = 0x02;
        /// Full barrier: data and metadata reach stable media.
        const FULL = 0x03;
        /// Only the data needs to be durable, not the file size.
        const DATA_ONLY = 0x10;
    }
}

/// Extension operations routed through `file_control`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileControl {
    /// Query the handle's current lock level. Answered in-place.
    LockState,
    /// Advise the final size of the file so the volume can preallocate.
    /// Hints smaller than the preallocation threshold are ignored.
    SizeHint(u64),
    /// Drop any volume-level caches for this file.
    ResetCache,
    /// Query whether the file was moved or deleted underneath the handle.
    HasMoved,
}

/// Size hints below this gap over the current size are not worth a
/// preallocation call.
pub const PREALLOCATE_MINIMUM: u64 = 16536;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_flags_compose() {
        let f = OpenFlags::READ_WRITE | OpenFlags::CREATE | OpenFlags::MAIN_STORE;
        assert!(f.contains(OpenFlags::CREATE));
        assert!(!f.contains(OpenFlags::DELETE_ON_CLOSE));
    }

    #[test]
    fn temp_and_journal_are_distinct() {
        assert!(!OpenFlags::TEMP.intersects(OpenFlags::JOURNAL));
    }
}
