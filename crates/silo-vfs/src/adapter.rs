//! The lock adapter.
//!
//! Sits between the relational engine and a [`Volume`], providing the file
//! semantics the engine assumes and the backing filesystem does not have:
//!
//! - one shared `FileEntry` per path, reference-counted across opens, held in
//!   a path-keyed registry under a single registry mutex;
//! - the five-level lock ladder with busy-vs-error discipline (contention is
//!   reported as `Busy` for the caller to retry; contract violations are hard
//!   `LockProtocol` errors);
//! - offset-addressed reads and writes, each one an atomic seek+transfer
//!   under the entry mutex;
//! - zero-filled short reads and zero-extended sparse writes.
//!
//! Lock ownership is tracked per handle. Handles are not shared between
//! threads by the engine, so handle identity and thread identity coincide;
//! tracking the handle keeps ownership checks exact even when a test drives
//! several handles from one thread.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rand::RngCore;
use silo_error::{Result, SiloError};
use silo_types::flags::PREALLOCATE_MINIMUM;
use silo_types::{AccessCheck, FileControl, LockLevel, OpenFlags, SyncFlags};
use tracing::{debug, trace};

use crate::traits::{Volume, VolumeFile};

/// Files cannot be deleted out from under an open handle; the registry keeps
/// them alive until the last close.
pub const IOCAP_UNDELETABLE_WHEN_OPEN: u32 = 0x0000_0800;

// Sparse writes materialize the gap through this much stack at a time.
const ZERO_CHUNK: usize = 512;

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

type HandleId = u64;

#[derive(Debug)]
struct EntryState<F> {
    file: Option<F>,
    open_count: u32,
    lock_level: LockLevel,
    shared_locks: u32,
    owner: Option<HandleId>,
    delete_on_close: bool,
    read_only: bool,
}

#[derive(Debug)]
struct FileEntry<F> {
    path: PathBuf,
    state: Mutex<EntryState<F>>,
}

#[derive(Debug)]
struct AdapterInner<V: Volume> {
    volume: V,
    registry: Mutex<HashMap<PathBuf, Arc<FileEntry<V::File>>>>,
    next_handle_id: AtomicU64,
    next_temp_id: AtomicU64,
}

/// The engine-facing file layer over a [`Volume`]. Cheap to clone; all
/// clones share one registry.
#[derive(Debug)]
pub struct LockAdapter<V: Volume> {
    inner: Arc<AdapterInner<V>>,
}

impl<V: Volume> Clone for LockAdapter<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Volume> LockAdapter<V> {
    pub fn new(volume: V) -> Self {
        Self {
            inner: Arc::new(AdapterInner {
                volume,
                registry: Mutex::new(HashMap::new()),
                next_handle_id: AtomicU64::new(1),
                next_temp_id: AtomicU64::new(1),
            }),
        }
    }

    /// The backing volume.
    pub fn volume(&self) -> &V {
        &self.inner.volume
    }

    /// Open a file. Passing `None` as the path requires [`OpenFlags::TEMP`]
    /// and generates a unique scratch name.
    ///
    /// The registry mutex serializes the whole probe-then-create-or-attach
    /// sequence, so two racing opens of a new path converge on one entry.
    pub fn open(&self, path: Option<&Path>, flags: OpenFlags) -> Result<AdapterFile<V>> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => {
                if !flags.contains(OpenFlags::TEMP) {
                    return Err(SiloError::internal("anonymous open requires TEMP"));
                }
                let n = self.inner.next_temp_id.fetch_add(1, Ordering::Relaxed);
                let name = PathBuf::from(format!("~silo_temp-{n:010}"));
                // A stale scratch file from a previous run shadows the name.
                match self.inner.volume.delete(&name) {
                    Ok(()) | Err(SiloError::StoreNotFound { .. }) => {}
                    Err(e) => return Err(e),
                }
                name
            }
        };

        let handle_id = self.inner.next_handle_id.fetch_add(1, Ordering::Relaxed);
        let mut registry = self.inner.registry.lock();

        if let Some(entry) = registry.get(&path).cloned() {
            let mut st = entry.state.lock();
            st.open_count += 1;
            if flags.contains(OpenFlags::DELETE_ON_CLOSE) {
                st.delete_on_close = true;
            }
            let mut demoted = false;
            if st.read_only && flags.contains(OpenFlags::READ_WRITE) {
                // Upgrade the shared handle for the new writer, falling back
                // to read-only if the volume refuses.
                match self.inner.volume.open(&path, true) {
                    Ok(f) => {
                        st.file = Some(f);
                        st.read_only = false;
                    }
                    Err(SiloError::ReadOnly) => demoted = true,
                    Err(e) => {
                        st.open_count -= 1;
                        return Err(e);
                    }
                }
            }
            let read_only = st.read_only || !flags.contains(OpenFlags::READ_WRITE);
            let handle_level = if st.owner == Some(handle_id) {
                st.lock_level
            } else {
                LockLevel::None
            };
            drop(st);
            debug!(path = %entry.path.display(), demoted, "attached to open file");
            return Ok(AdapterFile {
                adapter: self.clone(),
                entry,
                id: handle_id,
                read_only,
                handle_level,
                closed: false,
            });
        }

        let exists = match self.inner.volume.attributes(&path) {
            Ok(_) => true,
            Err(SiloError::StoreNotFound { .. }) => false,
            Err(e) => return Err(e),
        };
        if exists && flags.contains(OpenFlags::CREATE | OpenFlags::EXCLUSIVE) {
            return Err(SiloError::CannotOpen { path });
        }
        if !exists {
            if !flags.contains(OpenFlags::CREATE) {
                return Err(SiloError::StoreNotFound { path });
            }
            self.inner.volume.create(&path)?;
        }

        let want_write = flags.contains(OpenFlags::READ_WRITE);
        let (file, entry_read_only) = if want_write {
            match self.inner.volume.open(&path, true) {
                Ok(f) => (f, false),
                Err(SiloError::ReadOnly) => (self.inner.volume.open(&path, false)?, true),
                Err(e) => return Err(e),
            }
        } else {
            (self.inner.volume.open(&path, false)?, true)
        };

        // Scratch and journal files are single-owner by construction, so the
        // creating handle starts out holding Exclusive.
        let pre_locked = flags.intersects(OpenFlags::TEMP | OpenFlags::JOURNAL);
        let entry = Arc::new(FileEntry {
            path: path.clone(),
            state: Mutex::new(EntryState {
                file: Some(file),
                open_count: 1,
                lock_level: if pre_locked {
                    LockLevel::Exclusive
                } else {
                    LockLevel::None
                },
                shared_locks: 0,
                owner: pre_locked.then_some(handle_id),
                delete_on_close: flags.contains(OpenFlags::DELETE_ON_CLOSE),
                read_only: entry_read_only,
            }),
        });
        registry.insert(path.clone(), Arc::clone(&entry));
        drop(registry);

        debug!(path = %path.display(), pre_locked, read_only = entry_read_only, "opened file");
        Ok(AdapterFile {
            adapter: self.clone(),
            entry,
            id: handle_id,
            read_only: entry_read_only || !want_write,
            handle_level: if pre_locked {
                LockLevel::Exclusive
            } else {
                LockLevel::None
            },
            closed: false,
        })
    }

    /// Delete a file. Fails while any handle is open on it.
    pub fn delete(&self, path: &Path) -> Result<()> {
        let registry = self.inner.registry.lock();
        if registry.contains_key(path) {
            return Err(SiloError::Busy);
        }
        self.inner.volume.delete(path)
    }

    /// Existence/permission probe. Missing files answer `false`, they are
    /// not an error here.
    pub fn access(&self, path: &Path, check: AccessCheck) -> Result<bool> {
        match self.inner.volume.attributes(path) {
            Ok(attr) => {
                if check.contains(AccessCheck::READ_WRITE) {
                    Ok(!attr.read_only)
                } else {
                    Ok(true)
                }
            }
            Err(SiloError::StoreNotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Canonical form of a path for registry keying. The volume namespace is
    /// flat, so this is a verbatim copy.
    pub fn full_pathname(&self, path: &Path) -> Result<PathBuf> {
        Ok(path.to_path_buf())
    }

    /// Fill `buf` with random bytes.
    pub fn randomness(&self, buf: &mut [u8]) {
        rand::thread_rng().fill_bytes(buf);
    }

    /// Block the calling thread.
    pub fn sleep(&self, d: Duration) {
        std::thread::sleep(d);
    }

    /// Current time as a Julian day number.
    pub fn current_time(&self) -> f64 {
        let millis = self.current_time_millis();
        2_440_587.5 + millis as f64 / 86_400_000.0
    }

    /// Current time as milliseconds since the Unix epoch.
    pub fn current_time_millis(&self) -> i64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }

    /// Number of live registry entries.
    pub fn open_file_count(&self) -> usize {
        self.inner.registry.lock().len()
    }

    /// Reference count for a path, if it is open.
    pub fn reference_count(&self, path: &Path) -> Option<u32> {
        self.inner
            .registry
            .lock()
            .get(path)
            .map(|e| e.state.lock().open_count)
    }
}

// ---------------------------------------------------------------------------
// File handles
// ---------------------------------------------------------------------------

/// One open handle onto a registered file.
#[derive(Debug)]
pub struct AdapterFile<V: Volume> {
    adapter: LockAdapter<V>,
    entry: Arc<FileEntry<V::File>>,
    id: HandleId,
    read_only: bool,
    handle_level: LockLevel,
    closed: bool,
}

/// Answer to a [`FileControl`] request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlReply {
    Done,
    LockState(LockLevel),
    HasMoved(bool),
}

impl<V: Volume> AdapterFile<V> {
    /// The registry path of this handle.
    pub fn path(&self) -> &Path {
        &self.entry.path
    }

    /// Whether writes through this handle will be refused.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Lock level this handle holds.
    pub fn lock_level(&self) -> LockLevel {
        self.handle_level
    }

    /// Read `buf.len()` bytes at `offset`. Reads past end-of-file are not an
    /// error: the tail of `buf` is zero-filled and the true byte count
    /// returned, so a short result is visible to the caller.
    pub fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut st = self.entry.state.lock();
        let file = st
            .file
            .as_mut()
            .ok_or_else(|| SiloError::internal("read on a closed entry"))?;
        let size = file.size()?;
        if offset >= size {
            buf.fill(0);
            return Ok(0);
        }
        file.seek(offset)?;
        let n = file.read(buf)?;
        if n < buf.len() {
            buf[n..].fill(0);
        }
        trace!(path = %self.entry.path.display(), offset, n, "read");
        Ok(n)
    }

    /// Write all of `buf` at `offset`. Requires this handle to hold
    /// Exclusive. A write past end-of-file zero-extends the gap first, in
    /// bounded chunks, so no byte range is ever left uninitialized.
    pub fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut st = self.entry.state.lock();
        if st.read_only {
            return Err(SiloError::ReadOnly);
        }
        if st.lock_level != LockLevel::Exclusive || st.owner != Some(self.id) {
            return Err(SiloError::lock_protocol(
                "write requires an Exclusive lock held by the writing handle",
            ));
        }
        let file = st
            .file
            .as_mut()
            .ok_or_else(|| SiloError::internal("write on a closed entry"))?;
        let size = file.size()?;
        if offset > size {
            const ZEROES: [u8; ZERO_CHUNK] = [0u8; ZERO_CHUNK];
            file.seek(size)?;
            let mut gap = offset - size;
            while gap > 0 {
                let n = gap.min(ZERO_CHUNK as u64) as usize;
                file.write(&ZEROES[..n])?;
                gap -= n as u64;
            }
        } else {
            file.seek(offset)?;
        }
        file.write(buf)?;
        trace!(path = %self.entry.path.display(), offset, len = buf.len(), "write");
        Ok(())
    }

    /// Cut the file to `len` bytes. Same lock requirement as `write`.
    pub fn truncate(&mut self, len: u64) -> Result<()> {
        let mut st = self.entry.state.lock();
        if st.read_only {
            return Err(SiloError::ReadOnly);
        }
        if st.lock_level != LockLevel::Exclusive || st.owner != Some(self.id) {
            return Err(SiloError::lock_protocol(
                "truncate requires an Exclusive lock held by the writing handle",
            ));
        }
        st.file
            .as_mut()
            .ok_or_else(|| SiloError::internal("truncate on a closed entry"))?
            .truncate(len)
    }

    /// Push dirty data to media.
    pub fn sync(&mut self, _flags: SyncFlags) -> Result<()> {
        let mut st = self.entry.state.lock();
        st.file
            .as_mut()
            .ok_or_else(|| SiloError::internal("sync on a closed entry"))?
            .flush()
    }

    /// Current file length.
    pub fn size(&self) -> Result<u64> {
        let mut st = self.entry.state.lock();
        st.file
            .as_mut()
            .ok_or_else(|| SiloError::internal("size on a closed entry"))?
            .size()
    }

    /// Request `level` on this file.
    ///
    /// Returns `Busy` when contention denies the grant (the caller owns
    /// retry/backoff; this never blocks) and `LockProtocol` on requests the
    /// ladder forbids. On the Shared-to-Exclusive path with readers still
    /// present the file is left at Pending with this handle as owner and
    /// `Busy` is returned; retrying Exclusive succeeds once readers drain.
    pub fn lock(&mut self, requested: LockLevel) -> Result<()> {
        if requested == LockLevel::None {
            return Err(SiloError::lock_protocol("lock target must be at least Shared"));
        }
        let mut st = self.entry.state.lock();
        let outcome = apply_lock(&mut st, &mut self.handle_level, self.id, requested);
        trace!(
            path = %self.entry.path.display(),
            requested = %requested,
            level = %st.lock_level,
            shared = st.shared_locks,
            granted = outcome.is_ok(),
            "lock"
        );
        outcome
    }

    /// Downgrade to `target` (`None` or `Shared`).
    pub fn unlock(&mut self, target: LockLevel) -> Result<()> {
        let mut st = self.entry.state.lock();
        let outcome = apply_unlock(&mut st, &mut self.handle_level, self.id, target);
        trace!(
            path = %self.entry.path.display(),
            target = %target,
            level = %st.lock_level,
            shared = st.shared_locks,
            ok = outcome.is_ok(),
            "unlock"
        );
        outcome
    }

    /// Whether any handle holds Reserved or above on this file.
    pub fn check_reserved_lock(&self) -> Result<bool> {
        Ok(self.entry.state.lock().lock_level >= LockLevel::Reserved)
    }

    /// Extension operations.
    pub fn file_control(&mut self, op: FileControl) -> Result<ControlReply> {
        match op {
            FileControl::LockState => {
                Ok(ControlReply::LockState(self.entry.state.lock().lock_level))
            }
            FileControl::SizeHint(hint) => {
                let mut st = self.entry.state.lock();
                let file = st
                    .file
                    .as_mut()
                    .ok_or_else(|| SiloError::internal("size hint on a closed entry"))?;
                let size = file.size()?;
                if hint > size && hint - size >= PREALLOCATE_MINIMUM {
                    file.preallocate(hint)?;
                }
                Ok(ControlReply::Done)
            }
            FileControl::ResetCache => {
                self.adapter.inner.volume.invalidate_cache();
                Ok(ControlReply::Done)
            }
            FileControl::HasMoved => Ok(ControlReply::HasMoved(false)),
        }
    }

    /// Native transfer granularity of the backing volume.
    pub fn sector_size(&self) -> u32 {
        self.adapter.inner.volume.sector_size()
    }

    /// I/O capability bits for this file.
    pub fn device_characteristics(&self) -> u32 {
        IOCAP_UNDELETABLE_WHEN_OPEN
    }

    /// Drop this handle's reference. The underlying file closes (and is
    /// deleted, if any opener asked for delete-on-close) only when the last
    /// reference goes; the registry mutex excludes a racing open.
    pub fn close(mut self) -> Result<()> {
        self.close_inner()
    }

    fn close_inner(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if self.handle_level > LockLevel::None {
            let mut st = self.entry.state.lock();
            let _ = apply_unlock(&mut st, &mut self.handle_level, self.id, LockLevel::None);
        }

        let mut registry = self.adapter.inner.registry.lock();
        let mut st = self.entry.state.lock();
        st.open_count -= 1;
        if st.open_count > 0 {
            return Ok(());
        }
        let file = st.file.take();
        let delete_on_close = st.delete_on_close;
        drop(st);
        registry.remove(&self.entry.path);
        drop(registry);
        drop(file);
        debug!(path = %self.entry.path.display(), delete_on_close, "closed last reference");
        if delete_on_close {
            match self.adapter.inner.volume.delete(&self.entry.path) {
                Ok(()) | Err(SiloError::StoreNotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl<V: Volume> Drop for AdapterFile<V> {
    fn drop(&mut self) {
        let _ = self.close_inner();
    }
}

// ---------------------------------------------------------------------------
// Lock state machine
// ---------------------------------------------------------------------------

fn apply_lock<F>(
    st: &mut EntryState<F>,
    handle: &mut LockLevel,
    me: HandleId,
    requested: LockLevel,
) -> Result<()> {
    use LockLevel::{Exclusive, None, Pending, Reserved, Shared};

    match st.lock_level {
        None => {
            if requested == Shared {
                st.lock_level = Shared;
                st.shared_locks = 1;
            } else {
                st.lock_level = requested;
                st.owner = Some(me);
            }
            *handle = requested;
            Ok(())
        }
        Shared => match requested {
            Shared => {
                st.shared_locks += 1;
                *handle = Shared;
                Ok(())
            }
            Reserved | Pending => {
                // The escalator drops out of the reader set while staying
                // registered as the write-intent owner.
                if *handle != Shared {
                    return Err(SiloError::lock_protocol(
                        "escalation requires holding Shared first",
                    ));
                }
                st.shared_locks = st.shared_locks.saturating_sub(1);
                st.lock_level = requested;
                st.owner = Some(me);
                *handle = requested;
                Ok(())
            }
            Exclusive => {
                if *handle != Shared {
                    return Err(SiloError::lock_protocol(
                        "escalation requires holding Shared first",
                    ));
                }
                st.shared_locks = st.shared_locks.saturating_sub(1);
                st.owner = Some(me);
                if st.shared_locks > 0 {
                    // Readers must drain before the grant; the file parks at
                    // Pending so no new readers join meanwhile.
                    st.lock_level = Pending;
                    *handle = Pending;
                    Err(SiloError::Busy)
                } else {
                    st.lock_level = Exclusive;
                    *handle = Exclusive;
                    Ok(())
                }
            }
            None => unreachable!("filtered by lock()"),
        },
        Reserved => {
            if st.owner != Some(me) {
                // Reserved only announces write intent; readers keep joining
                // until the writer parks the file at Pending.
                if requested == Shared {
                    st.shared_locks += 1;
                    *handle = Shared;
                    return Ok(());
                }
                return Err(SiloError::Busy);
            }
            match requested {
                Reserved => Ok(()),
                Pending => {
                    st.lock_level = Pending;
                    *handle = Pending;
                    Ok(())
                }
                Exclusive => {
                    if st.shared_locks > 0 {
                        st.lock_level = Pending;
                        *handle = Pending;
                        Err(SiloError::Busy)
                    } else {
                        st.lock_level = Exclusive;
                        *handle = Exclusive;
                        Ok(())
                    }
                }
                Shared | None => Err(SiloError::lock_protocol(
                    "cannot downgrade through lock; use unlock",
                )),
            }
        }
        Pending => {
            if st.owner != Some(me) {
                return Err(SiloError::Busy);
            }
            match requested {
                Exclusive => {
                    if st.shared_locks == 0 {
                        st.lock_level = Exclusive;
                        *handle = Exclusive;
                        Ok(())
                    } else {
                        Err(SiloError::Busy)
                    }
                }
                Pending => Ok(()),
                Shared => Err(SiloError::lock_protocol(
                    "no new Shared locks while a write is pending",
                )),
                Reserved | None => Err(SiloError::lock_protocol(
                    "cannot downgrade through lock; use unlock",
                )),
            }
        }
        Exclusive => {
            if st.owner == Some(me) {
                Err(SiloError::lock_protocol(
                    "already Exclusive; use unlock to downgrade",
                ))
            } else {
                Err(SiloError::Busy)
            }
        }
    }
}

fn apply_unlock<F>(
    st: &mut EntryState<F>,
    handle: &mut LockLevel,
    me: HandleId,
    target: LockLevel,
) -> Result<()> {
    use LockLevel::{Exclusive, None, Pending, Reserved, Shared};

    match target {
        None => match st.lock_level {
            None => {
                *handle = None;
                Ok(())
            }
            Shared => {
                if *handle != Shared {
                    return Err(SiloError::lock_protocol("unlocking a level never held"));
                }
                st.shared_locks = st.shared_locks.saturating_sub(1);
                if st.shared_locks == 0 {
                    st.lock_level = None;
                }
                *handle = None;
                Ok(())
            }
            Reserved | Pending | Exclusive => {
                if st.owner == Some(me) {
                    st.owner = Option::None;
                    st.lock_level = if st.shared_locks > 0 { Shared } else { None };
                } else {
                    // A reader dropping out from under a writer's intent.
                    if *handle != Shared {
                        return Err(SiloError::lock_protocol("unlocking a level never held"));
                    }
                    st.shared_locks = st.shared_locks.saturating_sub(1);
                }
                *handle = None;
                Ok(())
            }
        },
        Shared => {
            if st.lock_level >= Reserved && st.owner == Some(me) {
                st.owner = Option::None;
                st.lock_level = Shared;
                st.shared_locks += 1;
                *handle = Shared;
                Ok(())
            } else {
                Err(SiloError::lock_protocol(
                    "unlock to Shared requires holding a write-intent lock",
                ))
            }
        }
        Reserved | Pending | Exclusive => Err(SiloError::lock_protocol(
            "unlock target must be None or Shared",
        )),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
