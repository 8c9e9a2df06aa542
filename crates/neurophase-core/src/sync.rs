//! Triple-buffered lock-free exchange of a resource between two threads.
//!
//! One thread continuously updates a resource and publishes snapshots through
//! a [`Writer`]; a second thread receives the most recent snapshot through a
//! [`Reader`], without either side ever blocking. Three physical instances of
//! the resource rotate between the roles via atomic index hand-off:
//!
//! - one slot may be written by the producer,
//! - one slot may be read by the consumer,
//! - the remaining slot(s) are in flight between them.
//!
//! At most one `Writer` and one `Reader` can exist per resource at a time;
//! checking out a second of either role fails cleanly. Structural changes
//! (resizing the payload, clearing state) go through [`Lockout`], which
//! claims both roles at once and therefore fails while streaming is active.
//!
//! The publish edge uses release ordering and the consume edge acquire
//! ordering, so a consumer that observes a published index also observes
//! every payload write that preceded the publish.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use crate::error::{SyncError, SyncResult};

/// Sentinel for "no slot" in the index cells.
const EMPTY: i32 = -1;

/// Atomic index rotation shared by the producer and consumer roles.
///
/// Five cells track slot ownership: `ready_to_read` holds the most recently
/// published slot (or `EMPTY`), the two `ready_to_write` cells hold slots
/// available to the producer, and `writer_index`/`reader_index` hold the
/// slots currently claimed by each role. Only the producer empties the
/// `ready_to_write` cells and only the consumer empties `ready_to_read`, so
/// with a single thread per role the three-way rotation can never deadlock
/// or alias two roles onto one slot.
struct Synchronizer {
    ready_to_read: AtomicI32,
    ready_to_write: AtomicI32,
    ready_to_write2: AtomicI32,

    // Claimed slots. Each is written only while the corresponding role is
    // checked out, which is single-threaded by construction.
    writer_index: AtomicI32,
    reader_index: AtomicI32,

    writer_out: AtomicBool,
    reader_out: AtomicBool,
}

impl Synchronizer {
    fn new() -> Self {
        Self {
            ready_to_read: AtomicI32::new(EMPTY),
            ready_to_write: AtomicI32::new(0),
            ready_to_write2: AtomicI32::new(1),
            writer_index: AtomicI32::new(2),
            reader_index: AtomicI32::new(EMPTY),
            writer_out: AtomicBool::new(false),
            reader_out: AtomicBool::new(false),
        }
    }

    fn checkout_writer(&self) -> bool {
        self.writer_out
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn return_writer(&self) {
        self.writer_out.store(false, Ordering::Release);
    }

    fn checkout_reader(&self) -> bool {
        self.reader_out
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn return_reader(&self) {
        self.reader_out.store(false, Ordering::Release);
    }

    /// Publish the writer's slot and claim the next one to write into.
    ///
    /// Called only by the checked-out writer. The release swap makes all
    /// payload writes visible to a consumer that acquires the index.
    fn publish(&self) {
        let written = self.writer_index.load(Ordering::Relaxed);
        debug_assert_ne!(written, EMPTY, "writer holds a slot while checked out");

        // If the previous publication was never consumed, it comes straight
        // back as the next write target (the consumer only ever sees the
        // latest snapshot).
        let recycled = self.ready_to_read.swap(written, Ordering::AcqRel);
        if recycled != EMPTY {
            self.writer_index.store(recycled, Ordering::Relaxed);
            return;
        }

        let mut next = self.ready_to_write.swap(EMPTY, Ordering::AcqRel);
        if next == EMPTY {
            next = self.ready_to_write2.swap(EMPTY, Ordering::AcqRel);
        }
        // writer_index, ready_to_write, and ready_to_write2 cannot all be
        // empty: only the single writer sets any of them to EMPTY.
        debug_assert_ne!(next, EMPTY);
        self.writer_index.store(next, Ordering::Relaxed);
    }

    /// Pull the most recent publication, if any, returning the slot the
    /// reader now holds (`EMPTY` before the first publish).
    ///
    /// Called only by the checked-out reader.
    fn pull(&self) -> i32 {
        // The cell can gain a newer value after this check but cannot be
        // emptied, because the writer never stores EMPTY into it.
        if self.ready_to_read.load(Ordering::Relaxed) != EMPTY {
            let held = self.reader_index.load(Ordering::Relaxed);
            if held != EMPTY {
                // Hand the previously read slot back to the writer before
                // taking the update.
                if self
                    .ready_to_write
                    .compare_exchange(EMPTY, held, Ordering::AcqRel, Ordering::Relaxed)
                    .is_err()
                {
                    self.ready_to_write2.swap(held, Ordering::AcqRel);
                }
            }
            let fresh = self.ready_to_read.swap(EMPTY, Ordering::Acquire);
            debug_assert_ne!(fresh, EMPTY);
            self.reader_index.store(fresh, Ordering::Relaxed);
        }
        self.reader_index.load(Ordering::Relaxed)
    }

    fn has_update(&self) -> bool {
        self.ready_to_read.load(Ordering::Relaxed) != EMPTY
    }

    /// Restore the "nothing published yet" initial state.
    ///
    /// Caller must hold both roles.
    fn reset_indices(&self) {
        self.ready_to_read.store(EMPTY, Ordering::Relaxed);
        self.ready_to_write.store(0, Ordering::Relaxed);
        self.ready_to_write2.store(1, Ordering::Relaxed);
        self.writer_index.store(2, Ordering::Relaxed);
        self.reader_index.store(EMPTY, Ordering::Relaxed);
    }
}

struct Shared<T> {
    slots: [UnsafeCell<T>; 3],
    sync: Synchronizer,
}

// Slot access is mediated by the index protocol: a slot is reachable either
// through the unique writer (mutably) or the unique reader (shared), never
// both. T itself crosses threads by reference.
unsafe impl<T: Send + Sync> Send for Shared<T> {}
unsafe impl<T: Send + Sync> Sync for Shared<T> {}

/// A resource exchanged between one producer and one consumer thread through
/// three rotating instances.
///
/// The handle is cheaply cloneable; clones refer to the same underlying
/// slots. See the [module docs](self) for the usage contract.
pub struct AtomicallyShared<T> {
    inner: Arc<Shared<T>>,
}

impl<T> Clone for AtomicallyShared<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> AtomicallyShared<T> {
    /// Create a resource with three instances produced by `make`.
    pub fn new(mut make: impl FnMut() -> T) -> Self {
        Self {
            inner: Arc::new(Shared {
                slots: [
                    UnsafeCell::new(make()),
                    UnsafeCell::new(make()),
                    UnsafeCell::new(make()),
                ],
                sync: Synchronizer::new(),
            }),
        }
    }

    /// Check out the unique producer role.
    ///
    /// # Errors
    ///
    /// Fails with [`SyncError::WriterCheckedOut`] if a `Writer` already
    /// exists for this resource.
    pub fn writer(&self) -> SyncResult<Writer<T>> {
        if self.inner.sync.checkout_writer() {
            Ok(Writer {
                shared: Arc::clone(&self.inner),
            })
        } else {
            Err(SyncError::WriterCheckedOut)
        }
    }

    /// Check out the unique consumer role.
    ///
    /// # Errors
    ///
    /// Fails with [`SyncError::ReaderCheckedOut`] if a `Reader` already
    /// exists for this resource.
    pub fn reader(&self) -> SyncResult<Reader<T>> {
        if self.inner.sync.checkout_reader() {
            Ok(Reader {
                shared: Arc::clone(&self.inner),
            })
        } else {
            Err(SyncError::ReaderCheckedOut)
        }
    }

    /// True if a publish has occurred that no reader has pulled yet.
    pub fn has_update(&self) -> bool {
        self.inner.sync.has_update()
    }

    /// Claim both roles at once for structural reconfiguration.
    ///
    /// # Errors
    ///
    /// Fails with [`SyncError::Busy`] if either role is currently held.
    pub fn lockout(&self) -> SyncResult<Lockout<'_, T>> {
        let have_reader = self.inner.sync.checkout_reader();
        let have_writer = self.inner.sync.checkout_writer();
        if have_reader && have_writer {
            Ok(Lockout { shared: &self.inner })
        } else {
            if have_reader {
                self.inner.sync.return_reader();
            }
            if have_writer {
                self.inner.sync.return_writer();
            }
            Err(SyncError::Busy)
        }
    }

    /// Reset to the initial "nothing published yet" state.
    ///
    /// # Errors
    ///
    /// Fails with [`SyncError::Busy`] if a reader or writer is active.
    pub fn reset(&self) -> SyncResult<()> {
        let _lock = self.lockout()?;
        self.inner.sync.reset_indices();
        Ok(())
    }

    /// Apply `f` to all three instances under exclusive lockout.
    ///
    /// Used to resize or clear the payloads when settings change. Also
    /// resets publication state, since the old snapshots are now stale.
    ///
    /// # Errors
    ///
    /// Fails with [`SyncError::Busy`] if a reader or writer is active.
    pub fn apply(&self, mut f: impl FnMut(&mut T)) -> SyncResult<()> {
        let mut lock = self.lockout()?;
        for slot in lock.slots_mut() {
            f(slot);
        }
        self.inner.sync.reset_indices();
        Ok(())
    }
}

/// Exclusive producer handle. Dereferences to the slot being written.
///
/// Call [`publish`](Writer::publish) to make the current contents visible to
/// the consumer and claim a fresh slot to continue writing.
pub struct Writer<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Writer<T> {
    fn index(&self) -> usize {
        let idx = self.shared.sync.writer_index.load(Ordering::Relaxed);
        debug_assert!((0..3).contains(&idx));
        idx as usize
    }

    /// Publish the current slot and move on to the next write target.
    pub fn publish(&mut self) {
        self.shared.sync.publish();
    }
}

impl<T> Deref for Writer<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Sole owner of this slot until publish() rotates it out.
        unsafe { &*self.shared.slots[self.index()].get() }
    }
}

impl<T> DerefMut for Writer<T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.shared.slots[self.index()].get() }
    }
}

impl<T> Drop for Writer<T> {
    fn drop(&mut self) {
        self.shared.sync.return_writer();
    }
}

/// Exclusive consumer handle.
///
/// [`pull_update`](Reader::pull_update) claims the most recent publication if
/// one exists; [`get`](Reader::get) then exposes the held snapshot, or `None`
/// if nothing has ever been published.
pub struct Reader<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Reader<T> {
    /// Claim the latest publication. Returns true if a snapshot is held
    /// afterwards (whether or not it changed on this call).
    pub fn pull_update(&mut self) -> bool {
        self.shared.sync.pull() != EMPTY
    }

    /// The snapshot currently held, if any.
    pub fn get(&self) -> Option<&T> {
        let idx = self.shared.sync.reader_index.load(Ordering::Relaxed);
        if idx == EMPTY {
            return None;
        }
        // Sole holder of this slot until the next pull hands it back.
        Some(unsafe { &*self.shared.slots[idx as usize].get() })
    }

    /// True if a newer publication is waiting to be pulled.
    pub fn has_update(&self) -> bool {
        self.shared.sync.has_update()
    }
}

impl<T> Drop for Reader<T> {
    fn drop(&mut self) {
        self.shared.sync.return_reader();
    }
}

/// Both roles held at once; grants mutable access to every slot.
pub struct Lockout<'a, T> {
    shared: &'a Shared<T>,
}

impl<T> Lockout<'_, T> {
    /// Mutable access to all three instances.
    pub fn slots_mut(&mut self) -> impl Iterator<Item = &mut T> + '_ {
        // Both roles are held, so no other accessor can exist.
        self.shared
            .slots
            .iter()
            .map(|cell| unsafe { &mut *cell.get() })
    }
}

impl<T> Drop for Lockout<'_, T> {
    fn drop(&mut self) {
        self.shared.sync.return_reader();
        self.shared.sync.return_writer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_no_data_before_first_publish() {
        let shared = AtomicallyShared::new(|| 0u64);
        let mut reader = shared.reader().unwrap();
        assert!(!reader.pull_update());
        assert!(reader.get().is_none());
    }

    #[test]
    fn test_single_exchange() {
        let shared = AtomicallyShared::new(|| 0u64);
        let mut writer = shared.writer().unwrap();
        let mut reader = shared.reader().unwrap();

        *writer = 7;
        writer.publish();

        assert!(shared.has_update());
        assert!(reader.pull_update());
        assert_eq!(*reader.get().unwrap(), 7);
        assert!(!shared.has_update());
    }

    #[test]
    fn test_freshness_after_multiple_publishes() {
        let shared = AtomicallyShared::new(|| 0u64);
        let mut writer = shared.writer().unwrap();
        let mut reader = shared.reader().unwrap();

        for n in 1..=10 {
            *writer = n;
            writer.publish();
        }

        // One poll yields the most recent publication, not an older one.
        assert!(reader.pull_update());
        assert_eq!(*reader.get().unwrap(), 10);
    }

    #[test]
    fn test_pull_without_new_publish_is_idempotent() {
        let shared = AtomicallyShared::new(|| 0u64);
        let mut writer = shared.writer().unwrap();
        let mut reader = shared.reader().unwrap();

        *writer = 3;
        writer.publish();

        assert!(reader.pull_update());
        assert_eq!(*reader.get().unwrap(), 3);
        assert!(reader.pull_update());
        assert_eq!(*reader.get().unwrap(), 3);
    }

    #[test]
    fn test_double_checkout_fails() {
        let shared = AtomicallyShared::new(|| 0u64);
        let _writer = shared.writer().unwrap();
        let _reader = shared.reader().unwrap();

        assert_eq!(shared.writer().err(), Some(SyncError::WriterCheckedOut));
        assert_eq!(shared.reader().err(), Some(SyncError::ReaderCheckedOut));
    }

    #[test]
    fn test_roles_released_on_drop() {
        let shared = AtomicallyShared::new(|| 0u64);
        {
            let _writer = shared.writer().unwrap();
        }
        assert!(shared.writer().is_ok());
    }

    #[test]
    fn test_lockout_fails_while_role_held() {
        let shared = AtomicallyShared::new(|| 0u64);
        let writer = shared.writer().unwrap();
        assert_eq!(shared.lockout().err(), Some(SyncError::Busy));
        assert_eq!(shared.reset().err(), Some(SyncError::Busy));
        drop(writer);
        assert!(shared.lockout().is_ok());
    }

    #[test]
    fn test_reset_discards_publication() {
        let shared = AtomicallyShared::new(|| 0u64);
        {
            let mut writer = shared.writer().unwrap();
            *writer = 5;
            writer.publish();
        }
        shared.reset().unwrap();

        let mut reader = shared.reader().unwrap();
        assert!(!reader.pull_update());
        assert!(reader.get().is_none());
    }

    #[test]
    fn test_apply_resizes_all_slots() {
        let shared = AtomicallyShared::new(|| vec![0.0f64; 4]);
        shared.apply(|v| v.resize(16, 0.0)).unwrap();

        let mut writer = shared.writer().unwrap();
        assert_eq!(writer.len(), 16);
        writer.publish();
        assert_eq!(writer.len(), 16);
    }

    /// Two threads hammer the exchange; every snapshot the consumer observes
    /// must be internally consistent (all lanes equal), which fails if a slot
    /// were ever visible to both roles at once or published mid-write.
    #[test]
    fn test_concurrent_snapshots_are_consistent() {
        const ROUNDS: u64 = 50_000;
        let shared = AtomicallyShared::new(|| [0u64; 8]);

        let mut writer = shared.writer().unwrap();
        let mut reader = shared.reader().unwrap();

        let producer = thread::spawn(move || {
            for n in 1..=ROUNDS {
                for lane in writer.iter_mut() {
                    *lane = n;
                }
                writer.publish();
            }
        });

        let consumer = thread::spawn(move || {
            let mut last_seen = 0u64;
            while last_seen < ROUNDS {
                if !reader.pull_update() {
                    thread::yield_now();
                    continue;
                }
                let snap = reader.get().unwrap();
                let first = snap[0];
                assert!(snap.iter().all(|&lane| lane == first), "torn snapshot");
                assert!(first >= last_seen, "stale snapshot after newer one");
                last_seen = first;
            }
        });

        producer.join().unwrap();
        consumer.join().unwrap();
    }
}
