//! Slot pool, handles, and the acquire/commit/release protocol.
//!
//! Concurrency discipline: a single mutex guards the slot table; every state
//! transition (acquiring a write handle, committing, acquiring and releasing
//! read handles) is serialized through it. The byte region itself is never
//! touched under the lock: a write handle owns the slot's `BytesMut` for the
//! duration of the write, and read handles share the frozen `Bytes` of a
//! committed chunk. A condition variable wakes bounded waiters when the
//! current chunk changes, for callers that prefer blocking over retry.

use bytes::{Bytes, BytesMut};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::{RetentionPolicy, VersionId};

/// Lifecycle state of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    /// Reusable; holds a spare byte region.
    Empty,
    /// An outstanding write handle owns the byte region.
    Writing,
    /// Committed and observable through `acquire_current`.
    Readable,
    /// Superseded or consumed; recycles when its last reader releases.
    Expired,
}

/// Ownership of a slot's byte region across the lifecycle.
enum SlotPayload {
    /// Region parked in the slot, ready for the next write.
    Spare(BytesMut),
    /// Region owned by the outstanding write handle.
    InFlight,
    /// Committed chunk, shared with read handles.
    Committed(Bytes),
}

struct Slot {
    payload: SlotPayload,
    state: SlotState,
    version: VersionId,
    readers: usize,
}

struct SlotTable {
    slots: Vec<Slot>,
    /// Index of the highest-version readable slot, if any.
    current: Option<usize>,
    write_in_progress: bool,
    next_version: VersionId,
}

/// A fixed pool of byte slots for one named data type.
///
/// Slots are allocated once here and reused for the lifetime of the buffer;
/// no per-chunk allocation happens on the ingestion path.
pub struct DataBuffer {
    name: String,
    policy: RetentionPolicy,
    slot_capacity: usize,
    table: Mutex<SlotTable>,
    current_changed: Condvar,
}

impl DataBuffer {
    /// Constructs a buffer with `slot_count` slots of `slot_capacity` bytes.
    pub fn new(
        name: impl Into<String>,
        policy: RetentionPolicy,
        slot_count: usize,
        slot_capacity: usize,
    ) -> Arc<Self> {
        let slots = (0..slot_count.max(1))
            .map(|_| Slot {
                payload: SlotPayload::Spare(BytesMut::with_capacity(slot_capacity)),
                state: SlotState::Empty,
                version: 0,
                readers: 0,
            })
            .collect();

        Arc::new(Self {
            name: name.into(),
            policy,
            slot_capacity,
            table: Mutex::new(SlotTable {
                slots,
                current: None,
                write_in_progress: false,
                next_version: 1,
            }),
            current_changed: Condvar::new(),
        })
    }

    /// The data type name this buffer serves.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The retention policy selected at construction.
    pub fn policy(&self) -> RetentionPolicy {
        self.policy
    }

    /// Capacity of each slot in bytes.
    pub fn slot_capacity(&self) -> usize {
        self.slot_capacity
    }

    /// Version of the current chunk, if one has been committed and not
    /// consumed. Cheaper than taking a read handle when only the version is
    /// needed (cache validation on the server side).
    pub fn current_version(&self) -> Option<VersionId> {
        let table = self.lock();
        table.current.map(|idx| table.slots[idx].version)
    }

    /// Returns an exclusive handle to a slot sized for `size` bytes, or
    /// `None` when a write is already in progress, `size` exceeds the slot
    /// capacity, or no slot is reusable. `None` is backpressure, not an
    /// error; callers retry or drop the chunk.
    pub fn acquire_writable(self: &Arc<Self>, size: usize) -> Option<WriteHandle> {
        if size > self.slot_capacity {
            return None;
        }
        let mut table = self.lock();
        if table.write_in_progress {
            return None;
        }
        let idx = self.find_writable_slot(&table)?;

        // Rewriting the current slot supersedes it (service policy only;
        // find_writable_slot never offers the current slot for streams).
        if table.current == Some(idx) {
            table.current = None;
        }

        let slot = &mut table.slots[idx];
        let payload = std::mem::replace(&mut slot.payload, SlotPayload::InFlight);
        let mut buf = match payload {
            SlotPayload::Spare(buf) => buf,
            // A stray Bytes clone can pin the old region; fall back to a
            // fresh one rather than blocking the writer.
            SlotPayload::Committed(bytes) => bytes
                .try_into_mut()
                .unwrap_or_else(|_| BytesMut::with_capacity(self.slot_capacity)),
            SlotPayload::InFlight => BytesMut::with_capacity(self.slot_capacity),
        };
        buf.clear();
        buf.resize(size, 0);

        slot.state = SlotState::Writing;
        table.write_in_progress = true;

        Some(WriteHandle {
            buffer: Arc::clone(self),
            slot: idx,
            buf: Some(buf),
            aborted: false,
        })
    }

    /// Returns a shared handle to the current chunk, or `None` if nothing is
    /// committed (or, for streams, the last chunk was already consumed).
    /// Never blocks.
    pub fn acquire_current(self: &Arc<Self>) -> Option<ReadHandle> {
        let mut table = self.lock();
        self.read_current(&mut table)
    }

    /// Like [`acquire_current`](Self::acquire_current), but waits up to
    /// `timeout` for a chunk to become current.
    pub fn wait_current(self: &Arc<Self>, timeout: Duration) -> Option<ReadHandle> {
        let deadline = Instant::now() + timeout;
        let mut table = self.lock();
        loop {
            if let Some(handle) = self.read_current(&mut table) {
                return Some(handle);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .current_changed
                .wait_timeout(table, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            table = guard;
        }
    }

    fn read_current(self: &Arc<Self>, table: &mut MutexGuard<'_, SlotTable>) -> Option<ReadHandle> {
        let idx = table.current?;
        let slot = &mut table.slots[idx];
        let bytes = match &slot.payload {
            SlotPayload::Committed(bytes) => bytes.clone(),
            _ => return None,
        };
        slot.readers += 1;
        Some(ReadHandle {
            buffer: Arc::clone(self),
            slot: idx,
            bytes,
            version: slot.version,
        })
    }

    fn find_writable_slot(&self, table: &SlotTable) -> Option<usize> {
        if let Some(idx) = table
            .slots
            .iter()
            .position(|slot| slot.state == SlotState::Empty)
        {
            return Some(idx);
        }
        // A service buffer may rewrite its current slot in place once no
        // reader holds it; the value is superseded by the incoming commit.
        if self.policy == RetentionPolicy::Service {
            if let Some(idx) = table.current {
                if table.slots[idx].readers == 0 {
                    return Some(idx);
                }
            }
        }
        None
    }

    /// Publishes a finished write: Writing -> Readable, next version, new
    /// current. Called from the write handle on release.
    fn commit_slot(&self, idx: usize, bytes: Bytes) {
        let mut table = self.lock();
        let version = table.next_version;
        table.next_version += 1;

        if let Some(old) = table.current {
            if old != idx {
                let old_slot = &mut table.slots[old];
                old_slot.state = SlotState::Expired;
                if old_slot.readers == 0 {
                    recycle_slot(old_slot, self.slot_capacity);
                }
            }
        }

        let slot = &mut table.slots[idx];
        slot.payload = SlotPayload::Committed(bytes);
        slot.state = SlotState::Readable;
        slot.version = version;
        table.current = Some(idx);
        table.write_in_progress = false;

        drop(table);
        self.current_changed.notify_all();
    }

    /// Returns an aborted write's region to the pool without publishing.
    fn abort_slot(&self, idx: usize, mut buf: BytesMut) {
        let mut table = self.lock();
        buf.clear();
        let slot = &mut table.slots[idx];
        slot.payload = SlotPayload::Spare(buf);
        slot.state = SlotState::Empty;
        table.write_in_progress = false;
    }

    /// Read-handle release: decrements the reader count and recycles the slot
    /// once it is expired and unread. For stream buffers, releasing the
    /// current chunk consumes it.
    fn release_slot(&self, idx: usize) {
        let mut table = self.lock();
        if self.policy == RetentionPolicy::Stream && table.current == Some(idx) {
            table.current = None;
            table.slots[idx].state = SlotState::Expired;
        }
        let slot = &mut table.slots[idx];
        slot.readers = slot.readers.saturating_sub(1);
        if slot.state == SlotState::Expired && slot.readers == 0 {
            recycle_slot(slot, self.slot_capacity);
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotTable> {
        // Transitions are applied atomically under the guard; a poisoned
        // table is still consistent, so recover it.
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn recycle_slot(slot: &mut Slot, capacity: usize) {
    let payload = std::mem::replace(&mut slot.payload, SlotPayload::InFlight);
    let mut buf = match payload {
        SlotPayload::Spare(buf) => buf,
        SlotPayload::Committed(bytes) => bytes
            .try_into_mut()
            .unwrap_or_else(|_| BytesMut::with_capacity(capacity)),
        SlotPayload::InFlight => BytesMut::with_capacity(capacity),
    };
    buf.clear();
    slot.payload = SlotPayload::Spare(buf);
    slot.state = SlotState::Empty;
}

/// Exclusive, scope-bound accessor for a slot being written.
///
/// Dropping the handle commits: the chunk becomes readable, receives the next
/// version number, and becomes the buffer's current chunk. Call
/// [`abort`](Self::abort) on error paths to discard instead.
pub struct WriteHandle {
    buffer: Arc<DataBuffer>,
    slot: usize,
    buf: Option<BytesMut>,
    aborted: bool,
}

impl WriteHandle {
    /// The writable byte region, sized to the length requested from
    /// `acquire_writable`.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        match self.buf.as_mut() {
            Some(buf) => buf.as_mut(),
            None => &mut [],
        }
    }

    /// Number of bytes this handle will publish on commit.
    pub fn len(&self) -> usize {
        self.buf.as_ref().map_or(0, |buf| buf.len())
    }

    /// Whether the chunk is zero-sized.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Publishes the chunk. Equivalent to dropping the handle; provided so
    /// call sites can state the transition explicitly.
    pub fn commit(self) {
        drop(self);
    }

    /// Discards the write and returns the slot to the pool unpublished.
    pub fn abort(mut self) {
        self.aborted = true;
        if let Some(buf) = self.buf.take() {
            self.buffer.abort_slot(self.slot, buf);
        }
    }
}

impl Drop for WriteHandle {
    fn drop(&mut self) {
        if self.aborted {
            return;
        }
        if let Some(buf) = self.buf.take() {
            self.buffer.commit_slot(self.slot, buf.freeze());
        }
    }
}

/// Shared, scope-bound accessor for a committed chunk.
///
/// Holding a read handle pins the slot: it cannot be reused for writing until
/// every reader has released. Dropping the handle releases.
pub struct ReadHandle {
    buffer: Arc<DataBuffer>,
    slot: usize,
    bytes: Bytes,
    version: VersionId,
}

impl ReadHandle {
    /// The committed chunk contents.
    pub fn data(&self) -> &[u8] {
        &self.bytes
    }

    /// Version stamped at commit time.
    pub fn version(&self) -> VersionId {
        self.version
    }

    /// The data type name of the owning buffer.
    pub fn type_name(&self) -> &str {
        self.buffer.name()
    }

    /// Chunk length in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the chunk is zero-sized.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl Drop for ReadHandle {
    fn drop(&mut self) {
        // Let go of the payload before releasing so the slot's region is
        // uniquely owned again and can be recycled in place.
        self.bytes = Bytes::new();
        self.buffer.release_slot(self.slot);
    }
}
