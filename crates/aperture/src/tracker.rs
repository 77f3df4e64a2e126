//! Buffer bookkeeping: compact per-stream buffer ids and the in-flight
//! maps that reconcile buffers returned asynchronously by the driver.
//!
//! Three separate locks keep the steady-state hot path (per-request
//! in-flight tracking) from contending with the rarer cache-management
//! path (id assignment for newly seen buffers).

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::mem;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use aperture_core::prelude::BufferHandle;

use crate::error::TrackerError;

/// Compact integer substitute for a buffer handle, cached per stream so
/// full handles cross the driver boundary only once.
///
/// Ids start at 1; [`BufferId::NONE`] (0) means "no buffer".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

impl BufferId {
    /// Reserved id meaning "no buffer".
    pub const NONE: BufferId = BufferId(0);

    /// Whether this is the reserved no-buffer id.
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf:{}", self.0)
    }
}

#[derive(Default)]
struct IdCaches {
    /// streamId → (handle → id).
    maps: HashMap<i32, HashMap<BufferHandle, BufferId>>,
    /// Next id to hand out; 0 is reserved.
    next_id: u64,
}

impl IdCaches {
    fn new() -> Self {
        Self {
            maps: HashMap::new(),
            next_id: 1,
        }
    }
}

/// Per-session registry of buffer id caches and in-flight buffers.
///
/// # Example
/// ```rust
/// use aperture::prelude::*;
///
/// let records = BufferRecords::new();
/// records.try_create_cache(0);
/// let handle = BufferHandle::new(0, 64);
/// let (is_new, id) = records.get_or_assign_id(&handle, 0).unwrap();
/// assert!(is_new);
/// let (again, same) = records.get_or_assign_id(&handle, 0).unwrap();
/// assert!(!again);
/// assert_eq!(id, same);
/// ```
pub struct BufferRecords {
    caches: Mutex<IdCaches>,
    /// (sequence, streamId) → handle, for buffers attached to requests.
    inflight: Mutex<HashMap<(u64, i32), BufferHandle>>,
    /// bufferId → (streamId, handle), for driver-initiated acquisitions.
    requested: Mutex<HashMap<BufferId, (i32, BufferHandle)>>,
}

impl Default for BufferRecords {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferRecords {
    /// Empty records with the id counter at 1.
    pub fn new() -> Self {
        Self {
            caches: Mutex::new(IdCaches::new()),
            inflight: Mutex::new(HashMap::new()),
            requested: Mutex::new(HashMap::new()),
        }
    }

    /// Ensure a cache exists for `stream`; existing caches are untouched.
    pub fn try_create_cache(&self, stream: i32) {
        let mut caches = self.caches.lock();
        caches.maps.entry(stream).or_default();
    }

    /// Drop caches for streams not in `active`.
    pub fn remove_inactive_caches(&self, active: &HashSet<i32>) {
        let mut caches = self.caches.lock();
        caches.maps.retain(|stream, _| active.contains(stream));
    }

    /// Whether a cache exists for `stream`.
    pub fn is_cached(&self, stream: i32) -> bool {
        self.caches.lock().maps.contains_key(&stream)
    }

    /// Look up the id for `handle` in `stream`'s cache, assigning a fresh
    /// one for a newly seen handle.
    ///
    /// Returns `(newly_seen, id)`. Once assigned, the id is stable for the
    /// handle's lifetime within the stream, until the cache is cleared.
    pub fn get_or_assign_id(
        &self,
        handle: &BufferHandle,
        stream: i32,
    ) -> Result<(bool, BufferId), TrackerError> {
        let mut caches = self.caches.lock();
        let next = caches.next_id;
        let map = caches
            .maps
            .get_mut(&stream)
            .ok_or(TrackerError::UnknownStream(stream))?;
        if let Some(id) = map.get(handle) {
            return Ok((false, *id));
        }
        let id = BufferId(next);
        map.insert(handle.clone(), id);
        debug!(stream, cached = map.len(), %id, "cached newly seen buffer");
        caches.next_id += 1;
        Ok((true, id))
    }

    /// Remove one handle from a stream's cache, returning its id so the
    /// driver-side cache can be invalidated in lockstep.
    ///
    /// Returns `None` (and logs) for unknown streams or handles; the stream
    /// may already have been deleted.
    pub fn remove_one_cache(&self, stream: i32, handle: &BufferHandle) -> Option<BufferId> {
        let mut caches = self.caches.lock();
        let Some(map) = caches.maps.get_mut(&stream) else {
            info!(stream, "buffer cache already removed");
            return None;
        };
        match map.remove(handle) {
            Some(id) => {
                debug!(stream, cached = map.len(), %id, "removed one cached buffer");
                Some(id)
            }
            None => {
                warn!(stream, slot = handle.slot(), "buffer not found in cache");
                None
            }
        }
    }

    /// Clear every cached id for `stream` (the stream itself stays cached).
    /// Returns the removed ids for driver-side invalidation.
    pub fn clear_caches(&self, stream: i32) -> Vec<BufferId> {
        let mut caches = self.caches.lock();
        let Some(map) = caches.maps.get_mut(&stream) else {
            error!(stream, "no cache to clear");
            return Vec::new();
        };
        let ids: Vec<BufferId> = map.values().copied().collect();
        map.clear();
        ids
    }

    /// Compare a stream's cache with the ids the driver claims to hold.
    ///
    /// Used defensively after configuration changes; a mismatch means
    /// buffer identity can no longer be guaranteed and the session must
    /// abort rather than silently diverge.
    pub fn verify_ids(&self, stream: i32, claimed: &[BufferId]) -> bool {
        let caches = self.caches.lock();
        let Some(map) = caches.maps.get(&stream) else {
            error!(stream, "no cache to verify");
            return false;
        };
        if map.len() != claimed.len() {
            error!(
                stream,
                ours = map.len(),
                theirs = claimed.len(),
                "buffer cache size mismatch"
            );
            return false;
        }
        let mut ours: Vec<BufferId> = map.values().copied().collect();
        let mut theirs: Vec<BufferId> = claimed.to_vec();
        ours.sort_unstable();
        theirs.sort_unstable();
        for (a, b) in ours.iter().zip(theirs.iter()) {
            if a != b {
                error!(stream, ours = %a, theirs = %b, "buffer cache id mismatch");
                return false;
            }
        }
        true
    }

    /// Record a buffer sent to the driver as part of request `sequence`.
    pub fn push_inflight(&self, sequence: u64, stream: i32, handle: BufferHandle) {
        let mut inflight = self.inflight.lock();
        inflight.insert((sequence, stream), handle);
    }

    /// Reconcile a buffer on request completion. Returns `None` if no such
    /// buffer was in flight.
    pub fn pop_inflight(&self, sequence: u64, stream: i32) -> Option<BufferHandle> {
        let mut inflight = self.inflight.lock();
        inflight.remove(&(sequence, stream))
    }

    /// Drop a batch of in-flight records by key.
    pub fn pop_inflight_many(&self, keys: &[(u64, i32)]) {
        let mut inflight = self.inflight.lock();
        for key in keys {
            inflight.remove(key);
        }
    }

    /// Snapshot of (sequence, streamId) keys currently in flight.
    pub fn inflight_keys(&self) -> Vec<(u64, i32)> {
        self.inflight.lock().keys().copied().collect()
    }

    /// Record a buffer the driver acquired by id rather than by request
    /// position. A duplicate push for a live id is a driver protocol
    /// violation.
    pub fn push_inflight_request(
        &self,
        id: BufferId,
        handle: BufferHandle,
        stream: i32,
    ) -> Result<(), TrackerError> {
        let mut requested = self.requested.lock();
        if requested.contains_key(&id) {
            error!(%id, "buffer id is already in flight");
            return Err(TrackerError::DuplicateInflightId(id));
        }
        requested.insert(id, (stream, handle));
        Ok(())
    }

    /// Reconcile a driver-acquired buffer by id. Returns `None` (and logs)
    /// if the id is not in flight.
    pub fn pop_inflight_request(&self, id: BufferId) -> Option<(i32, BufferHandle)> {
        let mut requested = self.requested.lock();
        let entry = requested.remove(&id);
        if entry.is_none() {
            error!(%id, "buffer id is not in flight");
        }
        entry
    }

    /// Snapshot of buffer ids the driver currently holds.
    pub fn inflight_request_keys(&self) -> Vec<BufferId> {
        self.requested.lock().keys().copied().collect()
    }

    /// Move the request-position in-flight map out of `source`.
    ///
    /// Lock order everywhere is source first, then destination, so two
    /// concurrent reverse-direction moves cannot deadlock.
    pub fn take_inflight_map(&self, source: &BufferRecords) {
        let mut theirs = source.inflight.lock();
        let mut ours = self.inflight.lock();
        if !ours.is_empty() {
            error!(entries = ours.len(), "inflight map adopted over a non-empty state");
        }
        *ours = mem::take(&mut *theirs);
    }

    /// Move the driver-acquired in-flight map out of `source`.
    pub fn take_requested_map(&self, source: &BufferRecords) {
        let mut theirs = source.requested.lock();
        let mut ours = self.requested.lock();
        if !ours.is_empty() {
            error!(
                entries = ours.len(),
                "requested-buffer map adopted over a non-empty state"
            );
        }
        *ours = mem::take(&mut *theirs);
    }

    /// Move the id caches for `streams` out of `source`, without
    /// renumbering: ids already exchanged with the driver stay valid.
    pub fn take_caches(&self, source: &BufferRecords, streams: &[i32]) {
        let mut theirs = source.caches.lock();
        let mut ours = self.caches.lock();
        if !ours.maps.is_empty() {
            error!(streams = ours.maps.len(), "id caches adopted over a non-empty state");
        }
        for stream in streams {
            if let Some(map) = theirs.maps.remove(stream) {
                ours.maps.insert(*stream, map);
            } else {
                warn!(stream, "no cache to adopt for stream");
            }
        }
        // Continue numbering above anything the source handed out.
        ours.next_id = ours.next_id.max(theirs.next_id);
        theirs.maps.clear();
    }
}
