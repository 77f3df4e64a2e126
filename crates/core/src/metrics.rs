use std::sync::atomic::{AtomicU64, Ordering};

/// Lightweight counters for a stream's buffer traffic.
///
/// # Example
/// ```rust
/// use aperture_core::metrics::StreamMetrics;
///
/// let metrics = StreamMetrics::default();
/// metrics.acquire();
/// assert_eq!(metrics.acquires(), 1);
/// ```
#[derive(Debug, Default)]
pub struct StreamMetrics {
    acquires: AtomicU64,
    returns: AtomicU64,
    timeouts: AtomicU64,
    limit_waits: AtomicU64,
}

impl StreamMetrics {
    /// Record a buffer handed out to the pipeline.
    pub fn acquire(&self) {
        self.acquires.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a buffer returned by the pipeline.
    pub fn ret(&self) {
        self.returns.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a wait that expired before a buffer came back.
    pub fn timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a wait entered because the stream was at its buffer limit.
    pub fn limit_wait(&self) {
        self.limit_waits.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot of acquired buffers.
    pub fn acquires(&self) -> u64 {
        self.acquires.load(Ordering::Relaxed)
    }

    /// Snapshot of returned buffers.
    pub fn returns(&self) -> u64 {
        self.returns.load(Ordering::Relaxed)
    }

    /// Snapshot of expired waits.
    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    /// Snapshot of limit-bound waits.
    pub fn limit_waits(&self) -> u64 {
        self.limit_waits.load(Ordering::Relaxed)
    }
}

impl Clone for StreamMetrics {
    fn clone(&self) -> Self {
        let cloned = StreamMetrics::default();
        cloned.acquires.store(self.acquires(), Ordering::Relaxed);
        cloned.returns.store(self.returns(), Ordering::Relaxed);
        cloned.timeouts.store(self.timeouts(), Ordering::Relaxed);
        cloned
            .limit_waits
            .store(self.limit_waits(), Ordering::Relaxed);
        cloned
    }
}

/// Counters for the request submission engine.
///
/// # Example
/// ```rust
/// use aperture_core::metrics::EngineMetrics;
///
/// let metrics = EngineMetrics::default();
/// metrics.submitted();
/// assert_eq!(metrics.submitted_count(), 1);
/// ```
#[derive(Debug, Default)]
pub struct EngineMetrics {
    submitted: AtomicU64,
    failed: AtomicU64,
    batches: AtomicU64,
}

impl EngineMetrics {
    /// Record one request accepted by the driver.
    pub fn submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one request that failed before or at submission.
    pub fn failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one batch handed to the driver.
    pub fn batch(&self) {
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot of accepted requests.
    pub fn submitted_count(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    /// Snapshot of failed requests.
    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Snapshot of submitted batches.
    pub fn batch_count(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }
}

impl Clone for EngineMetrics {
    fn clone(&self) -> Self {
        let cloned = EngineMetrics::default();
        cloned.submitted.store(self.submitted_count(), Ordering::Relaxed);
        cloned.failed.store(self.failed_count(), Ordering::Relaxed);
        cloned.batches.store(self.batch_count(), Ordering::Relaxed);
        cloned
    }
}
