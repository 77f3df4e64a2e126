//! Consumer/producer endpoints a stream exchanges buffers with.
//!
//! An endpoint owns the actual buffer allocations; the stream only tracks
//! which of them are on loan. `FifoEndpoint` is the in-memory
//! implementation used by tests, examples, and loopback sessions.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;
use tracing::{debug, warn};

use aperture_core::prelude::{BufferHandle, Rotation, StreamBuffer, usage};

use crate::stream::StreamConfig;

/// Errors reported by an endpoint.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EndpointError {
    /// The consumer side is gone; the endpoint will never accept or produce
    /// buffers again.
    #[error("endpoint is disconnected")]
    Disconnected,
    /// No free buffer is currently available.
    #[error("no free buffer available")]
    Starved,
    /// The endpoint rejected the requested configuration.
    #[error("endpoint rejected the configuration: {0}")]
    Rejected(String),
}

/// Buffer queue endpoint a stream is bound to.
///
/// Implementations hand out free buffers (`dequeue`), accept filled buffers
/// for the consumer (`enqueue`), and reallocate their backing pool on
/// `configure`. Buffers enqueued in error status are recycled to the free
/// pool rather than delivered; consumers never observe invalid frames.
pub trait BufferEndpoint: Send + Sync {
    /// Usage bits requested by the consumer side, merged into the stream's
    /// configuration during `start_configuration`.
    fn usage(&self) -> Result<u64, EndpointError>;

    /// Allocate (or reallocate) the backing buffer pool for `config`.
    fn configure(&self, config: &StreamConfig) -> Result<(), EndpointError>;

    /// Hand out a free buffer.
    fn dequeue(&self) -> Result<BufferHandle, EndpointError>;

    /// Accept a filled (or cancelled) buffer back from the pipeline.
    fn enqueue(
        &self,
        buffer: StreamBuffer,
        timestamp: u64,
        transform: Rotation,
    ) -> Result<(), EndpointError>;

    /// Drop the free pool; buffers already delivered or on loan drain
    /// naturally when released.
    fn disconnect(&self) -> Result<(), EndpointError>;

    /// Total number of buffers the endpoint can circulate; used to clamp
    /// preparation.
    fn buffer_count(&self) -> usize;

    /// Permanently remove one buffer from circulation (consumer-side
    /// detach). Unknown handles are ignored.
    fn detach(&self, handle: &BufferHandle) -> Result<(), EndpointError> {
        let _ = handle;
        Ok(())
    }
}

/// A frame delivered to the consumer side of a [`FifoEndpoint`].
#[derive(Debug, Clone)]
pub struct DeliveredBuffer {
    /// The buffer and its status (always `Ok`; error buffers are recycled).
    pub buffer: StreamBuffer,
    /// Capture timestamp in nanoseconds.
    pub timestamp: u64,
    /// Presentation transform requested by the producer.
    pub transform: Rotation,
}

/// Result of polling the consumer side of a [`FifoEndpoint`].
#[derive(Debug)]
pub enum ConsumerRecv {
    /// A delivered frame.
    Frame(DeliveredBuffer),
    /// Nothing queued right now.
    Empty,
    /// The endpoint has been abandoned.
    Disconnected,
}

struct FifoState {
    /// Handles belonging to the current allocation generation. Stale
    /// handles from before a reconfigure are dropped on release.
    current: Vec<BufferHandle>,
    free: Vec<BufferHandle>,
    connected: bool,
    chunk: usize,
}

struct Shared {
    depth: usize,
    consumer_usage: u64,
    state: Mutex<FifoState>,
    delivered: ArrayQueue<DeliveredBuffer>,
    abandoned: AtomicBool,
    dropped: AtomicU64,
}

/// In-memory buffer endpoint: a free list of `depth` buffers plus a bounded
/// delivery queue toward the consumer.
///
/// # Example
/// ```rust
/// use aperture::prelude::*;
///
/// let endpoint = FifoEndpoint::new(4);
/// let config = StreamConfig::output(
///     Resolution::new(640, 480).unwrap(),
///     FourCc::new(*b"NV12"),
/// );
/// endpoint.configure(&config).unwrap();
/// let handle = endpoint.dequeue().unwrap();
/// endpoint
///     .enqueue(StreamBuffer::ok(handle), 1, Rotation::Deg0)
///     .unwrap();
/// let consumer = endpoint.consumer();
/// assert!(matches!(consumer.recv(), ConsumerRecv::Frame(_)));
/// ```
pub struct FifoEndpoint {
    shared: Arc<Shared>,
}

impl FifoEndpoint {
    /// Endpoint circulating at most `depth` buffers, with default consumer
    /// usage (CPU read + composer) and a delivery queue as deep as the pool.
    pub fn new(depth: usize) -> Self {
        Self::with_limits(depth, depth, usage::CPU_READ | usage::COMPOSER)
    }

    /// Endpoint with an explicit delivery-queue depth and consumer usage.
    ///
    /// A `queue_depth` smaller than `depth` makes the endpoint lossy: when
    /// the consumer falls behind, the oldest undelivered frame is evicted
    /// and its buffer recycled (latest-frame preview behavior).
    pub fn with_limits(depth: usize, queue_depth: usize, consumer_usage: u64) -> Self {
        let depth = depth.max(1);
        Self {
            shared: Arc::new(Shared {
                depth,
                consumer_usage,
                state: Mutex::new(FifoState {
                    current: Vec::new(),
                    free: Vec::new(),
                    connected: false,
                    chunk: 0,
                }),
                delivered: ArrayQueue::new(queue_depth.clamp(1, depth)),
                abandoned: AtomicBool::new(false),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Consumer-side handle for receiving delivered frames and releasing
    /// buffers back into circulation.
    pub fn consumer(&self) -> ConsumerQueue {
        ConsumerQueue {
            shared: self.shared.clone(),
        }
    }

    /// Simulate the consumer going away; all further endpoint operations
    /// fail with [`EndpointError::Disconnected`].
    pub fn abandon(&self) {
        self.shared.abandoned.store(true, Ordering::Release);
    }

    /// Frames dropped because the consumer fell behind.
    pub fn dropped_frames(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    fn check_alive(&self) -> Result<(), EndpointError> {
        if self.shared.abandoned.load(Ordering::Acquire) {
            Err(EndpointError::Disconnected)
        } else {
            Ok(())
        }
    }
}

impl BufferEndpoint for FifoEndpoint {
    fn usage(&self) -> Result<u64, EndpointError> {
        self.check_alive()?;
        Ok(self.shared.consumer_usage)
    }

    fn configure(&self, config: &StreamConfig) -> Result<(), EndpointError> {
        self.check_alive()?;
        if config.max_buffers > self.shared.depth {
            return Err(EndpointError::Rejected(format!(
                "stream wants {} outstanding buffers but the endpoint holds {}",
                config.max_buffers, self.shared.depth
            )));
        }
        let chunk = if config.format.is_opaque() {
            config.max_size
        } else {
            // Generous packed-RGBA estimate; endpoints backed by real
            // allocators derive this from the format instead.
            config.resolution.area() as usize * 4
        };
        let mut state = self.shared.state.lock();
        let handles: Vec<BufferHandle> = (0..self.shared.depth)
            .map(|slot| BufferHandle::new(slot, chunk))
            .collect();
        state.current = handles.clone();
        state.free = handles;
        state.connected = true;
        state.chunk = chunk;
        debug!(
            depth = self.shared.depth,
            chunk, "fifo endpoint (re)allocated buffer pool"
        );
        Ok(())
    }

    fn dequeue(&self) -> Result<BufferHandle, EndpointError> {
        self.check_alive()?;
        let mut state = self.shared.state.lock();
        if !state.connected {
            return Err(EndpointError::Disconnected);
        }
        state.free.pop().ok_or(EndpointError::Starved)
    }

    fn enqueue(
        &self,
        buffer: StreamBuffer,
        timestamp: u64,
        transform: Rotation,
    ) -> Result<(), EndpointError> {
        self.check_alive()?;
        let mut state = self.shared.state.lock();
        if !state.current.contains(&buffer.handle) {
            // Stale generation: the pool was reallocated while this buffer
            // was on loan. It drains here.
            debug!(slot = buffer.handle.slot(), "dropping stale-generation buffer");
            return Ok(());
        }
        if buffer.status.is_error() {
            // Cancelled buffers go straight back to the free pool; the
            // consumer never sees invalid frames.
            state.free.push(buffer.handle);
            return Ok(());
        }
        let mut frame = DeliveredBuffer {
            buffer,
            timestamp,
            transform,
        };
        while let Err(rejected) = self.shared.delivered.push(frame) {
            // Consumer is behind: evict the oldest delivered frame and
            // recycle its buffer.
            if let Some(evicted) = self.shared.delivered.pop() {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                if state.current.contains(&evicted.buffer.handle) {
                    state.free.push(evicted.buffer.handle);
                }
            }
            frame = rejected;
        }
        Ok(())
    }

    fn disconnect(&self) -> Result<(), EndpointError> {
        let mut state = self.shared.state.lock();
        let freed: Vec<BufferHandle> = state.free.drain(..).collect();
        state.current.retain(|handle| !freed.contains(handle));
        state.connected = false;
        debug!(freed = freed.len(), "fifo endpoint disconnected");
        Ok(())
    }

    fn buffer_count(&self) -> usize {
        self.shared.depth
    }

    fn detach(&self, handle: &BufferHandle) -> Result<(), EndpointError> {
        let mut state = self.shared.state.lock();
        let known = state.current.iter().any(|h| h == handle);
        if !known {
            warn!(slot = handle.slot(), "detach of unknown buffer ignored");
            return Ok(());
        }
        state.current.retain(|h| h != handle);
        state.free.retain(|h| h != handle);
        Ok(())
    }
}

/// Consumer-side handle of a [`FifoEndpoint`].
#[derive(Clone)]
pub struct ConsumerQueue {
    shared: Arc<Shared>,
}

impl ConsumerQueue {
    /// Poll for the next delivered frame.
    pub fn recv(&self) -> ConsumerRecv {
        match self.shared.delivered.pop() {
            Some(frame) => ConsumerRecv::Frame(frame),
            None => {
                if self.shared.abandoned.load(Ordering::Acquire) {
                    ConsumerRecv::Disconnected
                } else {
                    ConsumerRecv::Empty
                }
            }
        }
    }

    /// Release a consumed frame's buffer back into circulation.
    pub fn release(&self, frame: DeliveredBuffer) {
        self.release_handle(frame.buffer.handle);
    }

    /// Release a buffer by handle. Handles from a previous allocation
    /// generation are dropped.
    pub fn release_handle(&self, handle: BufferHandle) {
        let mut state = self.shared.state.lock();
        if state.current.contains(&handle) {
            state.free.push(handle);
        }
    }

    /// Number of frames waiting to be consumed.
    pub fn pending(&self) -> usize {
        self.shared.delivered.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aperture_core::prelude::{FourCc, Resolution};

    fn config(max_buffers: usize) -> StreamConfig {
        StreamConfig::output(Resolution::new(64, 64).unwrap(), FourCc::new(*b"NV12"))
            .with_max_buffers(max_buffers)
    }

    #[test]
    fn configure_fills_free_pool() {
        let endpoint = FifoEndpoint::new(3);
        endpoint.configure(&config(2)).expect("configure");
        for _ in 0..3 {
            endpoint.dequeue().expect("free buffer");
        }
        assert_eq!(endpoint.dequeue(), Err(EndpointError::Starved));
    }

    #[test]
    fn rejects_config_larger_than_depth() {
        let endpoint = FifoEndpoint::new(2);
        let err = endpoint.configure(&config(5)).unwrap_err();
        assert!(matches!(err, EndpointError::Rejected(_)));
    }

    #[test]
    fn error_buffers_recycle_without_delivery() {
        let endpoint = FifoEndpoint::new(2);
        endpoint.configure(&config(2)).expect("configure");
        let handle = endpoint.dequeue().expect("buffer");
        endpoint
            .enqueue(StreamBuffer::error(handle), 0, Rotation::Deg0)
            .expect("enqueue");
        let consumer = endpoint.consumer();
        assert!(matches!(consumer.recv(), ConsumerRecv::Empty));
        // Both buffers are free again.
        endpoint.dequeue().expect("first");
        endpoint.dequeue().expect("second");
    }

    #[test]
    fn delivery_and_release_roundtrip() {
        let endpoint = FifoEndpoint::new(2);
        endpoint.configure(&config(2)).expect("configure");
        let consumer = endpoint.consumer();
        let handle = endpoint.dequeue().expect("buffer");
        endpoint
            .enqueue(StreamBuffer::ok(handle.clone()), 7, Rotation::Deg90)
            .expect("enqueue");
        let ConsumerRecv::Frame(frame) = consumer.recv() else {
            panic!("expected a frame");
        };
        assert_eq!(frame.timestamp, 7);
        assert_eq!(frame.buffer.handle, handle);
        consumer.release(frame);
        // Released buffer circulates again.
        let again = endpoint.dequeue().expect("buffer");
        let _ = again;
    }

    #[test]
    fn slow_consumer_drops_oldest() {
        let endpoint = FifoEndpoint::with_limits(2, 1, usage::CPU_READ);
        endpoint.configure(&config(1)).expect("configure");
        let first = endpoint.dequeue().expect("buffer");
        endpoint
            .enqueue(StreamBuffer::ok(first.clone()), 1, Rotation::Deg0)
            .expect("enqueue");
        let second = endpoint.dequeue().expect("buffer");
        endpoint
            .enqueue(StreamBuffer::ok(second), 2, Rotation::Deg0)
            .expect("enqueue");
        assert_eq!(endpoint.dropped_frames(), 1);
        let consumer = endpoint.consumer();
        let ConsumerRecv::Frame(frame) = consumer.recv() else {
            panic!("expected a frame");
        };
        assert_eq!(frame.timestamp, 2);
        // The evicted frame's buffer went back into circulation.
        let recycled = endpoint.dequeue().expect("recycled");
        assert_eq!(recycled, first);
    }

    #[test]
    fn abandoned_endpoint_fails_everything() {
        let endpoint = FifoEndpoint::new(2);
        endpoint.configure(&config(2)).expect("configure");
        endpoint.abandon();
        assert_eq!(endpoint.usage(), Err(EndpointError::Disconnected));
        assert_eq!(endpoint.dequeue(), Err(EndpointError::Disconnected));
        assert!(matches!(
            endpoint.consumer().recv(),
            ConsumerRecv::Disconnected
        ));
    }

    #[test]
    fn stale_generation_buffers_drain_silently() {
        let endpoint = FifoEndpoint::new(2);
        endpoint.configure(&config(2)).expect("configure");
        let old = endpoint.dequeue().expect("buffer");
        endpoint.configure(&config(2)).expect("reconfigure");
        endpoint
            .enqueue(StreamBuffer::ok(old), 1, Rotation::Deg0)
            .expect("stale return accepted");
        assert!(matches!(endpoint.consumer().recv(), ConsumerRecv::Empty));
    }
}
