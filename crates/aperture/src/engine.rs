//! The request submission engine.
//!
//! A single dedicated worker owns submission: it drains the pending FIFO
//! (falling back to the repeating list), resolves each request's buffers
//! against its target streams, splices queued one-shot triggers into the
//! next outgoing request, and hands batches to the device session.
//! Callers that enqueue never block; all blocking happens on the worker.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Arc, mpsc::Sender},
    thread,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use tracing::{debug, error, info, warn};

use aperture_core::prelude::{
    EngineMetrics, Rotation, SettingTag, Settings, StreamBuffer, Trigger,
};

use crate::device::{DeviceSession, DriverBuffer, DriverRequest, SubmitStatus};
use crate::error::{EngineError, StreamError};
use crate::request::{CaptureRequest, SessionEvent};
use crate::stream::StreamRegistry;
use crate::tracker::BufferRecords;

/// Tunables of the submission engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Wait bound passed to each per-target buffer acquisition. Streams
    /// apply their own wait floor on top.
    pub buffer_wait: Duration,
    /// Budget after which an accepted-but-uncompleted request counts as
    /// stale.
    pub expected_duration: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buffer_wait: Duration::from_secs(3),
            expected_duration: Duration::from_secs(5),
        }
    }
}

/// Cooperative pause protocol of the worker.
///
/// All transitions funnel through one place so the wait/wake protocol
/// stays auditable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseState {
    /// Normal operation.
    Running,
    /// A caller asked for quiescence; the worker parks once the queue and
    /// the repeating list are empty.
    PauseRequested,
    /// The worker is parked; no submissions occur until resumed.
    Paused,
}

/// Snapshot of the most recently accepted request, for status queries.
#[derive(Debug, Clone)]
pub struct LatestRequest {
    pub sequence: u64,
    pub request_id: Option<i64>,
    /// Settings as submitted (triggers included).
    pub settings: Settings,
}

struct QueuedRequest {
    sequence: u64,
    request: CaptureRequest,
    repeating: bool,
}

struct EngineState {
    fifo: VecDeque<QueuedRequest>,
    repeating: Vec<CaptureRequest>,
    /// Next sequence number to assign; session-scoped.
    next_sequence: u64,
    last_submitted: Option<u64>,
    repeating_last: Option<u64>,
    pause: PauseState,
    /// Worker is mid-iteration (batch popped but not yet finished).
    busy: bool,
    exiting: bool,
    fatal: bool,
}

pub(crate) struct EngineShared {
    device: Mutex<Arc<dyn DeviceSession>>,
    streams: Arc<StreamRegistry>,
    records: Arc<BufferRecords>,
    state: Mutex<EngineState>,
    /// Wakes the worker (new work, pause transitions, shutdown).
    work_cv: Condvar,
    /// Wakes observers of the pause state.
    pause_cv: Condvar,
    /// Wakes observers of submission/drain progress.
    progress_cv: Condvar,
    triggers: Mutex<BTreeMap<SettingTag, Trigger>>,
    latest: Mutex<Option<LatestRequest>>,
    /// sequence → completion deadline, for stale-request detection.
    expected: Mutex<HashMap<u64, Instant>>,
    events: Sender<SessionEvent>,
    metrics: EngineMetrics,
    config: EngineConfig,
}

/// Handle to the submission worker.
///
/// Dropping the engine shuts the worker down after its current iteration;
/// queued requests are reported as cancelled, never submitted.
pub struct RequestEngine {
    shared: Arc<EngineShared>,
    worker: Option<thread::JoinHandle<()>>,
}

impl RequestEngine {
    /// Spawn the submission worker with default tunables.
    pub fn new(
        device: Arc<dyn DeviceSession>,
        streams: Arc<StreamRegistry>,
        records: Arc<BufferRecords>,
        events: Sender<SessionEvent>,
    ) -> Self {
        Self::with_config(device, streams, records, events, EngineConfig::default())
    }

    /// Spawn the submission worker with explicit tunables.
    pub fn with_config(
        device: Arc<dyn DeviceSession>,
        streams: Arc<StreamRegistry>,
        records: Arc<BufferRecords>,
        events: Sender<SessionEvent>,
        config: EngineConfig,
    ) -> Self {
        let shared = Arc::new(EngineShared {
            device: Mutex::new(device),
            streams,
            records,
            state: Mutex::new(EngineState {
                fifo: VecDeque::new(),
                repeating: Vec::new(),
                next_sequence: 0,
                last_submitted: None,
                repeating_last: None,
                pause: PauseState::Running,
                busy: false,
                exiting: false,
                fatal: false,
            }),
            work_cv: Condvar::new(),
            pause_cv: Condvar::new(),
            progress_cv: Condvar::new(),
            triggers: Mutex::new(BTreeMap::new()),
            latest: Mutex::new(None),
            expected: Mutex::new(HashMap::new()),
            events,
            metrics: EngineMetrics::default(),
            config,
        });
        let worker = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("aperture-request".into())
                .spawn(move || shared.run())
                .expect("spawn request worker")
        };
        Self {
            shared,
            worker: Some(worker),
        }
    }

    pub(crate) fn shared(&self) -> Arc<EngineShared> {
        self.shared.clone()
    }

    /// Enqueue a single request. Never blocks; returns the sequence number
    /// the request will be submitted under.
    pub fn submit(&self, request: CaptureRequest) -> Result<u64, EngineError> {
        self.shared.submit_many(vec![request])
    }

    /// Enqueue a list of requests contiguously. Returns the sequence
    /// number of the last one.
    pub fn submit_many(&self, requests: Vec<CaptureRequest>) -> Result<u64, EngineError> {
        self.shared.submit_many(requests)
    }

    /// Replace the repeating list with one template. Returns the sequence
    /// number the first automatic copy is expected to be submitted under.
    pub fn submit_repeating(&self, request: CaptureRequest) -> Result<u64, EngineError> {
        self.shared.submit_repeating(vec![request])
    }

    /// Replace the repeating list with several templates.
    pub fn submit_repeating_list(&self, requests: Vec<CaptureRequest>) -> Result<u64, EngineError> {
        self.shared.submit_repeating(requests)
    }

    /// Drop the repeating list. Returns the last sequence number a
    /// repeating copy was actually submitted under, for wait-until-done
    /// semantics upstream.
    pub fn clear_repeating(&self) -> Option<u64> {
        self.shared.clear_repeating()
    }

    /// Drop all queued and repeating requests plus pending triggers.
    /// Queued requests are reported as cancelled. Returns the last
    /// submitted sequence number.
    pub fn clear(&self) -> Option<u64> {
        self.shared.clear()
    }

    /// Clear the local queue, then ask the driver to drain its in-flight
    /// requests. Returns the last submitted sequence number.
    pub fn flush(&self) -> Option<u64> {
        let last = self.shared.clear();
        let device = self.shared.device.lock().clone();
        device.flush();
        last
    }

    /// Queue one-shot triggers for the next outgoing request.
    pub fn queue_triggers(&self, triggers: &[Trigger]) {
        self.shared.queue_triggers(triggers);
    }

    /// Ask the worker to quiesce once the queue and repeating list are
    /// empty. Does not block; use [`RequestEngine::wait_until_paused`].
    pub fn pause(&self) {
        self.shared.request_pause();
    }

    /// Resume a paused worker.
    pub fn resume(&self) {
        self.shared.resume();
    }

    /// Block until the worker is parked or the timeout expires.
    pub fn wait_until_paused(&self, timeout: Duration) -> bool {
        self.shared.wait_until_paused(timeout)
    }

    /// Block until all explicitly queued requests have left the queue and
    /// the worker is between iterations.
    pub fn wait_until_drained(&self, timeout: Duration) -> bool {
        self.shared.wait_until_drained(timeout)
    }

    /// Block until the request with `sequence` has been submitted.
    pub fn wait_until_submitted(&self, sequence: u64, timeout: Duration) -> bool {
        self.shared.wait_until_submitted(sequence, timeout)
    }

    /// Snapshot of the most recently accepted request.
    pub fn latest_request(&self) -> Option<LatestRequest> {
        self.shared.latest.lock().clone()
    }

    /// Sequence numbers of accepted requests past their completion
    /// deadline.
    pub fn stale_requests(&self) -> Vec<u64> {
        let now = Instant::now();
        self.shared
            .expected
            .lock()
            .iter()
            .filter(|(_, deadline)| now > **deadline)
            .map(|(sequence, _)| *sequence)
            .collect()
    }

    /// Mark a request completed, retiring its stale-detection deadline.
    pub fn complete(&self, sequence: u64) {
        self.shared.complete(sequence);
    }

    /// Swap the backing device session. In-flight bookkeeping is
    /// untouched; buffer ids stay valid.
    pub fn set_device(&self, device: Arc<dyn DeviceSession>) {
        *self.shared.device.lock() = device;
    }

    /// Stop accepting work after a fatal driver error.
    pub fn set_fatal(&self) {
        self.shared.set_fatal();
    }

    /// Submission counters.
    pub fn metrics(&self) -> EngineMetrics {
        self.shared.metrics.clone()
    }

    /// Signal the worker to exit after its current iteration and join it.
    /// Queued requests are drained as cancelled.
    pub fn shutdown(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.exiting = true;
            self.shared.work_cv.notify_all();
            self.shared.pause_cv.notify_all();
            self.shared.progress_cv.notify_all();
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for RequestEngine {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.shutdown();
        }
    }
}

impl EngineShared {
    fn submit_many(&self, requests: Vec<CaptureRequest>) -> Result<u64, EngineError> {
        if requests.is_empty() {
            return Err(EngineError::SubmissionRejected("empty request list".into()));
        }
        let mut state = self.state.lock();
        if state.exiting {
            return Err(EngineError::ShuttingDown);
        }
        if state.fatal {
            return Err(EngineError::DeviceFatal);
        }
        let mut last = 0;
        for request in requests {
            let sequence = state.next_sequence;
            state.next_sequence += 1;
            last = sequence;
            state.fifo.push_back(QueuedRequest {
                sequence,
                request,
                repeating: false,
            });
        }
        self.work_cv.notify_all();
        Ok(last)
    }

    fn submit_repeating(&self, requests: Vec<CaptureRequest>) -> Result<u64, EngineError> {
        if requests.is_empty() {
            return Err(EngineError::SubmissionRejected(
                "empty repeating request list".into(),
            ));
        }
        let mut state = self.state.lock();
        if state.exiting {
            return Err(EngineError::ShuttingDown);
        }
        if state.fatal {
            return Err(EngineError::DeviceFatal);
        }
        state.repeating = requests;
        // Queued entries already carry their sequence numbers, so the
        // first automatic copy gets the next one (barring a racing
        // submit, which only pushes the prediction later).
        let predicted = state.next_sequence;
        self.work_cv.notify_all();
        Ok(predicted)
    }

    fn clear_repeating(&self) -> Option<u64> {
        let mut state = self.state.lock();
        state.repeating.clear();
        state.repeating_last
    }

    fn clear(&self) -> Option<u64> {
        let (last, cancelled) = {
            let mut state = self.state.lock();
            state.repeating.clear();
            let cancelled: Vec<QueuedRequest> = state.fifo.drain(..).collect();
            self.progress_cv.notify_all();
            (state.last_submitted, cancelled)
        };
        self.triggers.lock().clear();
        for queued in cancelled {
            self.send_event(SessionEvent::RequestCancelled {
                sequence: queued.sequence,
                request_id: queued.request.settings.request_id(),
            });
        }
        last
    }

    fn queue_triggers(&self, triggers: &[Trigger]) {
        let mut pending = self.triggers.lock();
        for trigger in triggers {
            pending.insert(trigger.tag, trigger.clone());
        }
    }

    fn request_pause(&self) {
        let mut state = self.state.lock();
        if state.pause == PauseState::Running {
            self.set_pause_locked(&mut state, PauseState::PauseRequested);
        }
    }

    fn resume(&self) {
        let mut state = self.state.lock();
        if state.pause != PauseState::Running {
            self.set_pause_locked(&mut state, PauseState::Running);
        }
    }

    /// The single funnel for pause transitions.
    fn set_pause_locked(&self, state: &mut EngineState, to: PauseState) {
        debug!(from = ?state.pause, to = ?to, "pause transition");
        state.pause = to;
        self.work_cv.notify_all();
        self.pause_cv.notify_all();
    }

    pub(crate) fn device_handle(&self) -> Arc<dyn DeviceSession> {
        self.device.lock().clone()
    }

    pub(crate) fn set_fatal(&self) {
        let mut state = self.state.lock();
        if !state.fatal {
            warn!("entering fatal state; no further submissions accepted");
            state.fatal = true;
        }
    }

    pub(crate) fn complete(&self, sequence: u64) {
        self.expected.lock().remove(&sequence);
    }

    fn wait_until_paused(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.pause == PauseState::Paused {
                return true;
            }
            if state.exiting {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.pause_cv.wait_for(&mut state, deadline - now);
        }
    }

    fn wait_until_drained(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.fifo.is_empty() && !state.busy {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.progress_cv.wait_for(&mut state, deadline - now);
        }
    }

    fn wait_until_submitted(&self, sequence: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.last_submitted.is_some_and(|last| last >= sequence) {
                return true;
            }
            if state.exiting {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.progress_cv.wait_for(&mut state, deadline - now);
        }
    }

    fn send_event(&self, event: SessionEvent) {
        // The application may have dropped its receiver; that is its
        // prerogative.
        let _ = self.events.send(event);
    }

    fn run(self: Arc<Self>) {
        info!("request worker started");
        while let Some(batch) = self.wait_for_next_batch() {
            self.process_batch(batch);
        }
        self.drain_cancelled();
        info!("request worker exited");
    }

    /// Pop the next batch to submit, or park while paused/idle. Returns
    /// `None` on shutdown.
    fn wait_for_next_batch(&self) -> Option<Vec<QueuedRequest>> {
        let mut state = self.state.lock();
        loop {
            if state.exiting {
                return None;
            }

            if state.pause == PauseState::PauseRequested
                && state.fifo.is_empty()
                && state.repeating.is_empty()
            {
                self.set_pause_locked(&mut state, PauseState::Paused);
            }
            if state.pause == PauseState::Paused {
                // Parked: enqueues accumulate; only resume or shutdown
                // wake us into action.
                self.work_cv.wait(&mut state);
                continue;
            }

            if let Some(first) = state.fifo.pop_front() {
                let extra = first.request.batch_size.saturating_sub(1);
                let mut batch = Vec::with_capacity(1 + extra);
                batch.push(first);
                for _ in 0..extra {
                    match state.fifo.pop_front() {
                        Some(next) => batch.push(next),
                        None => break,
                    }
                }
                state.busy = true;
                return Some(batch);
            }

            if !state.repeating.is_empty() {
                let mut batch = Vec::with_capacity(state.repeating.len());
                for index in 0..state.repeating.len() {
                    let request = state.repeating[index].clone();
                    let sequence = state.next_sequence;
                    state.next_sequence += 1;
                    batch.push(QueuedRequest {
                        sequence,
                        request,
                        repeating: true,
                    });
                }
                state.busy = true;
                return Some(batch);
            }

            self.work_cv.wait(&mut state);
        }
    }

    fn process_batch(&self, batch: Vec<QueuedRequest>) {
        // One-shot triggers bind to the first request built this
        // iteration and never persist.
        let triggers: Vec<Trigger> = {
            let mut pending = self.triggers.lock();
            let drained = pending.values().cloned().collect();
            pending.clear();
            drained
        };

        let mut events: Vec<SessionEvent> = Vec::new();
        let mut built: Vec<(QueuedRequest, DriverRequest)> = Vec::new();
        let mut repeating_abandoned = false;

        for (index, queued) in batch.into_iter().enumerate() {
            let mut settings = queued.request.settings.clone();
            if index == 0 {
                for trigger in &triggers {
                    let prior = settings.insert(trigger.tag, trigger.value.clone());
                    debug!(tag = %trigger.tag, replaced = prior.is_some(), "spliced trigger");
                }
            }
            match self.resolve_buffers(&queued) {
                Ok(buffers) => {
                    let driver = DriverRequest {
                        sequence: queued.sequence,
                        settings,
                        buffers,
                    };
                    built.push((queued, driver));
                }
                Err(error) => {
                    if matches!(error, EngineError::Stream(StreamError::Abandoned { .. })) {
                        repeating_abandoned = true;
                    }
                    self.metrics.failed();
                    events.push(SessionEvent::RequestFailed {
                        sequence: queued.sequence,
                        request_id: queued.request.settings.request_id(),
                        error,
                    });
                }
            }
        }

        if repeating_abandoned {
            // A target of the repeating set is gone; stop resubmitting it.
            let mut state = self.state.lock();
            if !state.repeating.is_empty() {
                warn!("stopping repeating requests targeting an abandoned stream");
                state.repeating.clear();
            }
        }

        if built.is_empty() {
            self.finish_iteration(events);
            return;
        }

        let device = self.device.lock().clone();
        let requests: Vec<DriverRequest> =
            built.iter().map(|(_, driver)| driver.clone()).collect();
        let mut statuses = device.submit_batch(&requests);
        self.metrics.batch();
        if statuses.len() < built.len() {
            error!(
                expected = built.len(),
                got = statuses.len(),
                "driver returned a short status list; treating the tail as rejected"
            );
            statuses.resize(
                built.len(),
                SubmitStatus::Rejected("missing submission status".into()),
            );
        }

        let now = Instant::now();
        let mut rejected: Vec<(QueuedRequest, DriverRequest, String)> = Vec::new();
        {
            let mut state = self.state.lock();
            for ((queued, driver), status) in built.into_iter().zip(statuses) {
                match status {
                    SubmitStatus::Accepted => {
                        state.last_submitted = Some(driver.sequence);
                        if queued.repeating {
                            state.repeating_last = Some(driver.sequence);
                        }
                        self.metrics.submitted();
                        self.expected
                            .lock()
                            .insert(driver.sequence, now + self.config.expected_duration);
                        *self.latest.lock() = Some(LatestRequest {
                            sequence: driver.sequence,
                            request_id: driver.settings.request_id(),
                            settings: driver.settings.clone(),
                        });
                        events.push(SessionEvent::RequestSubmitted {
                            sequence: driver.sequence,
                            request_id: driver.settings.request_id(),
                        });
                    }
                    SubmitStatus::Rejected(reason) => {
                        rejected.push((queued, driver, reason));
                    }
                }
            }
            self.progress_cv.notify_all();
        }

        for (queued, driver, reason) in rejected {
            warn!(sequence = driver.sequence, reason = %reason, "driver rejected request");
            self.unwind_submitted(&driver);
            self.metrics.failed();
            events.push(SessionEvent::RequestFailed {
                sequence: driver.sequence,
                request_id: queued.request.settings.request_id(),
                error: EngineError::SubmissionRejected(reason),
            });
        }

        self.finish_iteration(events);
    }

    /// Acquire one buffer per target, registering each as in flight. On
    /// failure, everything already acquired for this request is returned
    /// in error status; the rest of the batch is unaffected.
    fn resolve_buffers(
        &self,
        queued: &QueuedRequest,
    ) -> Result<SmallVec<[DriverBuffer; 4]>, EngineError> {
        let mut acquired: Vec<(i32, Arc<crate::stream::Stream>)> = Vec::new();
        let mut buffers: SmallVec<[DriverBuffer; 4]> = SmallVec::new();
        let mut failure: Option<EngineError> = None;

        for target in &queued.request.targets {
            let Some(stream) = self.streams.get(target.stream_id) else {
                failure = Some(EngineError::Stream(StreamError::Abandoned {
                    stream: target.stream_id,
                }));
                break;
            };
            let buffer = match stream.get_buffer(self.config.buffer_wait) {
                Ok(buffer) => buffer,
                Err(error) => {
                    failure = Some(EngineError::Stream(error));
                    break;
                }
            };
            let handle = buffer.handle;
            self.records
                .push_inflight(queued.sequence, target.stream_id, handle.clone());
            acquired.push((target.stream_id, stream));
            let (is_new, buffer_id) =
                match self.records.get_or_assign_id(&handle, target.stream_id) {
                    Ok(assigned) => assigned,
                    Err(error) => {
                        failure = Some(EngineError::Stream(StreamError::ConfigurationRejected {
                            stream: target.stream_id,
                            reason: error.to_string(),
                        }));
                        break;
                    }
                };
            buffers.push(DriverBuffer {
                stream_id: target.stream_id,
                buffer_id,
                handle: is_new.then_some(handle),
            });
        }

        match failure {
            None => Ok(buffers),
            Some(error) => {
                for (stream_id, stream) in acquired {
                    if let Some(handle) = self.records.pop_inflight(queued.sequence, stream_id) {
                        let _ = stream.return_buffer(
                            StreamBuffer::error(handle),
                            0,
                            Rotation::Deg0,
                            false,
                        );
                    }
                }
                Err(error)
            }
        }
    }

    /// Return the buffers of a driver-rejected request to their streams in
    /// error status.
    fn unwind_submitted(&self, driver: &DriverRequest) {
        for buffer in &driver.buffers {
            let Some(handle) = self.records.pop_inflight(driver.sequence, buffer.stream_id) else {
                continue;
            };
            let Some(stream) = self.streams.get(buffer.stream_id) else {
                warn!(
                    stream = buffer.stream_id,
                    "stream vanished while unwinding a rejected request"
                );
                continue;
            };
            let _ = stream.return_buffer(StreamBuffer::error(handle), 0, Rotation::Deg0, false);
        }
    }

    fn finish_iteration(&self, events: Vec<SessionEvent>) {
        // Deliver notifications before reporting the iteration finished,
        // so a drained observer never races ahead of its events.
        for event in events {
            self.send_event(event);
        }
        let mut state = self.state.lock();
        state.busy = false;
        self.progress_cv.notify_all();
    }

    fn drain_cancelled(&self) {
        let cancelled: Vec<QueuedRequest> = {
            let mut state = self.state.lock();
            state.busy = false;
            state.repeating.clear();
            let drained = state.fifo.drain(..).collect();
            self.progress_cv.notify_all();
            self.pause_cv.notify_all();
            drained
        };
        for queued in cancelled {
            debug!(sequence = queued.sequence, "cancelling queued request at shutdown");
            self.send_event(SessionEvent::RequestCancelled {
                sequence: queued.sequence,
                request_id: queued.request.settings.request_id(),
            });
        }
    }
}
