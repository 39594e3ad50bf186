//! Frame ring: N-deep per-frame state the host may only overwrite once the accelerator
//! has finished with it.
//!
//! A counting completion signal starts with one permit per slot. `acquire` takes a
//! permit, blocking while every slot is in flight; the completion callback of each
//! submitted frame returns its permit. Submissions complete in order, so holding a
//! permit for frame `k` means frame `k - N` has finished and its slot is free.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::error::{RendererError, RendererResult};

/// How long `acquire` sleeps between backend polls
const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Counting semaphore released from completion callbacks
#[derive(Debug)]
struct CompletionSignal {
    permits: Mutex<usize>,
    released: Condvar,
}

impl CompletionSignal {
    fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            released: Condvar::new(),
        }
    }

    fn release(&self) {
        *self.permits.lock() += 1;
        self.released.notify_one();
    }

    fn try_acquire(&self) -> bool {
        let mut permits = self.permits.lock();
        if *permits > 0 {
            *permits -= 1;
            true
        } else {
            false
        }
    }

    fn acquire_timeout(&self, timeout: Duration) -> bool {
        let mut permits = self.permits.lock();
        if *permits == 0 {
            self.released.wait_for(&mut permits, timeout);
        }
        if *permits > 0 {
            *permits -= 1;
            true
        } else {
            false
        }
    }

    fn available(&self) -> usize {
        *self.permits.lock()
    }
}

/// Generation counters validating slot reuse
#[derive(Debug, Default)]
struct SlotGenerations {
    /// Frame number (index + 1) last submitted from this slot
    submitted: AtomicU64,
    /// Frame number (index + 1) whose completion has been signaled
    completed: AtomicU64,
}

/// A slot the host currently owns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSlot {
    pub index: usize,
    pub frame: u64,
}

#[derive(Debug)]
pub struct FrameRing {
    frames_in_flight: usize,
    frame_index: u64,
    signal: Arc<CompletionSignal>,
    generations: Arc<Vec<SlotGenerations>>,
    pending: Vec<Option<SubmissionId>>,
    acquired: Option<FrameSlot>,
    validate: bool,
}

impl FrameRing {
    pub fn new(frames_in_flight: usize, validate: bool) -> Self {
        let frames_in_flight = frames_in_flight.max(1);
        Self {
            frames_in_flight,
            frame_index: 0,
            signal: Arc::new(CompletionSignal::new(frames_in_flight)),
            generations: Arc::new((0..frames_in_flight).map(|_| SlotGenerations::default()).collect()),
            pending: vec![None; frames_in_flight],
            acquired: None,
            validate,
        }
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    /// Index of the frame being produced
    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    /// Slot the current frame writes, cycling modulo frames in flight
    pub fn current_slot(&self) -> usize {
        (self.frame_index % self.frames_in_flight as u64) as usize
    }

    /// Slots not owned by in-flight work
    pub fn free_slots(&self) -> usize {
        self.signal.available()
    }

    /// Block until the current slot's previous frame has completed, then own the slot.
    ///
    /// This is the only place the frame loop waits on the accelerator.
    pub fn acquire(&mut self, backend: &mut dyn GraphicsBackend) -> FrameSlot {
        if let Some(slot) = self.acquired {
            return slot;
        }
        let index = self.current_slot();
        if !self.signal.try_acquire() {
            log::trace!("Frame ring: waiting for slot {}", index);
            loop {
                if let Some(submission) = self.pending[index] {
                    backend.wait_for_submission(submission);
                } else {
                    backend.poll(false);
                }
                if self.signal.acquire_timeout(ACQUIRE_POLL_INTERVAL) {
                    break;
                }
            }
        }
        self.pending[index] = None;
        let slot = FrameSlot {
            index,
            frame: self.frame_index,
        };
        self.acquired = Some(slot);
        slot
    }

    /// Fail if the slot's last submitted frame has not signaled completion.
    pub fn check_writable(&self, slot: usize) -> RendererResult<()> {
        if !self.validate {
            return Ok(());
        }
        let generations = &self.generations[slot];
        let submitted = generations.submitted.load(Ordering::Acquire);
        let completed = generations.completed.load(Ordering::Acquire);
        if submitted != completed {
            return Err(RendererError::RingSlotInFlight {
                slot,
                submitted,
                completed,
            });
        }
        Ok(())
    }

    /// Callback to pass to `submit`; releases the slot when the accelerator is done.
    pub fn completion_handler(&self, slot: FrameSlot) -> CompletionCallback {
        let signal = Arc::clone(&self.signal);
        let generations = Arc::clone(&self.generations);
        Box::new(move || {
            generations[slot.index]
                .completed
                .store(slot.frame + 1, Ordering::Release);
            signal.release();
        })
    }

    /// Record the submission consuming an acquired slot
    pub fn mark_submitted(&mut self, slot: FrameSlot, submission: SubmissionId) {
        self.pending[slot.index] = Some(submission);
        self.generations[slot.index]
            .submitted
            .store(slot.frame + 1, Ordering::Release);
    }

    /// Give back a slot whose frame was dropped before submission
    pub fn abandon(&mut self, slot: FrameSlot) {
        if self.acquired == Some(slot) {
            self.acquired = None;
            self.signal.release();
            log::debug!("Frame ring: frame {} dropped, slot {} released", slot.frame, slot.index);
        }
    }

    /// Move on to the next frame
    pub fn advance(&mut self) {
        self.acquired = None;
        self.frame_index += 1;
    }
}

/// One buffer per frame ring slot
#[derive(Debug, Clone)]
pub struct RingBuffer {
    buffers: Vec<BufferHandle>,
    size: u64,
}

impl RingBuffer {
    pub fn new(
        backend: &mut dyn GraphicsBackend,
        label: &str,
        size: u64,
        usage: BufferUsage,
        slots: usize,
    ) -> BackendResult<Self> {
        let buffers = (0..slots.max(1))
            .map(|slot| {
                backend.create_buffer(&BufferDescriptor {
                    label: Some(format!("{} [{}]", label, slot)),
                    size,
                    usage: usage | BufferUsage::COPY_DST,
                    mapped_at_creation: false,
                })
            })
            .collect::<BackendResult<Vec<_>>>()?;
        Ok(Self { buffers, size })
    }

    pub fn buffers(&self) -> &[BufferHandle] {
        &self.buffers
    }

    pub fn get(&self, slot: usize) -> BufferHandle {
        self.buffers[slot % self.buffers.len()]
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Write into the buffer owned by `slot`; bytes past the buffer size are dropped.
    pub fn write(&self, backend: &mut dyn GraphicsBackend, slot: usize, bytes: &[u8]) {
        let len = (bytes.len() as u64).min(self.size) as usize;
        if len < bytes.len() {
            log::warn!("Ring buffer write of {} bytes truncated to {}", bytes.len(), len);
        }
        backend.write_buffer(self.get(slot), 0, &bytes[..len]);
    }

    pub fn destroy(&self, backend: &mut dyn GraphicsBackend) {
        for &buffer in &self.buffers {
            backend.destroy_buffer(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::{ExecutionMode, HeadlessBackend};

    fn submit_frame(ring: &mut FrameRing, backend: &mut HeadlessBackend) -> FrameSlot {
        let slot = ring.acquire(backend);
        backend.begin_encoding("frame");
        let id = backend.submit(Some(ring.completion_handler(slot))).unwrap();
        ring.mark_submitted(slot, id);
        ring.advance();
        slot
    }

    #[test]
    fn slots_cycle_modulo_frames_in_flight() {
        let mut backend = HeadlessBackend::new(4, 4);
        let mut ring = FrameRing::new(3, true);
        let slots: Vec<usize> = (0..7).map(|_| submit_frame(&mut ring, &mut backend).index).collect();
        assert_eq!(slots, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn acquire_waits_for_the_slot_being_reused() {
        let mut backend = HeadlessBackend::new(4, 4).with_execution_mode(ExecutionMode::Deferred);
        let mut ring = FrameRing::new(2, true);
        submit_frame(&mut ring, &mut backend);
        submit_frame(&mut ring, &mut backend);
        assert_eq!(backend.pending_submissions(), 2);
        assert_eq!(ring.free_slots(), 0);

        // Reusing slot 0 must first retire frame 0, and only frame 0
        let slot = ring.acquire(&mut backend);
        assert_eq!(slot.index, 0);
        assert_eq!(backend.pending_submissions(), 1);
        assert!(ring.check_writable(0).is_ok());
        assert!(ring.check_writable(1).is_err());
    }

    #[test]
    fn in_flight_slot_is_reported() {
        let mut backend = HeadlessBackend::new(4, 4).with_execution_mode(ExecutionMode::Deferred);
        let mut ring = FrameRing::new(2, true);
        let slot = submit_frame(&mut ring, &mut backend);
        match ring.check_writable(slot.index) {
            Err(RendererError::RingSlotInFlight { slot: 0, submitted: 1, completed: 0 }) => {}
            other => panic!("unexpected {:?}", other),
        }
        backend.poll(true);
        assert!(ring.check_writable(slot.index).is_ok());
    }

    #[test]
    fn abandoned_frame_returns_its_permit() {
        let mut backend = HeadlessBackend::new(4, 4);
        let mut ring = FrameRing::new(1, true);
        let slot = ring.acquire(&mut backend);
        assert_eq!(ring.free_slots(), 0);
        ring.abandon(slot);
        ring.advance();
        assert_eq!(ring.free_slots(), 1);
        assert_eq!(ring.acquire(&mut backend).frame, 1);
    }

    #[test]
    fn validation_can_be_disabled() {
        let mut backend = HeadlessBackend::new(4, 4).with_execution_mode(ExecutionMode::Deferred);
        let mut ring = FrameRing::new(2, false);
        let slot = submit_frame(&mut ring, &mut backend);
        assert!(ring.check_writable(slot.index).is_ok());
    }
}
