//! Push-based writable stream with queuing and back-pressure.
//!
//! Grounded on `original_source/Libraries/AsyncStreams/AsyncStreams.h`'s
//! `AsyncWritableStream`: writes queue up behind an in-flight write; once
//! the queue exceeds `high_water_mark` the writer is told to apply
//! back-pressure (`write` returns `false`) until a drain.

use std::collections::VecDeque;

use crate::buffers::BufferView;
use crate::error::CrateError;

use super::ListenerId;

/// Lifecycle of a [`WritableStream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritableState {
    Idle,
    Writing,
    Draining,
    Finished,
    Errored,
    Destroyed,
}

type DrainListener = Box<dyn FnMut()>;
type FinishListener = Box<dyn FnMut()>;
type ErrorListener = Box<dyn FnMut(&CrateError)>;

/// Accepts chunks via [`WritableStream::write`] and hands them, one at a
/// time, to a sink function (typically a `SocketSend`/`FileWrite` request
/// issued through [`super::request_adapter`]).
pub struct WritableStream {
    state: WritableState,
    queue: VecDeque<BufferView>,
    queued_bytes: usize,
    high_water_mark: usize,
    in_flight: bool,
    on_drain: Vec<DrainListener>,
    on_finish: Vec<FinishListener>,
    on_error: Vec<Option<ErrorListener>>,
}

impl WritableStream {
    pub fn new(high_water_mark: usize) -> WritableStream {
        WritableStream {
            state: WritableState::Idle,
            queue: VecDeque::new(),
            queued_bytes: 0,
            high_water_mark,
            in_flight: false,
            on_drain: Vec::new(),
            on_finish: Vec::new(),
            on_error: Vec::new(),
        }
    }

    pub fn state(&self) -> WritableState {
        self.state
    }

    pub fn on_drain(&mut self, listener: impl FnMut() + 'static) {
        self.on_drain.push(Box::new(listener));
    }

    pub fn on_finish(&mut self, listener: impl FnMut() + 'static) {
        self.on_finish.push(Box::new(listener));
    }

    pub fn on_error(&mut self, listener: impl FnMut(&CrateError) + 'static) -> ListenerId {
        self.on_error.push(Some(Box::new(listener)));
        ListenerId(self.on_error.len() - 1)
    }

    /// Unsubscribes a listener registered with [`WritableStream::on_error`].
    pub fn remove_error_listener(&mut self, id: ListenerId) {
        if let Some(slot) = self.on_error.get_mut(id.0) {
            *slot = None;
        }
    }

    /// Queues `chunk` for writing. Returns `false` once queued bytes reach
    /// `high_water_mark`, signalling the caller to stop writing until
    /// [`WritableStream::on_drain`] fires.
    pub fn write(&mut self, chunk: BufferView) -> Result<bool, CrateError> {
        if matches!(self.state, WritableState::Finished | WritableState::Errored | WritableState::Destroyed) {
            return Err(CrateError::InvalidState("cannot write after the stream has finished"));
        }
        self.queued_bytes += chunk.len();
        self.queue.push_back(chunk);
        if self.state == WritableState::Idle {
            self.state = WritableState::Writing;
        }
        Ok(self.queued_bytes < self.high_water_mark)
    }

    /// Re-inserts `chunk` at the front of the queue without touching
    /// `queued_bytes` accounting a second time, and clears `in_flight` so a
    /// later [`WritableStream::next_to_send`] can hand it out again (used
    /// by a transform to give back input it could not fully consume this
    /// round).
    pub fn unshift(&mut self, chunk: BufferView) {
        self.in_flight = false;
        self.queue.push_front(chunk);
    }

    /// Pops the next chunk to hand to the sink, marking the stream
    /// `in_flight` until [`WritableStream::ack`] is called.
    pub fn next_to_send(&mut self) -> Option<BufferView> {
        if self.in_flight {
            return None;
        }
        let chunk = self.queue.pop_front()?;
        self.in_flight = true;
        Some(chunk)
    }

    /// Acknowledges that the chunk from `next_to_send` was written
    /// successfully, firing a drain listener if the queue has fallen back
    /// under `high_water_mark`.
    pub fn ack(&mut self, written_len: usize) {
        self.in_flight = false;
        self.queued_bytes = self.queued_bytes.saturating_sub(written_len);
        if self.queue.is_empty() {
            self.state = WritableState::Draining;
        }
        if self.queued_bytes < self.high_water_mark {
            for listener in &mut self.on_drain {
                listener();
            }
        }
    }

    /// No more writes will be queued; once the queue drains, moves to
    /// `Finished`.
    pub fn end(&mut self) {
        if self.queue.is_empty() && !self.in_flight {
            self.state = WritableState::Finished;
            for listener in &mut self.on_finish {
                listener();
            }
        } else {
            self.state = WritableState::Draining;
        }
    }

    pub fn error(&mut self, err: CrateError) {
        self.state = WritableState::Errored;
        self.queue.clear();
        self.queued_bytes = 0;
        for listener in self.on_error.iter_mut().flatten() {
            listener(&err);
        }
    }

    pub fn destroy(&mut self) {
        self.queue.clear();
        self.queued_bytes = 0;
        self.state = WritableState::Destroyed;
    }
}

impl std::fmt::Debug for WritableStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WritableStream")
            .field("state", &self.state)
            .field("queued_bytes", &self.queued_bytes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::BufferPool;

    #[test]
    fn write_reports_backpressure_past_high_water_mark() {
        let pool = BufferPool::new(8, 4);
        let mut stream = WritableStream::new(8);
        let view = pool.acquire().unwrap();
        view.with_bytes_mut(|buf| buf.extend_from_slice(&[0u8; 8]));
        let keep_writing = stream.write(view).unwrap();
        assert!(!keep_writing);
    }

    #[test]
    fn end_after_drain_reaches_finished() {
        let mut stream = WritableStream::new(64);
        stream.end();
        assert_eq!(stream.state(), WritableState::Finished);
    }
}
