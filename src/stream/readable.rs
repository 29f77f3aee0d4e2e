//! Pull-based readable stream with back-pressure.
//!
//! Grounded on `original_source/Libraries/AsyncStreams/AsyncStreams.h`'s
//! `AsyncReadableStream`: data only moves when the consumer asks for it
//! (`resume`), an internal queue absorbs data produced ahead of demand up to
//! `high_water_mark`, and the source is paused once that mark is hit.

use std::collections::VecDeque;

use crate::buffers::BufferView;
use crate::error::CrateError;

use super::ListenerId;

/// Lifecycle of a [`ReadableStream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadableState {
    /// No read has been requested yet; the underlying source is idle.
    Idle,
    /// Consumer has asked for data; a read request is in flight or queued
    /// data is being drained.
    Flowing,
    /// Internal queue is at or above the high water mark; the source is
    /// paused until the consumer drains it below that mark.
    Paused,
    /// The source reported end-of-stream; no more data will arrive but
    /// queued data may still be drained.
    Ending,
    /// Fully drained after `Ending`.
    Ended,
    /// The source errored; no further reads are possible.
    Errored,
    /// `destroy` was called; all resources released.
    Destroyed,
}

type DataListener = Box<dyn FnMut(&BufferView)>;
type EndListener = Box<dyn FnMut()>;
type ErrorListener = Box<dyn FnMut(&CrateError)>;

/// A stream of [`BufferView`] chunks pulled on demand from a source (a raw
/// descriptor via [`super::request_adapter::RequestSource`], a transform's
/// output, or a test double).
pub struct ReadableStream {
    state: ReadableState,
    queue: VecDeque<BufferView>,
    queued_bytes: usize,
    high_water_mark: usize,
    on_data: Vec<Option<DataListener>>,
    on_end: Vec<Option<EndListener>>,
    on_error: Vec<Option<ErrorListener>>,
}

impl ReadableStream {
    /// Creates a stream that buffers at most `high_water_mark` bytes ahead
    /// of consumption before asking its source to pause.
    pub fn new(high_water_mark: usize) -> ReadableStream {
        ReadableStream {
            state: ReadableState::Idle,
            queue: VecDeque::new(),
            queued_bytes: 0,
            high_water_mark,
            on_data: Vec::new(),
            on_end: Vec::new(),
            on_error: Vec::new(),
        }
    }

    pub fn state(&self) -> ReadableState {
        self.state
    }

    /// Registers a callback invoked for every chunk delivered to a waiting
    /// consumer. Returns an id that [`ReadableStream::remove_data_listener`]
    /// can later use to unsubscribe (e.g. when a [`Pipeline`](super::Pipeline)
    /// is unwired).
    pub fn on_data(&mut self, listener: impl FnMut(&BufferView) + 'static) -> ListenerId {
        self.on_data.push(Some(Box::new(listener)));
        ListenerId(self.on_data.len() - 1)
    }

    /// Registers a callback invoked once, when the stream reaches `Ended`.
    pub fn on_end(&mut self, listener: impl FnMut() + 'static) -> ListenerId {
        self.on_end.push(Some(Box::new(listener)));
        ListenerId(self.on_end.len() - 1)
    }

    /// Registers a callback invoked if the stream moves to `Errored`.
    pub fn on_error(&mut self, listener: impl FnMut(&CrateError) + 'static) -> ListenerId {
        self.on_error.push(Some(Box::new(listener)));
        ListenerId(self.on_error.len() - 1)
    }

    /// Unsubscribes a listener registered with [`ReadableStream::on_data`].
    pub fn remove_data_listener(&mut self, id: ListenerId) {
        if let Some(slot) = self.on_data.get_mut(id.0) {
            *slot = None;
        }
    }

    /// Unsubscribes a listener registered with [`ReadableStream::on_end`].
    pub fn remove_end_listener(&mut self, id: ListenerId) {
        if let Some(slot) = self.on_end.get_mut(id.0) {
            *slot = None;
        }
    }

    /// Unsubscribes a listener registered with [`ReadableStream::on_error`].
    pub fn remove_error_listener(&mut self, id: ListenerId) {
        if let Some(slot) = self.on_error.get_mut(id.0) {
            *slot = None;
        }
    }

    /// Whether the internal queue is at or over `high_water_mark`
    /// (back-pressure should be applied to the source).
    pub fn is_backpressured(&self) -> bool {
        self.queued_bytes >= self.high_water_mark
    }

    /// Called by the source adapter when a chunk arrives. Delivers
    /// immediately to registered listeners (push-based fan-out), while also
    /// keeping an internal queue so a [`Pipeline`](super::Pipeline) stage
    /// added later can still observe back-pressure state.
    pub fn push(&mut self, chunk: BufferView) {
        if matches!(self.state, ReadableState::Ended | ReadableState::Errored | ReadableState::Destroyed) {
            return;
        }
        self.queued_bytes += chunk.len();
        self.queue.push_back(chunk.clone());
        self.state = if self.is_backpressured() {
            ReadableState::Paused
        } else {
            ReadableState::Flowing
        };
        for listener in self.on_data.iter_mut().flatten() {
            listener(&chunk);
        }
    }

    /// Removes and returns the oldest queued chunk, if any, reducing the
    /// queued byte count so a paused source can resume.
    pub fn drain_one(&mut self) -> Option<BufferView> {
        let chunk = self.queue.pop_front()?;
        self.queued_bytes = self.queued_bytes.saturating_sub(chunk.len());
        if self.state == ReadableState::Paused && !self.is_backpressured() {
            self.state = ReadableState::Flowing;
        }
        Some(chunk)
    }

    /// Marks the stream as having reached end-of-stream. Moves to `Ending`
    /// if chunks remain queued, or directly to `Ended` once the queue is
    /// already empty.
    pub fn end(&mut self) {
        if matches!(self.state, ReadableState::Errored | ReadableState::Destroyed) {
            return;
        }
        self.state = if self.queue.is_empty() {
            ReadableState::Ended
        } else {
            ReadableState::Ending
        };
        if self.state == ReadableState::Ended {
            for listener in self.on_end.iter_mut().flatten() {
                listener();
            }
        }
    }

    /// Reports an error from the source, moving the stream to `Errored` and
    /// discarding any queued data (matches the original's "errors are
    /// terminal" behaviour for streams).
    pub fn error(&mut self, err: CrateError) {
        self.state = ReadableState::Errored;
        self.queue.clear();
        self.queued_bytes = 0;
        for listener in self.on_error.iter_mut().flatten() {
            listener(&err);
        }
    }

    /// Releases queued data and moves to `Destroyed`; no further events
    /// will be delivered.
    pub fn destroy(&mut self) {
        self.queue.clear();
        self.queued_bytes = 0;
        self.state = ReadableState::Destroyed;
    }
}

impl std::fmt::Debug for ReadableStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadableStream")
            .field("state", &self.state)
            .field("queued_bytes", &self.queued_bytes)
            .field("high_water_mark", &self.high_water_mark)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::BufferPool;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn backpressure_pauses_once_high_water_mark_reached() {
        let pool = BufferPool::new(8, 4);
        let mut stream = ReadableStream::new(8);
        let view = pool.acquire().unwrap();
        view.with_bytes_mut(|buf| buf.extend_from_slice(&[0u8; 8]));
        stream.push(view);
        assert_eq!(stream.state(), ReadableState::Paused);
        stream.drain_one();
        assert_eq!(stream.state(), ReadableState::Flowing);
    }

    #[test]
    fn end_fires_listener_once_queue_drained() {
        let mut stream = ReadableStream::new(64);
        let ended = Rc::new(RefCell::new(false));
        let ended_clone = Rc::clone(&ended);
        stream.on_end(move || *ended_clone.borrow_mut() = true);
        stream.end();
        assert!(*ended.borrow());
        assert_eq!(stream.state(), ReadableState::Ended);
    }
}
