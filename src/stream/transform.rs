//! A [`Duplex`] whose output is derived from its input by a user-supplied
//! processing step, rather than being a passthrough onto a second
//! descriptor.
//!
//! Grounded on `original_source/Libraries/AsyncStreams/AsyncStreams.h`'s
//! `AsyncPipeline`-adjacent transform concept: a transform both consumes
//! (via its [`Duplex::writable`] half) and produces (via its
//! [`Duplex::readable`] half), sharing one [`BufferPool`] between the two so
//! a buffer can move from input to output without copying.

use crate::buffers::{BufferPool, BufferView};
use crate::error::CrateError;

use super::Duplex;

/// Lifecycle of a [`TransformStream`], independent of the state of its
/// inner [`Duplex`] halves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformState {
    /// Waiting for writable-side input.
    None,
    /// Paused because no output buffer was available from the pool.
    Paused,
    /// `on_process` is conceptually in flight (it runs synchronously here,
    /// but the state exists so callers can tell processing from idling).
    Processing,
    /// `writable.end()` was called; draining remaining output via
    /// `on_finalize` before the readable half ends.
    Finalizing,
    /// `on_finalize` reported no more output; the readable half has ended.
    Finalized,
}

type ProcessFn = Box<dyn FnMut(BufferView, BufferView) -> Result<(Option<BufferView>, BufferView), CrateError>>;
type FinalizeFn = Box<dyn FnMut(BufferView) -> Result<(BufferView, bool), CrateError>>;

/// A duplex stream that derives output from input via `on_process`.
///
/// `on_process` receives the next queued input chunk and a fresh output
/// buffer, and returns `(remaining_input, remaining_output)`: a `Some`
/// remaining input is fed back through `on_process` again before the next
/// write is popped (mirrors the original's "re-feed leftover input" rule);
/// the remaining output is what actually gets pushed downstream.
pub struct TransformStream {
    pub duplex: Duplex,
    pool: BufferPool,
    state: TransformState,
    ending: bool,
    on_process: ProcessFn,
    on_finalize: Option<FinalizeFn>,
}

impl TransformStream {
    /// Creates a transform sharing `pool` between its writable input side
    /// and readable output side, as the pipeline invariant in §4.8 requires
    /// ("all participating streams must share the same BufferPool").
    pub fn new(
        pool: BufferPool,
        high_water_mark: usize,
        on_process: impl FnMut(BufferView, BufferView) -> Result<(Option<BufferView>, BufferView), CrateError> + 'static,
    ) -> TransformStream {
        TransformStream {
            duplex: Duplex::new(high_water_mark),
            pool,
            state: TransformState::None,
            ending: false,
            on_process: Box::new(on_process),
            on_finalize: None,
        }
    }

    /// Registers the function run once the writable side has ended, to
    /// flush any output the transform is still holding onto (e.g. a
    /// compressor's trailing block). Returns `(remaining_output, ended)`;
    /// `ended` false means `on_finalize` should be called again.
    pub fn set_finalizer(
        &mut self,
        on_finalize: impl FnMut(BufferView) -> Result<(BufferView, bool), CrateError> + 'static,
    ) {
        self.on_finalize = Some(Box::new(on_finalize));
    }

    pub fn state(&self) -> TransformState {
        self.state
    }

    /// The buffer pool this transform was constructed with, used by
    /// [`Pipeline::add_transform`](super::pipeline::Pipeline::add_transform)
    /// to enforce the "all participating streams share one pool" invariant.
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Signals that no more input will be written; once the queue already
    /// fed to `pump` drains, `on_finalize` runs before the readable half
    /// ends. Mirrors `writable.end()` while keeping the decision to run the
    /// finalizer local to the transform instead of inferring it from
    /// `WritableStream`'s state (which also reaches `Draining` transiently
    /// between two back-to-back writes).
    pub fn end_input(&mut self) {
        self.ending = true;
        self.duplex.writable.end();
    }

    /// Drives the transform: pops the next queued write, processes it
    /// against a freshly acquired output buffer, pushes the resulting
    /// output to the readable side, and re-queues any leftover input via
    /// `unshift` so it is processed first on the next call. Returns `false`
    /// (and moves to `Paused`) if no output buffer could be acquired.
    pub fn pump(&mut self) -> Result<bool, CrateError> {
        let Some(input) = self.duplex.writable.next_to_send() else {
            if self.ending && self.state != TransformState::Finalized {
                return self.finalize();
            }
            return Ok(true);
        };

        let output = match self.pool.acquire() {
            Ok(buffer) => buffer,
            Err(CrateError::Capacity(_)) => {
                self.state = TransformState::Paused;
                self.duplex.writable.unshift(input);
                return Ok(false);
            }
            Err(err) => return Err(err),
        };

        self.state = TransformState::Processing;
        let input_len = input.len();
        let (remaining_input, remaining_output) = (self.on_process)(input, output)?;
        self.duplex.writable.ack(input_len);

        if !remaining_output.is_empty() {
            self.duplex.readable.push(remaining_output);
        }

        if let Some(leftover) = remaining_input {
            self.duplex.writable.unshift(leftover);
        }

        self.state = TransformState::None;
        Ok(true)
    }

    fn finalize(&mut self) -> Result<bool, CrateError> {
        self.state = TransformState::Finalizing;
        let Some(finalizer) = self.on_finalize.as_mut() else {
            self.duplex.readable.end();
            self.state = TransformState::Finalized;
            return Ok(true);
        };

        let output = self.pool.acquire()?;
        let (remaining_output, ended) = finalizer(output)?;
        if !remaining_output.is_empty() {
            self.duplex.readable.push(remaining_output);
        }
        if ended {
            self.duplex.readable.end();
            self.state = TransformState::Finalized;
        }
        Ok(ended)
    }

    /// Resumes a transform paused on output-buffer exhaustion; called by
    /// the pipeline's `after_write` back-pressure propagation once a
    /// downstream sink has drained.
    pub fn resume(&mut self) -> Result<bool, CrateError> {
        if self.state == TransformState::Paused {
            self.pump()
        } else {
            Ok(true)
        }
    }
}

impl std::fmt::Debug for TransformStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformStream")
            .field("state", &self.state)
            .field("duplex", &self.duplex)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_transform_passes_bytes_through() {
        let pool = BufferPool::new(64, 4);
        let mut transform = TransformStream::new(pool.clone(), 64, |input, output| {
            input.with_bytes(|bytes| {
                output.with_bytes_mut(|buf| buf.extend_from_slice(bytes));
            });
            let len = output.len();
            Ok((None, output.child(0, len)))
        });

        let received = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let received_clone = std::rc::Rc::clone(&received);
        transform.duplex.readable.on_data(move |chunk| {
            chunk.with_bytes(|bytes| received_clone.borrow_mut().extend_from_slice(bytes));
        });

        let input = pool.acquire().unwrap();
        input.with_bytes_mut(|buf| buf.extend_from_slice(b"hello"));
        transform.duplex.writable.write(input).unwrap();
        transform.pump().unwrap();

        assert_eq!(&*received.borrow(), b"hello");
    }

    #[test]
    fn pauses_when_output_pool_is_exhausted() {
        let pool = BufferPool::new(64, 1);
        let mut transform = TransformStream::new(pool.clone(), 64, |_input, output| Ok((None, output)));

        // The single slot is held by `input` itself for the whole call, so
        // `pump`'s own output acquisition has nowhere to go.
        let input = pool.acquire().unwrap();
        transform.duplex.writable.write(input).unwrap();

        let made_progress = transform.pump().unwrap();
        assert!(!made_progress);
        assert_eq!(transform.state(), TransformState::Paused);
    }
}
