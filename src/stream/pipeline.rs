//! Wires one [`ReadableStream`] through zero-or-more [`TransformStream`]s
//! into one-or-more [`WritableStream`] sinks, propagating `end`/`error` and
//! back-pressure across the whole chain.
//!
//! Grounded on `original_source/Libraries/AsyncStreams/AsyncStreams.h`'s
//! `AsyncPipeline`: `pipe()` subscribes each stage's `data`/`end` events to
//! the next, and every stage's `error` event into one pipeline-level error
//! event; `unpipe()` removes exactly the listeners `pipe()` added.

use std::cell::RefCell;
use std::rc::Rc;

use crate::buffers::BufferPool;
use crate::error::CrateError;

use super::readable::ReadableStream;
use super::transform::TransformStream;
use super::writable::WritableStream;
use super::ListenerId;

/// A producer stage: either the pipeline's original source, or a transform
/// feeding from the previous stage's output.
#[derive(Clone)]
enum Upstream {
    Source(Rc<RefCell<ReadableStream>>),
    Transform(Rc<RefCell<TransformStream>>),
}

impl Upstream {
    fn on_data(&self, listener: impl FnMut(&crate::buffers::BufferView) + 'static) -> ListenerId {
        match self {
            Upstream::Source(readable) => readable.borrow_mut().on_data(listener),
            Upstream::Transform(transform) => transform.borrow_mut().duplex.readable.on_data(listener),
        }
    }

    fn on_end(&self, listener: impl FnMut() + 'static) -> ListenerId {
        match self {
            Upstream::Source(readable) => readable.borrow_mut().on_end(listener),
            Upstream::Transform(transform) => transform.borrow_mut().duplex.readable.on_end(listener),
        }
    }

    fn remove_data_listener(&self, id: ListenerId) {
        match self {
            Upstream::Source(readable) => readable.borrow_mut().remove_data_listener(id),
            Upstream::Transform(transform) => transform.borrow_mut().duplex.readable.remove_data_listener(id),
        }
    }

    fn remove_end_listener(&self, id: ListenerId) {
        match self {
            Upstream::Source(readable) => readable.borrow_mut().remove_end_listener(id),
            Upstream::Transform(transform) => transform.borrow_mut().duplex.readable.remove_end_listener(id),
        }
    }

    fn hook_error(&self, errors: Rc<RefCell<Vec<CrateError>>>) -> ListenerId {
        match self {
            Upstream::Source(readable) => readable.borrow_mut().on_error(move |err| {
                errors.borrow_mut().push(clone_error(err));
            }),
            Upstream::Transform(transform) => transform.borrow_mut().duplex.readable.on_error(move |err| {
                errors.borrow_mut().push(clone_error(err));
            }),
        }
    }

    fn remove_error_listener(&self, id: ListenerId) {
        match self {
            Upstream::Source(readable) => readable.borrow_mut().remove_error_listener(id),
            Upstream::Transform(transform) => transform.borrow_mut().duplex.readable.remove_error_listener(id),
        }
    }
}

/// One data+end subscription from an `Upstream` into the next stage, plus
/// the error hooks that stage's halves need, so `unpipe` can remove exactly
/// what `pipe` added.
struct Wiring {
    upstream: Upstream,
    data: ListenerId,
    end: ListenerId,
    /// Error listener on a downstream sink's writable half, or on a
    /// transform's writable half.
    write_error: Option<(WriteErrorSource, ListenerId)>,
    /// Error listener on a newly created transform's own readable half
    /// (the transform becomes `upstream` for the next stage, so this can't
    /// be folded into that next stage's `Wiring`).
    transform_read_error: Option<(Rc<RefCell<TransformStream>>, ListenerId)>,
}

#[derive(Clone)]
enum WriteErrorSource {
    Transform(Rc<RefCell<TransformStream>>),
    Sink(Rc<RefCell<WritableStream>>),
}

impl WriteErrorSource {
    fn hook(&self, errors: Rc<RefCell<Vec<CrateError>>>) -> ListenerId {
        match self {
            WriteErrorSource::Transform(transform) => transform.borrow_mut().duplex.writable.on_error(move |err| {
                errors.borrow_mut().push(clone_error(err));
            }),
            WriteErrorSource::Sink(sink) => sink.borrow_mut().on_error(move |err| {
                errors.borrow_mut().push(clone_error(err));
            }),
        }
    }

    fn remove(&self, id: ListenerId) {
        match self {
            WriteErrorSource::Transform(transform) => transform.borrow_mut().duplex.writable.remove_error_listener(id),
            WriteErrorSource::Sink(sink) => sink.borrow_mut().remove_error_listener(id),
        }
    }
}

/// A linear chain: one readable source, an ordered list of transforms, and
/// a fan-out to every registered sink.
///
/// All participants must share one [`BufferPool`] — validated at
/// `add_transform` time since [`TransformStream`] tracks its pool;
/// [`ReadableStream`]/[`WritableStream`] don't themselves track which pool
/// produced their buffers, so the source and plain sinks are taken on
/// trust.
pub struct Pipeline {
    pool: BufferPool,
    source: Rc<RefCell<ReadableStream>>,
    transforms: Vec<Rc<RefCell<TransformStream>>>,
    sinks: Vec<Rc<RefCell<WritableStream>>>,
    errors: Rc<RefCell<Vec<CrateError>>>,
    error_listeners: Vec<Box<dyn FnMut(&CrateError)>>,
    wiring: Vec<Wiring>,
    source_error: Option<ListenerId>,
    piped: bool,
}

impl Pipeline {
    pub fn new(pool: BufferPool, source: Rc<RefCell<ReadableStream>>) -> Pipeline {
        Pipeline {
            pool,
            source,
            transforms: Vec::new(),
            sinks: Vec::new(),
            errors: Rc::new(RefCell::new(Vec::new())),
            error_listeners: Vec::new(),
            wiring: Vec::new(),
            source_error: None,
            piped: false,
        }
    }

    /// Appends a transform stage. Must be called before [`Pipeline::pipe`].
    pub fn add_transform(&mut self, transform: Rc<RefCell<TransformStream>>) -> Result<(), CrateError> {
        if !transform.borrow().pool().is_same_pool(&self.pool) {
            return Err(CrateError::InvalidState(
                "transform does not share the pipeline's buffer pool",
            ));
        }
        self.transforms.push(transform);
        Ok(())
    }

    /// Registers a sink the final stage's data is written to.
    pub fn add_sink(&mut self, sink: Rc<RefCell<WritableStream>>) {
        self.sinks.push(sink);
    }

    /// Registers a callback invoked whenever any wired stream errors.
    /// Errors surface the next time [`Pipeline::drain_errors`] is called.
    pub fn on_error(&mut self, listener: impl FnMut(&CrateError) + 'static) {
        self.error_listeners.push(Box::new(listener));
    }

    /// Wires every stage together. Idempotent: calling twice without an
    /// intervening [`Pipeline::unpipe`] is a no-op.
    pub fn pipe(&mut self) -> Result<(), CrateError> {
        if self.piped {
            return Ok(());
        }
        if self.sinks.is_empty() {
            return Err(CrateError::InvalidState("pipeline has no sinks to pipe into"));
        }

        let mut upstream = Upstream::Source(Rc::clone(&self.source));
        self.source_error = Some(upstream.hook_error(Rc::clone(&self.errors)));

        for transform in self.transforms.clone() {
            self.wire_into_transform(&upstream, &transform);
            upstream = Upstream::Transform(transform);
        }

        for sink in self.sinks.clone() {
            self.wire_into_sink(&upstream, &sink);
        }

        self.piped = true;
        Ok(())
    }

    fn wire_into_transform(&mut self, upstream: &Upstream, transform: &Rc<RefCell<TransformStream>>) {
        let target = Rc::clone(transform);
        let data = upstream.on_data(move |chunk| {
            let mut transform = target.borrow_mut();
            let _ = transform.duplex.writable.write(chunk.clone());
            let _ = transform.pump();
        });

        let target = Rc::clone(transform);
        let end = upstream.on_end(move || target.borrow_mut().end_input());

        let write_error_id = WriteErrorSource::Transform(Rc::clone(transform)).hook(Rc::clone(&self.errors));
        let read_error_id = Upstream::Transform(Rc::clone(transform)).hook_error(Rc::clone(&self.errors));

        self.wiring.push(Wiring {
            upstream: upstream.clone(),
            data,
            end,
            write_error: Some((WriteErrorSource::Transform(Rc::clone(transform)), write_error_id)),
            transform_read_error: Some((Rc::clone(transform), read_error_id)),
        });
    }

    fn wire_into_sink(&mut self, upstream: &Upstream, sink: &Rc<RefCell<WritableStream>>) {
        let target = Rc::clone(sink);
        let data = upstream.on_data(move |chunk| {
            let _ = target.borrow_mut().write(chunk.clone());
        });

        let target = Rc::clone(sink);
        let end = upstream.on_end(move || target.borrow_mut().end());

        let write_error_id = WriteErrorSource::Sink(Rc::clone(sink)).hook(Rc::clone(&self.errors));

        self.wiring.push(Wiring {
            upstream: upstream.clone(),
            data,
            end,
            write_error: Some((WriteErrorSource::Sink(Rc::clone(sink)), write_error_id)),
            transform_read_error: None,
        });
    }

    /// Drains errors accumulated since the last call and dispatches them to
    /// registered [`Pipeline::on_error`] listeners.
    pub fn drain_errors(&mut self) {
        let drained: Vec<_> = self.errors.borrow_mut().drain(..).collect();
        for err in drained {
            for listener in &mut self.error_listeners {
                listener(&err);
            }
        }
    }

    /// Back-pressure propagation: called by a sink's completion handler
    /// once a write has drained. Resumes every transform (reverse order,
    /// downstream-to-upstream), exactly as §4.8 specifies.
    pub fn after_write(&mut self) -> Result<(), CrateError> {
        for transform in self.transforms.iter().rev() {
            transform.borrow_mut().resume()?;
        }
        Ok(())
    }

    /// Removes every listener `pipe()` added, restoring the source and
    /// sinks to the subscription set they had before piping.
    pub fn unpipe(&mut self) {
        if let Some(id) = self.source_error.take() {
            Upstream::Source(Rc::clone(&self.source)).remove_error_listener(id);
        }
        for wiring in self.wiring.drain(..) {
            wiring.upstream.remove_data_listener(wiring.data);
            wiring.upstream.remove_end_listener(wiring.end);
            if let Some((source, id)) = wiring.write_error {
                source.remove(id);
            }
            if let Some((transform, id)) = wiring.transform_read_error {
                Upstream::Transform(transform).remove_error_listener(id);
            }
        }
        self.piped = false;
    }

    pub fn is_piped(&self) -> bool {
        self.piped
    }
}

fn clone_error(err: &CrateError) -> CrateError {
    CrateError::Io(std::io::Error::new(err.kind(), err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::BufferPool;

    #[test]
    fn pipe_then_unpipe_clears_subscriptions() {
        let pool = BufferPool::new(64, 4);
        let source = Rc::new(RefCell::new(ReadableStream::new(64)));
        let sink = Rc::new(RefCell::new(WritableStream::new(64)));

        let mut pipeline = Pipeline::new(pool.clone(), Rc::clone(&source));
        pipeline.add_sink(Rc::clone(&sink));
        pipeline.pipe().unwrap();
        assert!(pipeline.is_piped());

        let view = pool.acquire().unwrap();
        view.with_bytes_mut(|buf| buf.extend_from_slice(b"x"));
        source.borrow_mut().push(view);
        assert_eq!(sink.borrow().state(), super::super::writable::WritableState::Writing);

        pipeline.unpipe();
        assert!(!pipeline.is_piped());

        let view2 = pool.acquire().unwrap();
        view2.with_bytes_mut(|buf| buf.extend_from_slice(b"y"));
        let before = sink.borrow().state();
        source.borrow_mut().push(view2);
        // After unpipe, pushing to the source no longer reaches the sink.
        assert_eq!(sink.borrow().state(), before);
    }

    #[test]
    fn rejects_transform_from_a_different_pool() {
        let pool_a = BufferPool::new(64, 4);
        let pool_b = BufferPool::new(64, 4);
        let source = Rc::new(RefCell::new(ReadableStream::new(64)));
        let mut pipeline = Pipeline::new(pool_a, Rc::clone(&source));

        let transform = Rc::new(RefCell::new(TransformStream::new(pool_b, 64, |_input, output| {
            Ok((None, output))
        })));
        let err = pipeline.add_transform(transform).unwrap_err();
        assert!(matches!(err, CrateError::InvalidState(_)));
    }
}
