//! Buffer-pool-driven stream layer: readable/writable halves, their
//! combination into a duplex, an optional transform step, and the
//! [`pipeline::Pipeline`] that wires several streams together with
//! back-pressure.
//!
//! Grounded on `original_source/Libraries/AsyncStreams/AsyncStreams.h`
//! (`AsyncReadableStream`, `AsyncWritableStream`, `AsyncPipeline`); the
//! request-driven read/write primitives are supplied by
//! [`request_adapter`], which is this layer's bridge back into
//! [`crate::event_loop`].

pub mod duplex;
pub mod pipeline;
pub mod readable;
pub mod request_adapter;
pub mod transform;
pub mod writable;

pub use duplex::Duplex;
pub use pipeline::Pipeline;
pub use readable::ReadableStream;
pub use request_adapter::{IoKind, RequestSink, RequestSource};
pub use transform::TransformStream;
pub use writable::WritableStream;

/// Opaque handle to a registered event listener, returned by `on_data` /
/// `on_end` / `on_error` and friends so a [`Pipeline`] can precisely
/// unsubscribe on `unpipe` instead of clearing every listener on the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(pub(crate) usize);
