//! A backpressure-aware streaming engine modeled on the WHATWG Streams
//! standard: readable streams with default and BYOB readers, writable streams
//! with exclusive writers, transform streams connecting the two, plus `tee`
//! and `pipe_to` composition.
//!
//! Everything is single-threaded (`Rc`/`RefCell`); each stream carries a
//! small local reactor that runs its continuations whenever one of the
//! engine's public futures is polled, so streams work under any async runtime
//! without spawning.
//! https://streams.spec.whatwg.org/

use futures::future::LocalBoxFuture;

pub mod abort;
mod error;
mod queuing_strategy;
mod readable;
mod transform;
mod utils;
mod writable;

pub use error::{ErrorName, StreamError};
pub use queuing_strategy::{ByteLengthQueuingStrategy, CountQueuingStrategy, QueuingStrategy};
pub use readable::{
    ByobRequest, ByteView, IntoStream, PipeOptions, ReadResult, ReadableByteStreamController,
    ReadableStream, ReadableStreamByobReader, ReadableStreamDefaultController,
    ReadableStreamDefaultReader, ReadableWritablePair, UnderlyingByteSource, UnderlyingSource,
    ViewKind,
};
pub use transform::{TransformStream, TransformStreamDefaultController, Transformer};
pub use writable::{
    UnderlyingSink, WritableStream, WritableStreamDefaultController, WritableStreamDefaultWriter,
};

/// Outcome of every engine operation that can fail.
pub type StreamResult<T> = Result<T, StreamError>;

/// The future type returned by all underlying source, sink and transformer
/// callbacks.
pub type AlgorithmFuture = LocalBoxFuture<'static, StreamResult<()>>;
