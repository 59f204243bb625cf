use std::{cell::Cell, future::Future, rc::Rc};

use crate::{
    error::StreamError,
    readable::{
        byte_controller, default_controller, ControllerState, ReadRequest, ReadResult,
        ReadableInner, ReadableState, ReaderState,
    },
    utils::{deferred::Deferred, reactor::drive_with},
    StreamResult,
};

/// The exclusive default reader of a [`ReadableStream`].
///
/// Dropping the reader releases its lock; pending reads are rejected as if
/// [`release_lock`] had been called.
///
/// [`ReadableStream`]: crate::ReadableStream
/// [`release_lock`]: ReadableStreamDefaultReader::release_lock
/// https://streams.spec.whatwg.org/#default-reader-class
pub struct ReadableStreamDefaultReader<T> {
    pub(crate) stream: Rc<ReadableInner<T>>,
    closed: Deferred<()>,
    released: Cell<bool>,
}

impl<T> std::fmt::Debug for ReadableStreamDefaultReader<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadableStreamDefaultReader")
            .finish_non_exhaustive()
    }
}

impl<T: 'static> ReadableStreamDefaultReader<T> {
    pub(crate) fn new(stream: Rc<ReadableInner<T>>, closed: Deferred<()>) -> Self {
        Self {
            stream,
            closed,
            released: Cell::new(false),
        }
    }

    /// Resolves with the next chunk, or `done` once the stream closes.
    /// https://streams.spec.whatwg.org/#default-reader-read
    pub fn read(&self) -> impl Future<Output = StreamResult<ReadResult<T>>> {
        let deferred: Deferred<ReadResult<T>> = Deferred::new();
        if self.released.get() {
            deferred.reject(StreamError::type_error(
                "Cannot read from a stream using a released reader",
            ));
        } else {
            read_internal(
                &self.stream,
                Box::new(DeferredReadRequest {
                    deferred: deferred.clone(),
                }),
            );
        }
        drive_with(self.stream.reactor.clone(), deferred.once())
    }

    /// https://streams.spec.whatwg.org/#default-reader-cancel
    pub fn cancel(&self, reason: StreamError) -> impl Future<Output = StreamResult<()>> {
        let deferred = if self.released.get() {
            Deferred::rejected(StreamError::type_error(
                "Cannot cancel a stream using a released reader",
            ))
        } else {
            ReadableInner::cancel(&self.stream, reason)
        };
        drive_with(self.stream.reactor.clone(), deferred.once())
    }

    /// Fire-and-forget cancellation: state transitions happen immediately;
    /// the source's cancel algorithm runs the next time the stream is driven.
    pub(crate) fn cancel_in_background(&self, reason: StreamError) {
        if self.released.get() {
            return;
        }
        ReadableInner::cancel(&self.stream, reason).mark_handled();
    }

    /// Settles when the stream closes or errors.
    /// https://streams.spec.whatwg.org/#default-reader-closed
    pub fn closed(&self) -> impl Future<Output = StreamResult<()>> {
        drive_with(self.stream.reactor.clone(), self.closed.settled())
    }

    pub(crate) fn closed_deferred(&self) -> &Deferred<()> {
        &self.closed
    }

    /// Releases the stream's lock. Pending reads are rejected.
    /// https://streams.spec.whatwg.org/#default-reader-release-lock
    pub fn release_lock(&self) {
        if self.released.replace(true) {
            return;
        }
        release_internal(&self.stream);
    }
}

impl<T> Drop for ReadableStreamDefaultReader<T> {
    fn drop(&mut self) {
        if !self.released.replace(true) {
            release_internal(&self.stream);
        }
    }
}

/// https://streams.spec.whatwg.org/#readable-stream-default-reader-read
pub(crate) fn read_internal<T: 'static>(
    inner: &Rc<ReadableInner<T>>,
    request: Box<dyn ReadRequest<T>>,
) {
    let is_byte = {
        let mut core = inner.core.borrow_mut();
        core.disturbed = true;
        match &core.state {
            ReadableState::Closed => {
                request.close_steps();
                return;
            }
            ReadableState::Errored(error) => {
                request.error_steps(error.clone());
                return;
            }
            ReadableState::Readable => {}
        }
        matches!(core.controller, ControllerState::Byte(_))
    };
    if is_byte {
        byte_controller::pull_steps(inner, request);
    } else {
        default_controller::pull_steps(inner, request);
    }
}

/// https://streams.spec.whatwg.org/#abstract-opdef-readablestreamdefaultreaderrelease
pub(crate) fn release_internal<T>(inner: &Rc<ReadableInner<T>>) {
    let mut core = inner.core.borrow_mut();
    let released = StreamError::type_error("Reader was released");
    if let Some(reader) = core.reader.as_ref() {
        reader.closed().reject(released.clone());
    }
    byte_controller::release_steps(&mut core);
    match core.reader.take() {
        Some(ReaderState::Default(mut reader)) => {
            for request in reader.read_requests.drain(..) {
                request.error_steps(released.clone());
            }
        }
        Some(ReaderState::Byob(mut reader)) => {
            for request in reader.read_into_requests.drain(..) {
                request.error_steps(released.clone());
            }
        }
        None => {}
    }
}

/// The read request behind [`ReadableStreamDefaultReader::read`].
pub(crate) struct DeferredReadRequest<T> {
    pub deferred: Deferred<ReadResult<T>>,
}

impl<T> ReadRequest<T> for DeferredReadRequest<T> {
    fn chunk_steps(self: Box<Self>, chunk: T) {
        self.deferred.resolve(ReadResult::chunk(chunk));
    }

    fn close_steps(self: Box<Self>) {
        self.deferred.resolve(ReadResult::done());
    }

    fn error_steps(self: Box<Self>, error: StreamError) {
        self.deferred.reject(error);
    }
}
