use std::{cell::Cell, future::Future, rc::Rc};

use crate::{
    error::StreamError,
    utils::{deferred::Deferred, reactor::drive_with},
    writable::{
        self, default_controller, WritableInner, WritableState, WriterShared,
    },
    StreamResult,
};

/// The exclusive writer of a [`WritableStream`].
///
/// Dropping the writer releases its lock; in-flight and queued writes still
/// complete.
///
/// [`WritableStream`]: crate::WritableStream
/// https://streams.spec.whatwg.org/#default-writer-class
pub struct WritableStreamDefaultWriter<T: 'static> {
    pub(crate) stream: Rc<WritableInner<T>>,
    shared: Rc<WriterShared>,
    released: Cell<bool>,
}

impl<T: 'static> WritableStreamDefaultWriter<T> {
    pub(crate) fn new(stream: Rc<WritableInner<T>>, shared: Rc<WriterShared>) -> Self {
        Self {
            stream,
            shared,
            released: Cell::new(false),
        }
    }

    /// Queues `chunk` for the sink, resolving once the sink has accepted it.
    /// Respect backpressure by awaiting [`ready`] before writing.
    ///
    /// [`ready`]: WritableStreamDefaultWriter::ready
    /// https://streams.spec.whatwg.org/#default-writer-write
    pub fn write(&self, chunk: T) -> impl Future<Output = StreamResult<()>> {
        let deferred = self.write_with_deferred(chunk);
        drive_with(self.stream.reactor.clone(), deferred.once())
    }

    /// https://streams.spec.whatwg.org/#writable-stream-default-writer-write
    pub(crate) fn write_with_deferred(&self, chunk: T) -> Deferred<()> {
        if self.released.get() {
            return Deferred::rejected(StreamError::type_error(
                "Cannot write to a stream using a released writer",
            ));
        }
        let deferred = {
            let mut core = self.stream.core.borrow_mut();
            if let WritableState::Errored(error) = &core.state {
                return Deferred::rejected(error.clone());
            }
            if core.close_queued_or_in_flight() || matches!(core.state, WritableState::Closed) {
                return Deferred::rejected(StreamError::type_error(
                    "The stream is closing or closed and cannot be written to",
                ));
            }
            if let WritableState::Erroring(error) = &core.state {
                return Deferred::rejected(error.clone());
            }
            let deferred = Deferred::new();
            core.write_requests.push_back(deferred.clone());
            deferred
        };
        default_controller::write(&self.stream, chunk);
        deferred
    }

    /// https://streams.spec.whatwg.org/#default-writer-close
    pub fn close(&self) -> impl Future<Output = StreamResult<()>> {
        let deferred = if self.released.get() {
            Deferred::rejected(StreamError::type_error(
                "Cannot close a stream using a released writer",
            ))
        } else {
            writable::close_internal(&self.stream)
        };
        drive_with(self.stream.reactor.clone(), deferred.once())
    }

    /// https://streams.spec.whatwg.org/#default-writer-abort
    pub fn abort(&self, reason: StreamError) -> impl Future<Output = StreamResult<()>> {
        let deferred = if self.released.get() {
            Deferred::rejected(StreamError::type_error(
                "Cannot abort a stream using a released writer",
            ))
        } else {
            writable::abort_internal(&self.stream, Some(reason))
        };
        drive_with(self.stream.reactor.clone(), deferred.once())
    }

    /// Settles when the stream has room for another chunk; rejects when the
    /// stream errors.
    /// https://streams.spec.whatwg.org/#default-writer-ready
    pub fn ready(&self) -> impl Future<Output = StreamResult<()>> {
        drive_with(self.stream.reactor.clone(), self.ready_deferred().settled())
    }

    pub(crate) fn ready_deferred(&self) -> Deferred<()> {
        self.shared.ready.borrow().clone()
    }

    /// https://streams.spec.whatwg.org/#default-writer-closed
    pub fn closed(&self) -> impl Future<Output = StreamResult<()>> {
        drive_with(
            self.stream.reactor.clone(),
            self.closed_deferred().settled(),
        )
    }

    pub(crate) fn closed_deferred(&self) -> Deferred<()> {
        self.shared.closed.borrow().clone()
    }

    /// Room left before the stream applies backpressure; `None` when the
    /// stream is errored or erroring.
    /// https://streams.spec.whatwg.org/#default-writer-desired-size
    pub fn desired_size(&self) -> StreamResult<Option<f64>> {
        if self.released.get() {
            return Err(StreamError::type_error(
                "Cannot query desiredSize of a stream using a released writer",
            ));
        }
        Ok(default_controller::writer_desired_size(
            &self.stream.core.borrow(),
        ))
    }

    /// Closes the destination unless it is already closing or settled;
    /// errors pass through. Backing for pipes propagating source closure.
    /// https://streams.spec.whatwg.org/#writable-stream-default-writer-close-with-error-propagation
    pub(crate) fn close_with_error_propagation(&self) -> Deferred<()> {
        {
            let core = self.stream.core.borrow();
            if core.close_queued_or_in_flight() || matches!(core.state, WritableState::Closed) {
                return Deferred::resolved(());
            }
            if let WritableState::Errored(error) = &core.state {
                return Deferred::rejected(error.clone());
            }
            debug_assert!(matches!(
                core.state,
                WritableState::Writable | WritableState::Erroring(_)
            ));
        }
        writable::close_internal(&self.stream)
    }

    /// Releases the stream's lock. The writer's `ready` and `closed`
    /// promises reject; writes already queued still reach the sink.
    /// https://streams.spec.whatwg.org/#default-writer-release-lock
    pub fn release_lock(&self) {
        if self.released.replace(true) {
            return;
        }
        let released = StreamError::type_error(
            "Writer was released and can no longer be used to monitor the stream's closedness",
        );
        self.shared.ensure_ready_rejected(released.clone());
        self.shared.ensure_closed_rejected(released);
        self.stream.core.borrow_mut().writer = None;
    }
}

impl<T: 'static> Drop for WritableStreamDefaultWriter<T> {
    fn drop(&mut self) {
        self.release_lock();
    }
}
