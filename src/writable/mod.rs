use std::{
    cell::RefCell,
    collections::VecDeque,
    future::Future,
    rc::Rc,
};

pub use default_controller::WritableStreamDefaultController;
pub use default_writer::WritableStreamDefaultWriter;
pub use sink::UnderlyingSink;

use default_controller::WritableControllerState;
use sink::{SinkAlgorithms, SinkStartClosure};

use crate::{
    error::StreamError,
    queuing_strategy::{QueuingStrategy, SizeAlgorithm},
    utils::{
        deferred::Deferred,
        reactor::{drive_with, upon_future, Reactor},
    },
    StreamResult,
};

pub(crate) mod default_controller;
mod default_writer;
mod sink;

/// A destination accepting chunks of type `T`, with backpressure.
/// https://streams.spec.whatwg.org/#ws-class
pub struct WritableStream<T: 'static> {
    pub(crate) inner: Rc<WritableInner<T>>,
}

// Derived Clone would demand T: Clone.
impl<T: 'static> Clone for WritableStream<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

/// https://streams.spec.whatwg.org/#ws-internal-slots
pub(crate) enum WritableState {
    Writable,
    /// An error has been signalled but in-flight operations are still
    /// settling; the stream moves to `Errored` once they have.
    Erroring(StreamError),
    Errored(StreamError),
    Closed,
}

/// An abort requested while the sink was still busy; honored once the
/// stream finishes erroring.
/// https://streams.spec.whatwg.org/#pending-abort-request
pub(crate) struct PendingAbortRequest {
    deferred: Deferred<()>,
    reason: Option<StreamError>,
    was_already_erroring: bool,
}

/// Promise pair surfaced through the writer; lives apart from the core so
/// settling one never happens under a core borrow conflict.
pub(crate) struct WriterShared {
    pub(crate) ready: RefCell<Deferred<()>>,
    pub(crate) closed: RefCell<Deferred<()>>,
}

impl WriterShared {
    /// https://streams.spec.whatwg.org/#writable-stream-default-writer-ensure-ready-promise-rejected
    pub(crate) fn ensure_ready_rejected(&self, error: StreamError) {
        let slot = self.ready.borrow();
        if slot.is_pending() {
            slot.reject(error);
        } else {
            drop(slot);
            *self.ready.borrow_mut() = Deferred::rejected(error);
        }
        self.ready.borrow().mark_handled();
    }

    /// https://streams.spec.whatwg.org/#writable-stream-default-writer-ensure-closed-promise-rejected
    pub(crate) fn ensure_closed_rejected(&self, error: StreamError) {
        let slot = self.closed.borrow();
        if slot.is_pending() {
            slot.reject(error);
        } else {
            drop(slot);
            *self.closed.borrow_mut() = Deferred::rejected(error);
        }
        self.closed.borrow().mark_handled();
    }
}

pub(crate) struct WritableCore<T: 'static> {
    pub(crate) state: WritableState,
    pub(crate) backpressure: bool,
    pub(crate) close_request: Option<Deferred<()>>,
    pub(crate) in_flight_write_request: Option<Deferred<()>>,
    pub(crate) in_flight_close_request: Option<Deferred<()>>,
    pub(crate) pending_abort_request: Option<PendingAbortRequest>,
    pub(crate) write_requests: VecDeque<Deferred<()>>,
    pub(crate) writer: Option<Rc<WriterShared>>,
    pub(crate) controller: WritableControllerState<T>,
}

impl<T: 'static> WritableCore<T> {
    /// https://streams.spec.whatwg.org/#writable-stream-close-queued-or-in-flight
    pub(crate) fn close_queued_or_in_flight(&self) -> bool {
        self.close_request.is_some() || self.in_flight_close_request.is_some()
    }

    /// https://streams.spec.whatwg.org/#writable-stream-has-operation-marked-in-flight
    pub(crate) fn has_operation_marked_in_flight(&self) -> bool {
        self.in_flight_write_request.is_some() || self.in_flight_close_request.is_some()
    }

    pub(crate) fn stored_error(&self) -> Option<StreamError> {
        match &self.state {
            WritableState::Erroring(error) | WritableState::Errored(error) => Some(error.clone()),
            _ => None,
        }
    }

    /// https://streams.spec.whatwg.org/#writable-stream-update-backpressure
    pub(crate) fn update_backpressure(&mut self, backpressure: bool) {
        if backpressure == self.backpressure {
            return;
        }
        if let Some(writer) = &self.writer {
            if backpressure {
                *writer.ready.borrow_mut() = Deferred::new();
            } else {
                writer.ready.borrow().resolve(());
            }
        }
        self.backpressure = backpressure;
    }
}

pub(crate) struct WritableInner<T: 'static> {
    pub(crate) core: RefCell<WritableCore<T>>,
    pub(crate) reactor: Reactor,
}

impl<T: 'static> WritableStream<T> {
    /// Creates a stream over `sink` with a high water mark of 1 and a size
    /// function counting every chunk as 1.
    pub fn new(sink: impl UnderlyingSink<T> + 'static) -> Self {
        set_up(
            Reactor::new(),
            SinkAlgorithms::User(Rc::new(sink)),
            1.0,
            SizeAlgorithm::AlwaysOne,
        )
    }

    /// https://streams.spec.whatwg.org/#ws-constructor
    pub fn with_strategy(
        sink: impl UnderlyingSink<T> + 'static,
        strategy: QueuingStrategy<T>,
    ) -> StreamResult<Self> {
        let high_water_mark = QueuingStrategy::extract_high_water_mark(Some(&strategy), 1.0)?;
        let size_algorithm = QueuingStrategy::extract_size_algorithm(Some(&strategy));
        Ok(set_up(
            Reactor::new(),
            SinkAlgorithms::User(Rc::new(sink)),
            high_water_mark,
            size_algorithm,
        ))
    }

    /// The transform machinery builds its writable side from closures on a
    /// shared reactor.
    pub(crate) fn from_closures(
        reactor: Reactor,
        start: Option<SinkStartClosure<T>>,
        write: impl Fn(T) -> crate::AlgorithmFuture + 'static,
        close: impl FnOnce() -> crate::AlgorithmFuture + 'static,
        abort: impl FnOnce(StreamError) -> crate::AlgorithmFuture + 'static,
        high_water_mark: f64,
        size_algorithm: SizeAlgorithm<T>,
    ) -> Self {
        set_up(
            reactor,
            SinkAlgorithms::Closure {
                start: RefCell::new(start),
                write: Rc::new(write),
                close: Rc::new(RefCell::new(Some(Box::new(close)))),
                abort: Rc::new(RefCell::new(Some(Box::new(abort)))),
            },
            high_water_mark,
            size_algorithm,
        )
    }

    /// https://streams.spec.whatwg.org/#ws-locked
    pub fn locked(&self) -> bool {
        self.inner.core.borrow().writer.is_some()
    }

    /// Closes the stream, flushing queued writes into the sink first.
    /// https://streams.spec.whatwg.org/#ws-close
    pub fn close(&self) -> impl Future<Output = StreamResult<()>> {
        let deferred = if self.locked() {
            Deferred::rejected(StreamError::type_error(
                "Cannot close a stream locked to a writer",
            ))
        } else {
            close_internal(&self.inner)
        };
        drive_with(self.inner.reactor.clone(), deferred.once())
    }

    /// Errors the stream immediately, discarding queued writes.
    /// https://streams.spec.whatwg.org/#ws-abort
    pub fn abort(&self, reason: StreamError) -> impl Future<Output = StreamResult<()>> {
        let deferred = if self.locked() {
            Deferred::rejected(StreamError::type_error(
                "Cannot abort a stream locked to a writer",
            ))
        } else {
            abort_internal(&self.inner, Some(reason))
        };
        drive_with(self.inner.reactor.clone(), deferred.once())
    }

    /// https://streams.spec.whatwg.org/#ws-get-writer
    pub fn get_writer(&self) -> StreamResult<WritableStreamDefaultWriter<T>> {
        acquire_writer(&self.inner)
    }
}

/// https://streams.spec.whatwg.org/#writable-set-up
fn set_up<T: 'static>(
    reactor: Reactor,
    algorithms: SinkAlgorithms<T>,
    high_water_mark: f64,
    size_algorithm: SizeAlgorithm<T>,
) -> WritableStream<T> {
    let inner = Rc::new(WritableInner {
        core: RefCell::new(WritableCore {
            state: WritableState::Writable,
            // Empty queue: desired size is exactly the high water mark.
            backpressure: high_water_mark <= 0.0,
            close_request: None,
            in_flight_write_request: None,
            in_flight_close_request: None,
            pending_abort_request: None,
            write_requests: VecDeque::new(),
            writer: None,
            controller: WritableControllerState::new(
                high_water_mark,
                size_algorithm,
                // Clones drop the start closure; only `algorithms` below may
                // still run it.
                algorithms.clone(),
            ),
        }),
        reactor,
    });

    let controller = WritableStreamDefaultController {
        inner: Rc::clone(&inner),
    };
    let start = algorithms.start(controller);
    let start_inner = Rc::clone(&inner);
    upon_future(&inner.reactor, start, move |outcome| {
        start_inner.core.borrow_mut().controller.started = true;
        match outcome {
            Ok(()) => default_controller::advance_queue_if_needed(&start_inner),
            Err(error) => deal_with_rejection(&start_inner, error),
        }
    });

    WritableStream { inner }
}

pub(crate) fn acquire_writer<T: 'static>(
    inner: &Rc<WritableInner<T>>,
) -> StreamResult<WritableStreamDefaultWriter<T>> {
    let mut core = inner.core.borrow_mut();
    if core.writer.is_some() {
        return Err(StreamError::type_error(
            "The stream is already locked to a writer",
        ));
    }
    let (ready, closed) = match &core.state {
        WritableState::Writable => {
            let ready = if !core.close_queued_or_in_flight() && core.backpressure {
                Deferred::new()
            } else {
                Deferred::resolved(())
            };
            (ready, Deferred::new())
        }
        WritableState::Erroring(error) => {
            let ready = Deferred::rejected(error.clone());
            ready.mark_handled();
            (ready, Deferred::new())
        }
        WritableState::Closed => (Deferred::resolved(()), Deferred::resolved(())),
        WritableState::Errored(error) => {
            let ready = Deferred::rejected(error.clone());
            ready.mark_handled();
            let closed = Deferred::rejected(error.clone());
            closed.mark_handled();
            (ready, closed)
        }
    };
    let shared = Rc::new(WriterShared {
        ready: RefCell::new(ready),
        closed: RefCell::new(closed),
    });
    core.writer = Some(Rc::clone(&shared));
    Ok(WritableStreamDefaultWriter::new(Rc::clone(inner), shared))
}

// State peeks for the pipe machinery.

pub(crate) fn is_writable<T: 'static>(inner: &Rc<WritableInner<T>>) -> bool {
    matches!(inner.core.borrow().state, WritableState::Writable)
}

pub(crate) fn close_queued_or_in_flight<T: 'static>(inner: &Rc<WritableInner<T>>) -> bool {
    inner.core.borrow().close_queued_or_in_flight()
}

pub(crate) fn is_closed_or_closing<T: 'static>(inner: &Rc<WritableInner<T>>) -> bool {
    let core = inner.core.borrow();
    core.close_queued_or_in_flight() || matches!(core.state, WritableState::Closed)
}

pub(crate) fn erroring_error<T: 'static>(inner: &Rc<WritableInner<T>>) -> Option<StreamError> {
    match &inner.core.borrow().state {
        WritableState::Erroring(error) => Some(error.clone()),
        _ => None,
    }
}

pub(crate) fn stored_error_of<T: 'static>(inner: &Rc<WritableInner<T>>) -> Option<StreamError> {
    match &inner.core.borrow().state {
        WritableState::Errored(error) => Some(error.clone()),
        _ => None,
    }
}

/// https://streams.spec.whatwg.org/#writable-stream-abort
pub(crate) fn abort_internal<T: 'static>(
    inner: &Rc<WritableInner<T>>,
    reason: Option<StreamError>,
) -> Deferred<()> {
    let signal = {
        let core = inner.core.borrow();
        if matches!(
            core.state,
            WritableState::Closed | WritableState::Errored(_)
        ) {
            return Deferred::resolved(());
        }
        core.controller.abort_controller.signal()
    };
    let signal_reason = reason
        .clone()
        .unwrap_or_else(StreamError::aborted_default);
    // Abort callbacks (sinks watching the controller's signal) run here and
    // may themselves settle the stream.
    signal.abort_with(signal_reason.clone());

    let (deferred, start) = {
        let mut core = inner.core.borrow_mut();
        if matches!(
            core.state,
            WritableState::Closed | WritableState::Errored(_)
        ) {
            return Deferred::resolved(());
        }
        if let Some(pending) = &core.pending_abort_request {
            return pending.deferred.clone();
        }
        let was_already_erroring = matches!(core.state, WritableState::Erroring(_));
        let deferred = Deferred::new();
        core.pending_abort_request = Some(PendingAbortRequest {
            deferred: deferred.clone(),
            reason: if was_already_erroring { None } else { reason },
            was_already_erroring,
        });
        (deferred, !was_already_erroring)
    };
    if start {
        start_erroring(inner, signal_reason);
    }
    deferred
}

/// https://streams.spec.whatwg.org/#writable-stream-close
pub(crate) fn close_internal<T: 'static>(inner: &Rc<WritableInner<T>>) -> Deferred<()> {
    let deferred = {
        let mut core = inner.core.borrow_mut();
        if matches!(
            core.state,
            WritableState::Closed | WritableState::Errored(_)
        ) {
            return Deferred::rejected(StreamError::type_error(
                "The stream is not in the writable state and cannot be closed",
            ));
        }
        if core.close_queued_or_in_flight() {
            return Deferred::rejected(StreamError::type_error(
                "Cannot close an already-closing stream",
            ));
        }
        let deferred = Deferred::new();
        core.close_request = Some(deferred.clone());
        if core.backpressure && matches!(core.state, WritableState::Writable) {
            if let Some(writer) = &core.writer {
                writer.ready.borrow().resolve(());
            }
        }
        default_controller::enqueue_close_sentinel(&mut core.controller);
        deferred
    };
    default_controller::advance_queue_if_needed(inner);
    deferred
}

/// https://streams.spec.whatwg.org/#writable-stream-start-erroring
pub(crate) fn start_erroring<T: 'static>(inner: &Rc<WritableInner<T>>, reason: StreamError) {
    let finish = {
        let mut core = inner.core.borrow_mut();
        debug_assert!(matches!(core.state, WritableState::Writable));
        tracing::trace!(%reason, "writable stream erroring");
        core.state = WritableState::Erroring(reason.clone());
        if let Some(writer) = &core.writer {
            writer.ensure_ready_rejected(reason);
        }
        core.controller.started && !core.has_operation_marked_in_flight()
    };
    if finish {
        finish_erroring(inner);
    }
}

/// https://streams.spec.whatwg.org/#writable-stream-finish-erroring
pub(crate) fn finish_erroring<T: 'static>(inner: &Rc<WritableInner<T>>) {
    let abort = {
        let mut core = inner.core.borrow_mut();
        let error = match &core.state {
            WritableState::Erroring(error) => error.clone(),
            _ => unreachable!("finish erroring outside the erroring state"),
        };
        debug_assert!(!core.has_operation_marked_in_flight());
        tracing::trace!(%error, "writable stream errored");
        core.state = WritableState::Errored(error.clone());
        core.controller.queue.reset_queue();
        for request in core.write_requests.drain(..) {
            request.reject(error.clone());
        }
        match core.pending_abort_request.take() {
            None => {
                reject_close_and_closed_promise_if_needed(&mut core);
                return;
            }
            Some(pending) if pending.was_already_erroring => {
                pending.deferred.reject(error);
                reject_close_and_closed_promise_if_needed(&mut core);
                return;
            }
            Some(pending) => {
                let algorithms = core.controller.algorithms.take();
                let reason = pending
                    .reason
                    .clone()
                    .unwrap_or_else(StreamError::aborted_default);
                (pending.deferred, algorithms, reason)
            }
        }
    };
    let (deferred, algorithms, reason) = abort;
    let fut = match algorithms {
        Some(algorithms) => algorithms.abort(reason),
        None => Box::pin(std::future::ready(Ok(()))),
    };
    let finish_inner = Rc::clone(inner);
    upon_future(&inner.reactor, fut, move |outcome| {
        deferred.settle(outcome);
        let mut core = finish_inner.core.borrow_mut();
        reject_close_and_closed_promise_if_needed(&mut core);
    });
}

/// https://streams.spec.whatwg.org/#writable-stream-reject-close-and-closed-promise-if-needed
fn reject_close_and_closed_promise_if_needed<T: 'static>(core: &mut WritableCore<T>) {
    let error = core
        .stored_error()
        .expect("stream must be errored at this point");
    if let Some(close_request) = core.close_request.take() {
        debug_assert!(core.in_flight_close_request.is_none());
        close_request.reject(error.clone());
    }
    if let Some(writer) = &core.writer {
        writer.ensure_closed_rejected(error);
    }
}

/// https://streams.spec.whatwg.org/#writable-stream-deal-with-rejection
pub(crate) fn deal_with_rejection<T: 'static>(inner: &Rc<WritableInner<T>>, error: StreamError) {
    let writable = matches!(inner.core.borrow().state, WritableState::Writable);
    if writable {
        start_erroring(inner, error);
    } else {
        finish_erroring(inner);
    }
}

/// https://streams.spec.whatwg.org/#writable-stream-finish-in-flight-write
pub(crate) fn finish_in_flight_write<T: 'static>(core: &mut WritableCore<T>) {
    core.in_flight_write_request
        .take()
        .expect("write must be in flight")
        .resolve(());
}

/// https://streams.spec.whatwg.org/#writable-stream-finish-in-flight-write-with-error
pub(crate) fn finish_in_flight_write_with_error<T: 'static>(
    inner: &Rc<WritableInner<T>>,
    error: StreamError,
) {
    {
        let mut core = inner.core.borrow_mut();
        core.in_flight_write_request
            .take()
            .expect("write must be in flight")
            .reject(error.clone());
    }
    deal_with_rejection(inner, error);
}

/// https://streams.spec.whatwg.org/#writable-stream-finish-in-flight-close
pub(crate) fn finish_in_flight_close<T: 'static>(inner: &Rc<WritableInner<T>>) {
    let mut core = inner.core.borrow_mut();
    core.in_flight_close_request
        .take()
        .expect("close must be in flight")
        .resolve(());
    if matches!(core.state, WritableState::Erroring(_)) {
        // The close won the race against the pending abort.
        if let Some(pending) = core.pending_abort_request.take() {
            pending.deferred.resolve(());
        }
    }
    tracing::trace!("writable stream closed");
    core.state = WritableState::Closed;
    if let Some(writer) = &core.writer {
        writer.closed.borrow().resolve(());
    }
}

/// https://streams.spec.whatwg.org/#writable-stream-finish-in-flight-close-with-error
pub(crate) fn finish_in_flight_close_with_error<T: 'static>(
    inner: &Rc<WritableInner<T>>,
    error: StreamError,
) {
    {
        let mut core = inner.core.borrow_mut();
        core.in_flight_close_request
            .take()
            .expect("close must be in flight")
            .reject(error.clone());
        if let Some(pending) = core.pending_abort_request.take() {
            pending.deferred.reject(error.clone());
        }
    }
    deal_with_rejection(inner, error);
}

#[cfg(test)]
mod tests;
