use std::rc::Rc;

use crate::{
    abort::{AbortController, AbortSignal},
    error::StreamError,
    queuing_strategy::SizeAlgorithm,
    utils::{queue::QueueWithSizes, reactor::upon_future},
    writable::{
        self, sink::SinkAlgorithms, WritableCore, WritableInner, WritableState,
    },
};

/// A queued sink operation. The chunk is taken out of its slot when handed
/// to the sink; the entry itself stays queued until the write settles so the
/// queue's total size keeps counting it.
pub(crate) enum WriteEntry<T> {
    Chunk(Option<T>),
    Close,
}

/// https://streams.spec.whatwg.org/#ws-default-controller-internal-slots
pub(crate) struct WritableControllerState<T: 'static> {
    pub(crate) queue: QueueWithSizes<WriteEntry<T>>,
    pub(crate) started: bool,
    pub(crate) strategy_hwm: f64,
    pub(crate) strategy_size: SizeAlgorithm<T>,
    pub(crate) abort_controller: AbortController,
    pub(crate) algorithms: Option<SinkAlgorithms<T>>,
}

impl<T: 'static> WritableControllerState<T> {
    pub(crate) fn new(
        strategy_hwm: f64,
        strategy_size: SizeAlgorithm<T>,
        algorithms: SinkAlgorithms<T>,
    ) -> Self {
        Self {
            queue: QueueWithSizes::new(),
            started: false,
            strategy_hwm,
            strategy_size,
            abort_controller: AbortController::new(),
            algorithms: Some(algorithms),
        }
    }

    /// https://streams.spec.whatwg.org/#writable-stream-default-controller-get-desired-size
    pub(crate) fn desired_size(&self) -> f64 {
        self.strategy_hwm - self.queue.total_size()
    }

    /// https://streams.spec.whatwg.org/#writable-stream-default-controller-get-backpressure
    pub(crate) fn get_backpressure(&self) -> bool {
        self.desired_size() <= 0.0
    }
}

/// The handle given to sink callbacks.
/// https://streams.spec.whatwg.org/#ws-default-controller-class
pub struct WritableStreamDefaultController<T: 'static> {
    pub(crate) inner: Rc<WritableInner<T>>,
}

impl<T: 'static> Clone for WritableStreamDefaultController<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: 'static> WritableStreamDefaultController<T> {
    /// Errors the stream; queued writes are dropped and further writes
    /// reject.
    /// https://streams.spec.whatwg.org/#ws-default-controller-error
    pub fn error(&self, error: StreamError) {
        if !matches!(self.inner.core.borrow().state, WritableState::Writable) {
            return;
        }
        controller_error(&self.inner, error);
    }

    /// Aborting the stream aborts this signal; sinks with long-running
    /// writes observe it to stop early.
    /// https://streams.spec.whatwg.org/#ws-default-controller-signal
    pub fn signal(&self) -> AbortSignal {
        self.inner.core.borrow().controller.abort_controller.signal()
    }
}

/// https://streams.spec.whatwg.org/#writable-stream-default-controller-close
pub(crate) fn enqueue_close_sentinel<T: 'static>(controller: &mut WritableControllerState<T>) {
    controller
        .queue
        .enqueue_value_with_size(WriteEntry::Close, 0.0)
        .expect("close sentinel has size zero");
}

/// https://streams.spec.whatwg.org/#writable-stream-default-controller-write
pub(crate) fn write<T: 'static>(inner: &Rc<WritableInner<T>>, chunk: T) {
    let size_algorithm = inner.core.borrow().controller.strategy_size.clone();
    let size = size_algorithm.call(&chunk);
    let enqueue_error = {
        let mut core = inner.core.borrow_mut();
        match core
            .controller
            .queue
            .enqueue_value_with_size(WriteEntry::Chunk(Some(chunk)), size)
        {
            Err(error) => Some(error),
            Ok(()) => {
                if !core.close_queued_or_in_flight()
                    && matches!(core.state, WritableState::Writable)
                {
                    let backpressure = core.controller.get_backpressure();
                    core.update_backpressure(backpressure);
                }
                None
            }
        }
    };
    if let Some(error) = enqueue_error {
        error_if_needed(inner, error);
        return;
    }
    advance_queue_if_needed(inner);
}

/// https://streams.spec.whatwg.org/#writable-stream-default-controller-advance-queue-if-needed
pub(crate) fn advance_queue_if_needed<T: 'static>(inner: &Rc<WritableInner<T>>) {
    enum Next {
        Nothing,
        FinishErroring,
        ProcessClose,
        ProcessWrite,
    }
    let next = {
        let core = inner.core.borrow();
        if !core.controller.started || core.in_flight_write_request.is_some() {
            Next::Nothing
        } else if matches!(core.state, WritableState::Erroring(_)) {
            Next::FinishErroring
        } else if core.controller.queue.is_empty() {
            Next::Nothing
        } else {
            match core.controller.queue.peek_value() {
                Some(WriteEntry::Close) => Next::ProcessClose,
                _ => Next::ProcessWrite,
            }
        }
    };
    match next {
        Next::Nothing => {}
        Next::FinishErroring => writable::finish_erroring(inner),
        Next::ProcessClose => process_close(inner),
        Next::ProcessWrite => process_write(inner),
    }
}

/// https://streams.spec.whatwg.org/#writable-stream-default-controller-process-close
fn process_close<T: 'static>(inner: &Rc<WritableInner<T>>) {
    let algorithms = {
        let mut core = inner.core.borrow_mut();
        core.in_flight_close_request = Some(
            core.close_request
                .take()
                .expect("close must have been requested"),
        );
        core.controller.queue.dequeue_value();
        debug_assert!(core.controller.queue.is_empty());
        core.controller.algorithms.take()
    };
    let fut = match algorithms {
        Some(algorithms) => algorithms.close(),
        None => Box::pin(std::future::ready(Ok(()))),
    };
    let close_inner = Rc::clone(inner);
    upon_future(&inner.reactor, fut, move |outcome| match outcome {
        Ok(()) => writable::finish_in_flight_close(&close_inner),
        Err(error) => writable::finish_in_flight_close_with_error(&close_inner, error),
    });
}

/// https://streams.spec.whatwg.org/#writable-stream-default-controller-process-write
fn process_write<T: 'static>(inner: &Rc<WritableInner<T>>) {
    let (chunk, algorithms) = {
        let mut core = inner.core.borrow_mut();
        core.in_flight_write_request = Some(
            core.write_requests
                .pop_front()
                .expect("a queued chunk always has a write request"),
        );
        let chunk = match core.controller.queue.peek_value_mut() {
            Some(WriteEntry::Chunk(slot)) => {
                slot.take().expect("chunk already handed to the sink")
            }
            _ => unreachable!("process write without a queued chunk"),
        };
        (chunk, core.controller.algorithms.clone())
    };
    let fut = match algorithms {
        Some(algorithms) => algorithms.write(
            chunk,
            WritableStreamDefaultController {
                inner: Rc::clone(inner),
            },
        ),
        None => Box::pin(std::future::ready(Ok(()))),
    };
    let write_inner = Rc::clone(inner);
    upon_future(&inner.reactor, fut, move |outcome| match outcome {
        Ok(()) => {
            {
                let mut core = write_inner.core.borrow_mut();
                writable::finish_in_flight_write(&mut core);
                core.controller.queue.dequeue_value();
                if !core.close_queued_or_in_flight()
                    && matches!(core.state, WritableState::Writable)
                {
                    let backpressure = core.controller.get_backpressure();
                    core.update_backpressure(backpressure);
                }
            }
            advance_queue_if_needed(&write_inner);
        }
        Err(error) => {
            {
                let mut core = write_inner.core.borrow_mut();
                if matches!(core.state, WritableState::Writable) {
                    core.controller.algorithms = None;
                }
            }
            writable::finish_in_flight_write_with_error(&write_inner, error);
        }
    });
}

/// https://streams.spec.whatwg.org/#writable-stream-default-controller-error
pub(crate) fn controller_error<T: 'static>(inner: &Rc<WritableInner<T>>, error: StreamError) {
    inner.core.borrow_mut().controller.algorithms = None;
    writable::start_erroring(inner, error);
}

/// https://streams.spec.whatwg.org/#writable-stream-default-controller-error-if-needed
pub(crate) fn error_if_needed<T: 'static>(inner: &Rc<WritableInner<T>>, error: StreamError) {
    if !matches!(inner.core.borrow().state, WritableState::Writable) {
        return;
    }
    controller_error(inner, error);
}

/// https://streams.spec.whatwg.org/#writable-stream-default-writer-get-desired-size
pub(crate) fn writer_desired_size<T: 'static>(core: &WritableCore<T>) -> Option<f64> {
    match &core.state {
        WritableState::Errored(_) | WritableState::Erroring(_) => None,
        WritableState::Closed => Some(0.0),
        WritableState::Writable => Some(core.controller.desired_size()),
    }
}
