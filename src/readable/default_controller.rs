use std::rc::Rc;

use crate::{
    error::StreamError,
    queuing_strategy::SizeAlgorithm,
    readable::{
        source::DefaultSourceAlgorithms, ControllerState, PullState, ReadRequest, ReadableCore,
        ReadableInner, ReaderState,
    },
    utils::{queue::QueueWithSizes, reactor::upon_future},
    StreamResult,
};

/// https://streams.spec.whatwg.org/#rs-default-controller-class
pub(crate) struct DefaultControllerState<T> {
    pub queue: QueueWithSizes<T>,
    pub started: bool,
    pub close_requested: bool,
    pub pull_state: PullState,
    pub strategy_hwm: f64,
    pub strategy_size: SizeAlgorithm<T>,
    pub algorithms: Option<DefaultSourceAlgorithms<T>>,
}

impl<T> DefaultControllerState<T> {
    pub fn new(
        algorithms: DefaultSourceAlgorithms<T>,
        strategy_hwm: f64,
        strategy_size: SizeAlgorithm<T>,
    ) -> Self {
        Self {
            queue: QueueWithSizes::new(),
            started: false,
            close_requested: false,
            pull_state: PullState::Idle,
            strategy_hwm,
            strategy_size,
            algorithms: Some(algorithms),
        }
    }

    /// https://streams.spec.whatwg.org/#readable-stream-default-controller-clear-algorithms
    pub fn clear_algorithms(&mut self) -> Option<DefaultSourceAlgorithms<T>> {
        self.strategy_size = SizeAlgorithm::AlwaysOne;
        self.algorithms.take()
    }
}

fn can_close_or_enqueue<T>(state: &super::ReadableState, c: &DefaultControllerState<T>) -> bool {
    !c.close_requested && state.is_readable()
}

/// https://streams.spec.whatwg.org/#readable-stream-default-controller-get-desired-size
fn desired_size<T>(state: &super::ReadableState, c: &DefaultControllerState<T>) -> Option<f64> {
    match state {
        super::ReadableState::Errored(_) => None,
        super::ReadableState::Closed => Some(0.0),
        super::ReadableState::Readable => Some(c.strategy_hwm - c.queue.total_size()),
    }
}

/// https://streams.spec.whatwg.org/#readable-stream-default-controller-should-call-pull
fn should_call_pull<T: 'static>(core: &ReadableCore<T>, c: &DefaultControllerState<T>) -> bool {
    if !can_close_or_enqueue(&core.state, c) || !c.started {
        return false;
    }
    if ReadableInner::has_default_reader(core) && ReadableInner::num_read_requests(core) > 0 {
        return true;
    }
    desired_size(&core.state, c).expect("desired size of a readable stream") > 0.0
}

pub(crate) fn mark_started<T: 'static>(inner: &Rc<ReadableInner<T>>) {
    let mut core = inner.core.borrow_mut();
    if let ControllerState::Default(c) = &mut core.controller {
        c.started = true;
    }
}

/// https://streams.spec.whatwg.org/#readable-stream-default-controller-call-pull-if-needed
pub(crate) fn pull_if_needed<T: 'static>(inner: &Rc<ReadableInner<T>>) {
    let algorithms = {
        let mut core = inner.core.borrow_mut();
        let core = &mut *core;
        {
            let ControllerState::Default(c) = &core.controller else {
                return;
            };
            if !should_call_pull(core, c) {
                return;
            }
        }
        let ControllerState::Default(c) = &mut core.controller else {
            return;
        };
        match c.pull_state {
            PullState::Idle => c.pull_state = PullState::InFlight,
            // A pull is already in flight; queue exactly one more.
            PullState::InFlight | PullState::InFlightAndQueued => {
                c.pull_state = PullState::InFlightAndQueued;
                return;
            }
        }
        match &c.algorithms {
            Some(algorithms) => algorithms.clone(),
            None => return,
        }
    };

    let controller = ReadableStreamDefaultController {
        inner: Rc::clone(inner),
    };
    let fut = algorithms.pull(controller);
    let reactor = inner.reactor.clone();
    let inner = Rc::clone(inner);
    upon_future(&reactor, fut, move |outcome| match outcome {
        Ok(()) => {
            let pull_again = {
                let mut core = inner.core.borrow_mut();
                let ControllerState::Default(c) = &mut core.controller else {
                    return;
                };
                let again = c.pull_state == PullState::InFlightAndQueued;
                c.pull_state = PullState::Idle;
                again
            };
            if pull_again {
                pull_if_needed(&inner);
            }
        }
        Err(error) => self::error(&inner, error),
    });
}

/// https://streams.spec.whatwg.org/#readable-stream-default-controller-error
pub(crate) fn error<T: 'static>(inner: &Rc<ReadableInner<T>>, error: StreamError) {
    let mut core = inner.core.borrow_mut();
    if !core.state.is_readable() {
        return;
    }
    if let ControllerState::Default(c) = &mut core.controller {
        c.queue.reset_queue();
        c.clear_algorithms();
    }
    ReadableInner::error(&mut core, error);
}

/// https://streams.spec.whatwg.org/#readable-stream-default-controller-close
///
/// Callers check `can_close_or_enqueue` first; a redundant call is a no-op.
pub(crate) fn close<T: 'static>(inner: &Rc<ReadableInner<T>>) {
    let mut core = inner.core.borrow_mut();
    let core = &mut *core;
    let ControllerState::Default(c) = &mut core.controller else {
        return;
    };
    if !can_close_or_enqueue(&core.state, c) {
        return;
    }
    c.close_requested = true;
    let drained = c.queue.is_empty();
    if drained {
        c.clear_algorithms();
        ReadableInner::close(core);
    }
}

/// https://streams.spec.whatwg.org/#readable-stream-default-controller-enqueue
pub(crate) fn enqueue<T: 'static>(inner: &Rc<ReadableInner<T>>, chunk: T) -> StreamResult<()> {
    {
        let mut core = inner.core.borrow_mut();
        let core = &mut *core;
        let ControllerState::Default(c) = &mut core.controller else {
            return Err(StreamError::type_error(
                "Cannot enqueue a plain chunk into a byte stream controller",
            ));
        };
        if !can_close_or_enqueue(&core.state, c) {
            return Err(StreamError::type_error(
                "The stream is not in a state that permits enqueue",
            ));
        }
        let deliver_directly = matches!(
            &core.reader,
            Some(ReaderState::Default(reader)) if !reader.read_requests.is_empty()
        );
        if deliver_directly {
            ReadableInner::fulfill_read_request(core, chunk, false);
        } else {
            let size = c.strategy_size.call(&chunk);
            if let Err(error) = c.queue.enqueue_value_with_size(chunk, size) {
                c.queue.reset_queue();
                c.clear_algorithms();
                ReadableInner::error(core, error.clone());
                return Err(error);
            }
        }
    }
    pull_if_needed(inner);
    Ok(())
}

/// https://streams.spec.whatwg.org/#rs-default-controller-private-pull
pub(crate) fn pull_steps<T: 'static>(inner: &Rc<ReadableInner<T>>, request: Box<dyn ReadRequest<T>>) {
    {
        let mut core = inner.core.borrow_mut();
        let core = &mut *core;
        let ControllerState::Default(c) = &mut core.controller else {
            return;
        };
        if !c.queue.is_empty() {
            let chunk = c.queue.dequeue_value();
            if c.close_requested && c.queue.is_empty() {
                c.clear_algorithms();
                ReadableInner::close(core);
            }
            request.chunk_steps(chunk);
        } else {
            let Some(ReaderState::Default(reader)) = core.reader.as_mut() else {
                panic!("default pull steps without a default reader");
            };
            reader.read_requests.push_back(request);
        }
    }
    pull_if_needed(inner);
}

/// Handle given to the underlying source's start and pull callbacks.
/// https://streams.spec.whatwg.org/#rs-default-controller-class
pub struct ReadableStreamDefaultController<T> {
    pub(crate) inner: Rc<ReadableInner<T>>,
}

impl<T> Clone for ReadableStreamDefaultController<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: 'static> ReadableStreamDefaultController<T> {
    /// Space left in the queue before backpressure, in strategy units. `None`
    /// once the stream has errored.
    /// https://streams.spec.whatwg.org/#rs-default-controller-desired-size
    pub fn desired_size(&self) -> Option<f64> {
        let core = self.inner.core.borrow();
        match &core.controller {
            ControllerState::Default(c) => desired_size(&core.state, c),
            ControllerState::Byte(_) => None,
        }
    }

    /// https://streams.spec.whatwg.org/#rs-default-controller-enqueue
    pub fn enqueue(&self, chunk: T) -> StreamResult<()> {
        enqueue(&self.inner, chunk)
    }

    /// Signals that no further chunks will be enqueued. Buffered chunks are
    /// still delivered before the stream closes.
    /// https://streams.spec.whatwg.org/#rs-default-controller-close
    pub fn close(&self) -> StreamResult<()> {
        if !self.can_close_or_enqueue() {
            return Err(StreamError::type_error(
                "The stream is not in a state that permits close",
            ));
        }
        close(&self.inner);
        Ok(())
    }

    /// https://streams.spec.whatwg.org/#rs-default-controller-error
    pub fn error(&self, error: StreamError) {
        self::error(&self.inner, error);
    }

    pub(crate) fn can_close_or_enqueue(&self) -> bool {
        let core = self.inner.core.borrow();
        match &core.controller {
            ControllerState::Default(c) => can_close_or_enqueue(&core.state, c),
            ControllerState::Byte(_) => false,
        }
    }

    /// https://streams.spec.whatwg.org/#readable-stream-default-controller-has-backpressure
    pub(crate) fn has_backpressure(&self) -> bool {
        let core = self.inner.core.borrow();
        match &core.controller {
            ControllerState::Default(c) => !should_call_pull(&*core, c),
            ControllerState::Byte(_) => true,
        }
    }

    pub(crate) fn stored_error(&self) -> Option<StreamError> {
        self.inner.core.borrow().state.stored_error()
    }
}
