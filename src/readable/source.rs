use std::{cell::RefCell, rc::Rc};

use crate::{
    readable::{byte_controller::ReadableByteStreamController, ReadableStreamDefaultController},
    AlgorithmFuture, StreamError,
};

fn resolved() -> AlgorithmFuture {
    Box::pin(std::future::ready(Ok(())))
}

/// The callbacks a host supplies when constructing a [`ReadableStream`].
/// https://streams.spec.whatwg.org/#underlying-source-api
///
/// All methods take `&self`; a source that needs mutable state wraps it in a
/// `Cell`/`RefCell` of its own.
///
/// [`ReadableStream`]: crate::ReadableStream
pub trait UnderlyingSource<T> {
    /// Called once during construction. The stream will not pull until the
    /// returned future resolves.
    fn start(&self, controller: ReadableStreamDefaultController<T>) -> AlgorithmFuture {
        let _ = controller;
        resolved()
    }

    /// Called whenever the stream wants more data. Not called again until
    /// the previous pull's future resolves.
    fn pull(&self, controller: ReadableStreamDefaultController<T>) -> AlgorithmFuture {
        let _ = controller;
        resolved()
    }

    /// Called when the consumer cancels the stream.
    fn cancel(&self, reason: StreamError) -> AlgorithmFuture {
        let _ = reason;
        resolved()
    }
}

/// The callbacks a host supplies when constructing a byte stream.
/// https://streams.spec.whatwg.org/#underlying-source-api
pub trait UnderlyingByteSource {
    fn start(&self, controller: ReadableByteStreamController) -> AlgorithmFuture {
        let _ = controller;
        resolved()
    }

    fn pull(&self, controller: ReadableByteStreamController) -> AlgorithmFuture {
        let _ = controller;
        resolved()
    }

    fn cancel(&self, reason: StreamError) -> AlgorithmFuture {
        let _ = reason;
        resolved()
    }

    /// When set, default reads on the stream allocate a buffer of this many
    /// bytes and present it to the source as a BYOB request.
    fn auto_allocate_chunk_size(&self) -> Option<usize> {
        None
    }
}

pub(crate) type StartClosure<T> =
    Box<dyn FnOnce(ReadableStreamDefaultController<T>) -> AlgorithmFuture>;
pub(crate) type PullClosure = Rc<dyn Fn() -> AlgorithmFuture>;
pub(crate) type CancelClosure = Rc<RefCell<Option<Box<dyn FnOnce(StreamError) -> AlgorithmFuture>>>>;

/// The pull/cancel pair driving a default controller: either a user-supplied
/// [`UnderlyingSource`] or closures bound by an internal construction site
/// (tee branches, the readable side of a transform).
pub(crate) enum DefaultSourceAlgorithms<T> {
    User(Rc<dyn UnderlyingSource<T>>),
    Closure {
        start: RefCell<Option<StartClosure<T>>>,
        pull: PullClosure,
        cancel: CancelClosure,
    },
}

impl<T> Clone for DefaultSourceAlgorithms<T> {
    fn clone(&self) -> Self {
        match self {
            Self::User(source) => Self::User(Rc::clone(source)),
            Self::Closure { pull, cancel, .. } => Self::Closure {
                // The start closure is consumed before the algorithms are
                // ever cloned out of the controller.
                start: RefCell::new(None),
                pull: Rc::clone(pull),
                cancel: Rc::clone(cancel),
            },
        }
    }
}

impl<T> DefaultSourceAlgorithms<T> {
    pub fn start(&self, controller: ReadableStreamDefaultController<T>) -> AlgorithmFuture {
        match self {
            Self::User(source) => source.start(controller),
            Self::Closure { start, .. } => match start.borrow_mut().take() {
                Some(start) => start(controller),
                None => resolved(),
            },
        }
    }

    pub fn pull(&self, controller: ReadableStreamDefaultController<T>) -> AlgorithmFuture {
        match self {
            Self::User(source) => source.pull(controller),
            Self::Closure { pull, .. } => pull(),
        }
    }

    pub fn cancel(&self, reason: StreamError) -> AlgorithmFuture {
        match self {
            Self::User(source) => source.cancel(reason),
            Self::Closure { cancel, .. } => {
                let cancel = cancel
                    .borrow_mut()
                    .take()
                    .expect("cancel algorithm must only be called once");
                cancel(reason)
            }
        }
    }
}

/// Byte controller algorithms are always stored pre-bound: construction
/// captures the controller handle in the pull closure, so the generic
/// controller plumbing never needs to name the concrete chunk type.
pub(crate) struct ByteSourceAlgorithms {
    pub pull: PullClosure,
    pub cancel: CancelClosure,
}

impl Clone for ByteSourceAlgorithms {
    fn clone(&self) -> Self {
        Self {
            pull: Rc::clone(&self.pull),
            cancel: Rc::clone(&self.cancel),
        }
    }
}

impl ByteSourceAlgorithms {
    pub fn new(
        pull: impl Fn() -> AlgorithmFuture + 'static,
        cancel: impl FnOnce(StreamError) -> AlgorithmFuture + 'static,
    ) -> Self {
        Self {
            pull: Rc::new(pull),
            cancel: Rc::new(RefCell::new(Some(Box::new(cancel)))),
        }
    }

    pub fn cancel(&self, reason: StreamError) -> AlgorithmFuture {
        let cancel = self
            .cancel
            .borrow_mut()
            .take()
            .expect("cancel algorithm must only be called once");
        cancel(reason)
    }
}
