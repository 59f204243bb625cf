use std::{cell::RefCell, rc::Rc};

use crate::{
    error::StreamError, writable::WritableStreamDefaultController, AlgorithmFuture,
};

fn resolved() -> AlgorithmFuture {
    Box::pin(std::future::ready(Ok(())))
}

/// A push-based destination for chunks of type `T`.
///
/// All callbacks default to completing immediately; implement the ones the
/// sink cares about. The engine calls `write` strictly in order, never before
/// the previous write's future has settled.
/// https://streams.spec.whatwg.org/#underlying-sink-api
pub trait UnderlyingSink<T> {
    /// Called once at construction, before any write.
    fn start(&self, controller: WritableStreamDefaultController<T>) -> AlgorithmFuture {
        let _ = controller;
        resolved()
    }

    fn write(&self, chunk: T, controller: WritableStreamDefaultController<T>) -> AlgorithmFuture {
        let _ = (chunk, controller);
        resolved()
    }

    /// Called once after the final write when the stream closes cleanly.
    fn close(&self) -> AlgorithmFuture {
        resolved()
    }

    /// Called at most once when the stream is aborted; `close` will not run.
    fn abort(&self, reason: StreamError) -> AlgorithmFuture {
        let _ = reason;
        resolved()
    }
}

pub(crate) type SinkStartClosure<T> =
    Box<dyn FnOnce(WritableStreamDefaultController<T>) -> AlgorithmFuture>;
pub(crate) type SinkWriteClosure<T> = Rc<dyn Fn(T) -> AlgorithmFuture>;
pub(crate) type SinkCloseClosure = Rc<RefCell<Option<Box<dyn FnOnce() -> AlgorithmFuture>>>>;
pub(crate) type SinkAbortClosure =
    Rc<RefCell<Option<Box<dyn FnOnce(StreamError) -> AlgorithmFuture>>>>;

/// The sink algorithms a writable stream was set up with. Either a user
/// [`UnderlyingSink`] or plain closures (the transform machinery builds its
/// writable side from closures).
pub(crate) enum SinkAlgorithms<T: 'static> {
    User(Rc<dyn UnderlyingSink<T>>),
    Closure {
        start: RefCell<Option<SinkStartClosure<T>>>,
        write: SinkWriteClosure<T>,
        close: SinkCloseClosure,
        abort: SinkAbortClosure,
    },
}

// Derived Clone would demand T: Clone. The start closure is intentionally not
// carried by clones; only the original handed to set-up may run it.
impl<T: 'static> Clone for SinkAlgorithms<T> {
    fn clone(&self) -> Self {
        match self {
            Self::User(sink) => Self::User(Rc::clone(sink)),
            Self::Closure {
                write,
                close,
                abort,
                ..
            } => Self::Closure {
                start: RefCell::new(None),
                write: Rc::clone(write),
                close: Rc::clone(close),
                abort: Rc::clone(abort),
            },
        }
    }
}

impl<T> SinkAlgorithms<T> {
    pub fn start(&self, controller: WritableStreamDefaultController<T>) -> AlgorithmFuture {
        match self {
            Self::User(sink) => sink.start(controller),
            Self::Closure { start, .. } => match start.borrow_mut().take() {
                Some(start) => start(controller),
                None => resolved(),
            },
        }
    }

    pub fn write(&self, chunk: T, controller: WritableStreamDefaultController<T>) -> AlgorithmFuture {
        match self {
            Self::User(sink) => sink.write(chunk, controller),
            Self::Closure { write, .. } => write(chunk),
        }
    }

    pub fn close(&self) -> AlgorithmFuture {
        match self {
            Self::User(sink) => sink.close(),
            Self::Closure { close, .. } => {
                let close = close
                    .borrow_mut()
                    .take()
                    .expect("close algorithm must only be called once");
                close()
            }
        }
    }

    pub fn abort(&self, reason: StreamError) -> AlgorithmFuture {
        match self {
            Self::User(sink) => sink.abort(reason),
            Self::Closure { abort, .. } => {
                let abort = abort
                    .borrow_mut()
                    .take()
                    .expect("abort algorithm must only be called once");
                abort(reason)
            }
        }
    }
}
