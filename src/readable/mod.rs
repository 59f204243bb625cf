use std::{any::Any, cell::RefCell, collections::VecDeque, future::Future, rc::Rc};

use crate::{
    error::StreamError,
    queuing_strategy::{QueuingStrategy, SizeAlgorithm},
    utils::{
        deferred::Deferred,
        reactor::{drive_with, upon_future, Reactor},
    },
    writable::WritableStream,
    StreamResult,
};

pub use byob_reader::ReadableStreamByobReader;
pub use byte_controller::{ByobRequest, ByteView, ReadableByteStreamController, ViewKind};
pub use default_controller::ReadableStreamDefaultController;
pub use default_reader::ReadableStreamDefaultReader;
pub use iterator::IntoStream;
pub use pipe::PipeOptions;
pub use source::{UnderlyingByteSource, UnderlyingSource};

use byte_controller::ByteControllerState;
use default_controller::DefaultControllerState;
use source::{ByteSourceAlgorithms, DefaultSourceAlgorithms, StartClosure};

mod byob_reader;
mod byte_controller;
pub(crate) mod default_controller;
mod default_reader;
mod iterator;
mod pipe;
mod source;
mod tee;

/// A pull-based source of chunks of type `T`.
/// https://streams.spec.whatwg.org/#rs-class
///
/// Cloning yields another handle onto the same stream; the lock discipline
/// (one reader at a time) is enforced at runtime regardless of how many
/// handles exist.
pub struct ReadableStream<T> {
    pub(crate) inner: Rc<ReadableInner<T>>,
}

impl<T> Clone for ReadableStream<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

/// The result of one read: a chunk, or `done` once the stream has closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadResult<T> {
    pub value: Option<T>,
    pub done: bool,
}

impl<T> ReadResult<T> {
    pub(crate) fn chunk(value: T) -> Self {
        Self {
            value: Some(value),
            done: false,
        }
    }

    pub(crate) fn done() -> Self {
        Self {
            value: None,
            done: true,
        }
    }
}

/// The source and destination halves handed to [`ReadableStream::pipe_through`],
/// usually obtained from [`TransformStream::into_pair`].
///
/// [`TransformStream::into_pair`]: crate::TransformStream::into_pair
pub struct ReadableWritablePair<I: 'static, O = I> {
    pub writable: WritableStream<I>,
    pub readable: ReadableStream<O>,
}

/// https://streams.spec.whatwg.org/#rs-internal-slots
pub(crate) enum ReadableState {
    Readable,
    Closed,
    Errored(StreamError),
}

impl ReadableState {
    pub(crate) fn is_readable(&self) -> bool {
        matches!(self, Self::Readable)
    }

    pub(crate) fn stored_error(&self) -> Option<StreamError> {
        match self {
            Self::Errored(error) => Some(error.clone()),
            _ => None,
        }
    }
}

/// Coalesces overlapping pull requests: at most one pull algorithm invocation
/// is in flight, and at most one more is queued behind it.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum PullState {
    Idle,
    InFlight,
    InFlightAndQueued,
}

/// Continuation for a pending default read.
///
/// Steps must not touch stream state synchronously; they settle deferreds or
/// spawn reactor tasks only. The engine invokes them while holding its own
/// internal borrows.
pub(crate) trait ReadRequest<T> {
    fn chunk_steps(self: Box<Self>, chunk: T);
    fn close_steps(self: Box<Self>);
    fn error_steps(self: Box<Self>, error: StreamError);
}

/// Continuation for a pending BYOB read. Same discipline as [`ReadRequest`].
pub(crate) trait ReadIntoRequest {
    fn chunk_steps(self: Box<Self>, chunk: ByteView);
    fn close_steps(self: Box<Self>, chunk: Option<ByteView>);
    fn error_steps(self: Box<Self>, error: StreamError);
}

pub(crate) struct DefaultReaderState<T> {
    pub read_requests: VecDeque<Box<dyn ReadRequest<T>>>,
    pub closed: Deferred<()>,
}

pub(crate) struct ByobReaderState {
    pub read_into_requests: VecDeque<Box<dyn ReadIntoRequest>>,
    pub closed: Deferred<()>,
}

pub(crate) enum ReaderState<T> {
    Default(DefaultReaderState<T>),
    Byob(ByobReaderState),
}

impl<T> ReaderState<T> {
    fn closed(&self) -> &Deferred<()> {
        match self {
            Self::Default(reader) => &reader.closed,
            Self::Byob(reader) => &reader.closed,
        }
    }
}

pub(crate) enum ControllerState<T> {
    Default(DefaultControllerState<T>),
    Byte(ByteControllerState<T>),
}

pub(crate) struct ReadableCore<T> {
    pub state: ReadableState,
    pub disturbed: bool,
    pub reader: Option<ReaderState<T>>,
    pub controller: ControllerState<T>,
}

pub(crate) struct ReadableInner<T> {
    pub core: RefCell<ReadableCore<T>>,
    pub reactor: Reactor,
}

impl<T: 'static> ReadableInner<T> {
    pub(crate) fn new(reactor: Reactor, controller: ControllerState<T>) -> Rc<Self> {
        Rc::new(Self {
            core: RefCell::new(ReadableCore {
                state: ReadableState::Readable,
                disturbed: false,
                reader: None,
                controller,
            }),
            reactor,
        })
    }

    /// https://streams.spec.whatwg.org/#readable-stream-close
    pub(crate) fn close(core: &mut ReadableCore<T>) {
        if !core.state.is_readable() {
            return;
        }
        tracing::trace!("readable stream closed");
        core.state = ReadableState::Closed;
        if let Some(reader) = core.reader.as_mut() {
            reader.closed().resolve(());
            if let ReaderState::Default(reader) = reader {
                for request in reader.read_requests.drain(..) {
                    request.close_steps();
                }
            }
        }
    }

    /// https://streams.spec.whatwg.org/#readable-stream-error
    pub(crate) fn error(core: &mut ReadableCore<T>, error: StreamError) {
        if !core.state.is_readable() {
            return;
        }
        tracing::trace!(%error, "readable stream errored");
        core.state = ReadableState::Errored(error.clone());
        if let Some(reader) = core.reader.as_mut() {
            reader.closed().reject(error.clone());
            match reader {
                ReaderState::Default(reader) => {
                    for request in reader.read_requests.drain(..) {
                        request.error_steps(error.clone());
                    }
                }
                ReaderState::Byob(reader) => {
                    for request in reader.read_into_requests.drain(..) {
                        request.error_steps(error.clone());
                    }
                }
            }
        }
    }

    /// https://streams.spec.whatwg.org/#readable-stream-cancel
    ///
    /// The synchronous part runs before this returns; the returned deferred
    /// settles once the source's cancel algorithm does.
    pub(crate) fn cancel(inner: &Rc<Self>, reason: StreamError) -> Deferred<()> {
        let deferred = Deferred::new();
        {
            let mut core = inner.core.borrow_mut();
            core.disturbed = true;
            match &core.state {
                ReadableState::Closed => {
                    deferred.resolve(());
                    return deferred;
                }
                ReadableState::Errored(error) => {
                    deferred.reject(error.clone());
                    return deferred;
                }
                ReadableState::Readable => {}
            }
            Self::close(&mut core);
            if let Some(ReaderState::Byob(reader)) = core.reader.as_mut() {
                for request in reader.read_into_requests.drain(..) {
                    request.close_steps(None);
                }
            }
        }
        let fut = Self::cancel_steps(inner, reason);
        let settle = deferred.clone();
        upon_future(&inner.reactor, fut, move |outcome| settle.settle(outcome));
        deferred
    }

    /// Controller [[CancelSteps]]: drop buffered chunks, then hand the reason
    /// to the source's cancel algorithm.
    fn cancel_steps(inner: &Rc<Self>, reason: StreamError) -> crate::AlgorithmFuture {
        enum Algorithms<T> {
            Default(DefaultSourceAlgorithms<T>),
            Byte(ByteSourceAlgorithms),
            Cleared,
        }
        let algorithms = {
            let mut core = inner.core.borrow_mut();
            match &mut core.controller {
                ControllerState::Default(controller) => {
                    controller.queue.reset_queue();
                    match controller.clear_algorithms() {
                        Some(algorithms) => Algorithms::Default(algorithms),
                        None => Algorithms::Cleared,
                    }
                }
                ControllerState::Byte(controller) => {
                    controller.clear_pending_pull_intos();
                    controller.queue.reset();
                    match controller.algorithms.take() {
                        Some(algorithms) => Algorithms::Byte(algorithms),
                        None => Algorithms::Cleared,
                    }
                }
            }
        };
        match algorithms {
            Algorithms::Default(algorithms) => algorithms.cancel(reason),
            Algorithms::Byte(algorithms) => algorithms.cancel(reason),
            Algorithms::Cleared => Box::pin(std::future::ready(Ok(()))),
        }
    }

    /// https://streams.spec.whatwg.org/#readable-stream-fulfill-read-request
    pub(crate) fn fulfill_read_request(core: &mut ReadableCore<T>, chunk: T, done: bool) {
        let Some(ReaderState::Default(reader)) = core.reader.as_mut() else {
            panic!("fulfill_read_request without a default reader");
        };
        let request = reader
            .read_requests
            .pop_front()
            .expect("fulfill_read_request without a pending read");
        if done {
            request.close_steps();
        } else {
            request.chunk_steps(chunk);
        }
    }

    /// https://streams.spec.whatwg.org/#readable-stream-fulfill-read-into-request
    pub(crate) fn fulfill_read_into_request(
        core: &mut ReadableCore<T>,
        chunk: ByteView,
        done: bool,
    ) {
        let Some(ReaderState::Byob(reader)) = core.reader.as_mut() else {
            panic!("fulfill_read_into_request without a BYOB reader");
        };
        let request = reader
            .read_into_requests
            .pop_front()
            .expect("fulfill_read_into_request without a pending read");
        if done {
            request.close_steps(Some(chunk));
        } else {
            request.chunk_steps(chunk);
        }
    }

    pub(crate) fn has_default_reader(core: &ReadableCore<T>) -> bool {
        matches!(core.reader, Some(ReaderState::Default(_)))
    }

    pub(crate) fn has_byob_reader(core: &ReadableCore<T>) -> bool {
        matches!(core.reader, Some(ReaderState::Byob(_)))
    }

    pub(crate) fn num_read_requests(core: &ReadableCore<T>) -> usize {
        match &core.reader {
            Some(ReaderState::Default(reader)) => reader.read_requests.len(),
            _ => 0,
        }
    }

    pub(crate) fn num_read_into_requests(core: &ReadableCore<T>) -> usize {
        match &core.reader {
            Some(ReaderState::Byob(reader)) => reader.read_into_requests.len(),
            _ => 0,
        }
    }

    /// Dispatches to the controller's pull coalescing logic.
    pub(crate) fn pull_if_needed(inner: &Rc<Self>) {
        let is_byte = matches!(inner.core.borrow().controller, ControllerState::Byte(_));
        if is_byte {
            byte_controller::pull_if_needed(inner);
        } else {
            default_controller::pull_if_needed(inner);
        }
    }
}

impl<T: 'static> ReadableStream<T> {
    /// Constructs a stream from an underlying source with the default
    /// strategy (high water mark 1, each chunk counts as 1).
    pub fn new(source: impl UnderlyingSource<T> + 'static) -> Self {
        Self::set_up(
            Reactor::new(),
            DefaultSourceAlgorithms::User(Rc::new(source)),
            1.0,
            SizeAlgorithm::AlwaysOne,
        )
    }

    /// https://streams.spec.whatwg.org/#rs-constructor
    pub fn with_strategy(
        source: impl UnderlyingSource<T> + 'static,
        strategy: QueuingStrategy<T>,
    ) -> StreamResult<Self> {
        let high_water_mark = QueuingStrategy::extract_high_water_mark(Some(&strategy), 1.0)?;
        let size_algorithm = QueuingStrategy::extract_size_algorithm(Some(&strategy));
        Ok(Self::set_up(
            Reactor::new(),
            DefaultSourceAlgorithms::User(Rc::new(source)),
            high_water_mark,
            size_algorithm,
        ))
    }

    /// Internal construction sites (tee branches, transform readable sides)
    /// supply pre-bound closures instead of an [`UnderlyingSource`].
    pub(crate) fn from_closures(
        reactor: Reactor,
        start: Option<StartClosure<T>>,
        pull: impl Fn() -> crate::AlgorithmFuture + 'static,
        cancel: impl FnOnce(StreamError) -> crate::AlgorithmFuture + 'static,
        high_water_mark: f64,
        size_algorithm: SizeAlgorithm<T>,
    ) -> Self {
        Self::set_up(
            reactor,
            DefaultSourceAlgorithms::Closure {
                start: RefCell::new(start),
                pull: Rc::new(pull),
                cancel: Rc::new(RefCell::new(Some(Box::new(cancel)))),
            },
            high_water_mark,
            size_algorithm,
        )
    }

    /// https://streams.spec.whatwg.org/#set-up-readable-stream-default-controller
    fn set_up(
        reactor: Reactor,
        algorithms: DefaultSourceAlgorithms<T>,
        high_water_mark: f64,
        size_algorithm: SizeAlgorithm<T>,
    ) -> Self {
        let inner = ReadableInner::new(
            reactor,
            ControllerState::Default(DefaultControllerState::new(
                algorithms.clone(),
                high_water_mark,
                size_algorithm,
            )),
        );
        let controller = ReadableStreamDefaultController {
            inner: Rc::clone(&inner),
        };
        // The un-cloned algorithms still hold the start closure.
        let start_fut = algorithms.start(controller);
        let started = Rc::clone(&inner);
        upon_future(&inner.reactor, start_fut, move |outcome| match outcome {
            Ok(()) => {
                default_controller::mark_started(&started);
                default_controller::pull_if_needed(&started);
            }
            Err(error) => default_controller::error(&started, error),
        });
        Self { inner }
    }

    /// Whether a reader currently holds the stream's lock.
    /// https://streams.spec.whatwg.org/#rs-locked
    pub fn locked(&self) -> bool {
        self.inner.core.borrow().reader.is_some()
    }

    /// https://streams.spec.whatwg.org/#rs-cancel
    pub fn cancel(&self, reason: StreamError) -> impl Future<Output = StreamResult<()>> {
        let inner = Rc::clone(&self.inner);
        let reactor = inner.reactor.clone();
        drive_with(reactor, async move {
            if inner.core.borrow().reader.is_some() {
                return Err(StreamError::type_error(
                    "Cannot cancel a stream locked to a reader",
                ));
            }
            ReadableInner::cancel(&inner, reason).once().await
        })
    }

    /// Acquires the exclusive default reader.
    /// https://streams.spec.whatwg.org/#rs-get-reader
    pub fn get_reader(&self) -> StreamResult<ReadableStreamDefaultReader<T>> {
        acquire_default_reader(&self.inner)
    }

    /// Splits the stream into two branches receiving the same chunks. Byte
    /// streams split into byte branches that coordinate BYOB reads; other
    /// streams deliver each chunk to both branches by cloning.
    /// https://streams.spec.whatwg.org/#rs-tee
    pub fn tee(&self) -> StreamResult<(ReadableStream<T>, ReadableStream<T>)>
    where
        T: Clone,
    {
        if self.locked() {
            return Err(StreamError::type_error(
                "Cannot tee a stream locked to a reader",
            ));
        }
        let is_byte = matches!(self.inner.core.borrow().controller, ControllerState::Byte(_));
        if is_byte {
            // Byte controllers only exist on ByteView streams, so this
            // round-trip is a type-level formality.
            let (first, second) = tee::byte_tee(&downcast_inner::<T, ByteView>(&self.inner))?;
            Ok((
                ReadableStream {
                    inner: downcast_inner::<ByteView, T>(&first.inner),
                },
                ReadableStream {
                    inner: downcast_inner::<ByteView, T>(&second.inner),
                },
            ))
        } else {
            tee::default_tee(&self.inner)
        }
    }

    /// Pipes this stream into `dest`, propagating closure and errors per the
    /// options. Resolves when the pipe completes.
    /// https://streams.spec.whatwg.org/#rs-pipe-to
    pub fn pipe_to(
        &self,
        dest: &WritableStream<T>,
        options: PipeOptions,
    ) -> impl Future<Output = StreamResult<()>> {
        pipe::pipe_to(Rc::clone(&self.inner), dest.clone(), options)
    }

    /// Pipes this stream through a transform, returning its readable side.
    /// https://streams.spec.whatwg.org/#rs-pipe-through
    pub fn pipe_through<O: 'static>(
        &self,
        pair: ReadableWritablePair<T, O>,
        options: PipeOptions,
    ) -> StreamResult<ReadableStream<O>> {
        if self.locked() {
            return Err(StreamError::type_error(
                "Cannot pipe a stream locked to a reader",
            ));
        }
        if pair.writable.locked() {
            return Err(StreamError::type_error(
                "Cannot pipe to a stream locked to a writer",
            ));
        }
        let fut = self.pipe_to(&pair.writable, options);
        // Pipe failures surface through the destination and the returned
        // readable side.
        self.inner.reactor.spawn(async move {
            let _ = fut.await;
        });
        Ok(pair.readable)
    }

    /// Adapts the stream into a [`futures::Stream`] of chunks. The stream is
    /// canceled when the adapter is dropped before exhaustion, unless
    /// [`IntoStream::without_cancel_on_drop`] is used.
    ///
    /// [`futures::Stream`]: futures::Stream
    pub fn into_stream(self) -> StreamResult<IntoStream<T>> {
        let reader = self.get_reader()?;
        Ok(IntoStream::new(reader))
    }
}

/// Converts between `Rc<ReadableInner<A>>` and `Rc<ReadableInner<B>>` when
/// the two chunk types are in fact the same (checked at runtime).
fn downcast_inner<A: 'static, B: 'static>(inner: &Rc<ReadableInner<A>>) -> Rc<ReadableInner<B>> {
    let any: Rc<dyn Any> = Rc::clone(inner) as Rc<dyn Any>;
    match any.downcast::<ReadableInner<B>>() {
        Ok(inner) => inner,
        Err(_) => unreachable!("stream chunk type mismatch"),
    }
}

impl ReadableStream<ByteView> {
    /// Constructs a byte stream (high water mark 0 by default).
    /// https://streams.spec.whatwg.org/#set-up-readable-byte-stream-controller
    pub fn byte_source(source: impl UnderlyingByteSource + 'static) -> StreamResult<Self> {
        Self::byte_source_inner(Rc::new(source), 0.0)
    }

    pub fn byte_source_with_strategy(
        source: impl UnderlyingByteSource + 'static,
        strategy: QueuingStrategy<ByteView>,
    ) -> StreamResult<Self> {
        if strategy.has_size_function() {
            return Err(StreamError::range_error(
                "The strategy for a byte stream cannot have a size function",
            ));
        }
        let high_water_mark = QueuingStrategy::extract_high_water_mark(Some(&strategy), 0.0)?;
        Self::byte_source_inner(Rc::new(source), high_water_mark)
    }

    fn byte_source_inner(
        source: Rc<dyn UnderlyingByteSource>,
        high_water_mark: f64,
    ) -> StreamResult<Self> {
        let auto_allocate_chunk_size = source.auto_allocate_chunk_size();
        if auto_allocate_chunk_size == Some(0) {
            return Err(StreamError::type_error(
                "autoAllocateChunkSize must be greater than 0",
            ));
        }
        let inner = ReadableInner::new(
            Reactor::new(),
            ControllerState::Byte(ByteControllerState::new(
                high_water_mark,
                auto_allocate_chunk_size,
                |view| view,
            )),
        );
        let controller = ReadableByteStreamController {
            inner: Rc::clone(&inner),
        };
        {
            let pull_source = Rc::clone(&source);
            let pull_controller = controller.clone();
            let cancel_source = Rc::clone(&source);
            let mut core = inner.core.borrow_mut();
            let ControllerState::Byte(state) = &mut core.controller else {
                unreachable!()
            };
            state.algorithms = Some(ByteSourceAlgorithms::new(
                move || pull_source.pull(pull_controller.clone()),
                move |reason| cancel_source.cancel(reason),
            ));
        }
        let start_fut = source.start(controller);
        let started = Rc::clone(&inner);
        upon_future(&inner.reactor, start_fut, move |outcome| match outcome {
            Ok(()) => {
                byte_controller::mark_started(&started);
                byte_controller::pull_if_needed(&started);
            }
            Err(error) => byte_controller::error(&started, error),
        });
        Ok(Self { inner })
    }

    /// Internal byte stream construction from pre-bound algorithms (byte tee
    /// branches). Starts immediately, high water mark 0, no auto-allocation.
    pub(crate) fn byte_from_closures(reactor: Reactor, algorithms: ByteSourceAlgorithms) -> Self {
        let inner = ReadableInner::new(
            reactor,
            ControllerState::Byte(ByteControllerState::new(0.0, None, |view| view)),
        );
        {
            let mut core = inner.core.borrow_mut();
            let ControllerState::Byte(state) = &mut core.controller else {
                unreachable!()
            };
            state.algorithms = Some(algorithms);
            state.started = true;
        }
        Self { inner }
    }

    /// Acquires the exclusive BYOB reader. Only byte streams support it.
    /// https://streams.spec.whatwg.org/#rs-get-reader
    pub fn get_byob_reader(&self) -> StreamResult<ReadableStreamByobReader> {
        acquire_byob_reader(&self.inner)
    }
}

/// https://streams.spec.whatwg.org/#acquire-readable-stream-reader
pub(crate) fn acquire_default_reader<T: 'static>(
    inner: &Rc<ReadableInner<T>>,
) -> StreamResult<ReadableStreamDefaultReader<T>> {
    let mut core = inner.core.borrow_mut();
    if core.reader.is_some() {
        return Err(StreamError::type_error(
            "The stream is already locked to a reader",
        ));
    }
    let closed = reader_closed_deferred(&core.state);
    core.reader = Some(ReaderState::Default(DefaultReaderState {
        read_requests: VecDeque::new(),
        closed: closed.clone(),
    }));
    Ok(ReadableStreamDefaultReader::new(Rc::clone(inner), closed))
}

/// https://streams.spec.whatwg.org/#acquire-readable-stream-byob-reader
pub(crate) fn acquire_byob_reader(
    inner: &Rc<ReadableInner<ByteView>>,
) -> StreamResult<ReadableStreamByobReader> {
    let mut core = inner.core.borrow_mut();
    if !matches!(core.controller, ControllerState::Byte(_)) {
        return Err(StreamError::type_error(
            "Cannot construct a ReadableStreamBYOBReader for a stream not constructed with a byte source",
        ));
    }
    if core.reader.is_some() {
        return Err(StreamError::type_error(
            "The stream is already locked to a reader",
        ));
    }
    let closed = reader_closed_deferred(&core.state);
    core.reader = Some(ReaderState::Byob(ByobReaderState {
        read_into_requests: VecDeque::new(),
        closed: closed.clone(),
    }));
    Ok(ReadableStreamByobReader::new(Rc::clone(inner), closed))
}

fn reader_closed_deferred(state: &ReadableState) -> Deferred<()> {
    let closed = match state {
        ReadableState::Readable => Deferred::new(),
        ReadableState::Closed => Deferred::resolved(()),
        ReadableState::Errored(error) => Deferred::rejected(error.clone()),
    };
    // Observing reader.closed is optional.
    closed.mark_handled();
    closed
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};

    use futures::StreamExt;

    use super::*;
    use crate::{error::ErrorName, AlgorithmFuture};

    fn resolved() -> AlgorithmFuture {
        Box::pin(std::future::ready(Ok(())))
    }

    struct CountingSource {
        next: Cell<u32>,
        limit: u32,
        cancelled: Rc<RefCell<Option<StreamError>>>,
        desired_log: Rc<RefCell<Vec<Option<f64>>>>,
    }

    impl CountingSource {
        fn new(limit: u32) -> Self {
            Self {
                next: Cell::new(0),
                limit,
                cancelled: Rc::new(RefCell::new(None)),
                desired_log: Rc::new(RefCell::new(Vec::new())),
            }
        }
    }

    impl UnderlyingSource<u32> for CountingSource {
        fn pull(&self, controller: ReadableStreamDefaultController<u32>) -> AlgorithmFuture {
            self.desired_log.borrow_mut().push(controller.desired_size());
            let value = self.next.get();
            if value < self.limit {
                self.next.set(value + 1);
                controller.enqueue(value).unwrap();
            } else {
                controller.close().unwrap();
            }
            resolved()
        }

        fn cancel(&self, reason: StreamError) -> AlgorithmFuture {
            *self.cancelled.borrow_mut() = Some(reason);
            resolved()
        }
    }

    #[tokio::test]
    async fn reads_resolve_in_fifo_order() {
        let stream = ReadableStream::new(CountingSource::new(3));
        let reader = stream.get_reader().unwrap();
        assert_eq!(reader.read().await.unwrap(), ReadResult::chunk(0));
        assert_eq!(reader.read().await.unwrap(), ReadResult::chunk(1));
        assert_eq!(reader.read().await.unwrap(), ReadResult::chunk(2));
        assert_eq!(reader.read().await.unwrap(), ReadResult::done());
        reader.closed().await.unwrap();
    }

    #[tokio::test]
    async fn desired_size_shrinks_as_the_queue_fills() {
        let source = CountingSource::new(10);
        let log = Rc::clone(&source.desired_log);
        let stream = ReadableStream::with_strategy(
            source,
            QueuingStrategy::with_high_water_mark(2.0),
        )
        .unwrap();
        let reader = stream.get_reader().unwrap();

        // The first read triggers pulls until the queue reaches the high
        // water mark.
        assert_eq!(reader.read().await.unwrap(), ReadResult::chunk(0));
        assert_eq!(*log.borrow(), vec![Some(2.0), Some(2.0), Some(1.0)]);

        // Draining one chunk opens room for exactly one more pull.
        assert_eq!(reader.read().await.unwrap(), ReadResult::chunk(1));
        assert_eq!(*log.borrow(), vec![Some(2.0), Some(2.0), Some(1.0), Some(1.0)]);
    }

    struct BufferedSource;

    impl UnderlyingSource<&'static str> for BufferedSource {
        fn start(
            &self,
            controller: ReadableStreamDefaultController<&'static str>,
        ) -> AlgorithmFuture {
            controller.enqueue("first").unwrap();
            controller.enqueue("second").unwrap();
            controller.close().unwrap();
            resolved()
        }
    }

    #[tokio::test]
    async fn close_delivers_buffered_chunks_before_done() {
        let stream = ReadableStream::new(BufferedSource);
        let reader = stream.get_reader().unwrap();
        assert_eq!(reader.read().await.unwrap(), ReadResult::chunk("first"));
        assert_eq!(reader.read().await.unwrap(), ReadResult::chunk("second"));
        assert_eq!(reader.read().await.unwrap(), ReadResult::done());
    }

    #[tokio::test]
    async fn cancel_reaches_the_source_and_closes_the_stream() {
        let source = CountingSource::new(100);
        let cancelled = Rc::clone(&source.cancelled);
        let stream = ReadableStream::new(source);

        let reason = StreamError::aborted("no longer needed");
        stream.cancel(reason.clone()).await.unwrap();
        assert_eq!(cancelled.borrow().clone().unwrap(), reason);

        // A cancelled stream reads as closed.
        let reader = stream.get_reader().unwrap();
        assert_eq!(reader.read().await.unwrap(), ReadResult::done());
    }

    #[tokio::test]
    async fn lock_discipline_is_enforced() {
        let stream = ReadableStream::new(CountingSource::new(3));
        let reader = stream.get_reader().unwrap();
        assert!(stream.locked());
        assert_eq!(
            stream.get_reader().unwrap_err().name(),
            ErrorName::TypeError
        );

        let error = stream
            .cancel(StreamError::aborted("nope"))
            .await
            .unwrap_err();
        assert_eq!(error.name(), ErrorName::TypeError);

        reader.release_lock();
        assert!(!stream.locked());
        stream.get_reader().unwrap();
    }

    #[tokio::test]
    async fn released_reader_rejects_further_reads() {
        // A source that never produces.
        let stream: ReadableStream<u32> = ReadableStream::new(CountingSource::new(0));
        let reader = stream.get_reader().unwrap();
        assert_eq!(reader.read().await.unwrap(), ReadResult::done());

        reader.release_lock();
        let error = reader.read().await.unwrap_err();
        assert_eq!(error.name(), ErrorName::TypeError);
    }

    struct FailingSource {
        error: StreamError,
    }

    impl UnderlyingSource<u32> for FailingSource {
        fn pull(&self, _controller: ReadableStreamDefaultController<u32>) -> AlgorithmFuture {
            let error = self.error.clone();
            Box::pin(std::future::ready(Err(error)))
        }
    }

    #[tokio::test]
    async fn pull_failure_errors_the_stream() {
        let error = StreamError::type_error("backend gone");
        let stream = ReadableStream::new(FailingSource {
            error: error.clone(),
        });
        let reader = stream.get_reader().unwrap();
        assert_eq!(reader.read().await.unwrap_err(), error);
        assert_eq!(reader.closed().await.unwrap_err(), error);
    }

    #[tokio::test]
    async fn into_stream_yields_chunks_and_cancels_on_drop() {
        let source = CountingSource::new(100);
        let cancelled = Rc::clone(&source.cancelled);
        let stream = ReadableStream::new(source);
        {
            let mut chunks = stream.clone().into_stream().unwrap();
            assert_eq!(chunks.next().await.unwrap().unwrap(), 0);
            assert_eq!(chunks.next().await.unwrap().unwrap(), 1);
        }
        // Dropping the adapter mid-iteration cancels the stream; the cancel
        // callback runs the next time the stream is driven.
        let reader = stream.get_reader().unwrap();
        assert_eq!(reader.read().await.unwrap(), ReadResult::done());
        assert_eq!(
            cancelled.borrow().clone().unwrap().name(),
            ErrorName::AbortError
        );
    }

    fn xorshift(state: &mut u32) -> u32 {
        *state ^= *state << 13;
        *state ^= *state >> 17;
        *state ^= *state << 5;
        *state
    }

    /// A source fed from outside through its stashed controller handle.
    struct PushSource {
        pulls: Rc<Cell<u32>>,
        controller: Rc<RefCell<Option<ReadableStreamDefaultController<u32>>>>,
    }

    impl UnderlyingSource<u32> for PushSource {
        fn start(&self, controller: ReadableStreamDefaultController<u32>) -> AlgorithmFuture {
            controller.enqueue(0).unwrap();
            *self.controller.borrow_mut() = Some(controller);
            resolved()
        }

        fn pull(&self, _controller: ReadableStreamDefaultController<u32>) -> AlgorithmFuture {
            self.pulls.set(self.pulls.get() + 1);
            resolved()
        }
    }

    #[tokio::test]
    async fn source_stays_quiescent_after_the_stream_settles() {
        // Arbitrary enqueue/read/close/error sequences; once the stream
        // reaches a terminal state the source must never be pulled again.
        for seed in [0x0bad_cafe_u32, 0x9e37_79b9, 0x2545_f491, 17, 99] {
            let mut state = seed;
            let pulls = Rc::new(Cell::new(0));
            let slot = Rc::new(RefCell::new(None));
            let stream = ReadableStream::new(PushSource {
                pulls: Rc::clone(&pulls),
                controller: Rc::clone(&slot),
            });
            let reader = stream.get_reader().unwrap();
            assert_eq!(reader.read().await.unwrap(), ReadResult::chunk(0));
            let controller = slot.borrow().clone().unwrap();

            let mut buffered = 0u32;
            let mut settling = false;
            for op in 1..16u32 {
                match xorshift(&mut state) % 6 {
                    0 => {
                        let _ = controller.close();
                        settling = true;
                    }
                    1 => {
                        controller.error(StreamError::type_error("induced failure"));
                        settling = true;
                    }
                    2 | 3 => {
                        if controller.enqueue(op).is_ok() {
                            buffered += 1;
                        }
                    }
                    _ => {
                        // Only await reads that cannot park forever.
                        if buffered > 0 || settling {
                            let _ = reader.read().await;
                            buffered = buffered.saturating_sub(1);
                        } else if controller.enqueue(op).is_ok() {
                            let _ = reader.read().await;
                        }
                    }
                }
            }
            controller.error(StreamError::type_error("shutdown"));
            let _ = reader.read().await;
            let settled = pulls.get();

            for op in 0..8u32 {
                match xorshift(&mut state) % 3 {
                    0 => assert!(controller.enqueue(op).is_err()),
                    1 => assert!(controller.close().is_err()),
                    _ => {
                        let _ = reader.read().await;
                    }
                }
            }
            assert_eq!(
                pulls.get(),
                settled,
                "seed {seed:#x}: pulled after the stream settled"
            );
        }
    }
}
