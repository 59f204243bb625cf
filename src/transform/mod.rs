use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

pub use controller::TransformStreamDefaultController;
pub use transformer::Transformer;

use controller::TransformCoreOps;

use crate::{
    error::StreamError,
    queuing_strategy::{QueuingStrategy, SizeAlgorithm},
    readable::{
        default_controller as readable_controller, ReadableInner, ReadableStream,
        ReadableWritablePair,
    },
    utils::{
        deferred::Deferred,
        reactor::{upon_future, Reactor},
    },
    writable::{self, WritableInner, WritableStream},
    AlgorithmFuture, StreamResult,
};

mod controller;
mod transformer;

fn resolved() -> AlgorithmFuture {
    Box::pin(std::future::ready(Ok(())))
}

/// A [`WritableStream`]/[`ReadableStream`] pair coupled through a
/// [`Transformer`]: chunks written to the writable side come out of the
/// readable side transformed, with backpressure flowing through.
/// https://streams.spec.whatwg.org/#ts-class
pub struct TransformStream<I: 'static, O: 'static = I> {
    readable: ReadableStream<O>,
    writable: WritableStream<I>,
}

/// State shared by the two sides and the controller. Both sides run on one
/// reactor so progress on either drives the whole transform.
struct TransformShared<I: 'static, O: 'static> {
    reactor: Reactor,
    /// Cleared once the transform reaches a terminal state, releasing the
    /// user transformer and breaking the reference cycle through it.
    transformer: RefCell<Option<Rc<dyn Transformer<I, O>>>>,
    backpressure: Cell<bool>,
    /// Resolved and replaced each time `backpressure` flips.
    backpressure_change: RefCell<Deferred<()>>,
    readable: RefCell<Option<Rc<ReadableInner<O>>>>,
    writable: RefCell<Option<Rc<WritableInner<I>>>>,
    /// Set by whichever of close/abort/cancel runs first; the others return
    /// it unchanged so the cancel callback runs exactly once.
    finish: RefCell<Option<Deferred<()>>>,
}

impl<I: 'static, O: 'static> TransformShared<I, O> {
    fn readable_inner(&self) -> Rc<ReadableInner<O>> {
        self.readable
            .borrow()
            .clone()
            .expect("transform readable side not yet initialized")
    }

    fn writable_inner(&self) -> Rc<WritableInner<I>> {
        self.writable
            .borrow()
            .clone()
            .expect("transform writable side not yet initialized")
    }

    fn controller(self: &Rc<Self>) -> TransformStreamDefaultController<O> {
        TransformStreamDefaultController {
            readable_controller: crate::readable::ReadableStreamDefaultController {
                inner: self.readable_inner(),
            },
            ops: Rc::clone(self) as Rc<dyn TransformCoreOps>,
        }
    }

    /// Claims (or joins) the shared finish deferred. Returns `true` when
    /// this caller is the one that must run the cancel/flush work.
    fn claim_finish(&self) -> (Deferred<()>, bool) {
        let mut slot = self.finish.borrow_mut();
        match &*slot {
            Some(existing) => (existing.clone(), false),
            None => {
                let deferred = Deferred::new();
                *slot = Some(deferred.clone());
                (deferred, true)
            }
        }
    }

    fn take_transformer(&self) -> Option<Rc<dyn Transformer<I, O>>> {
        self.transformer.borrow_mut().take()
    }

    /// https://streams.spec.whatwg.org/#transform-stream-error
    fn error_both_sides(self: &Rc<Self>, error: StreamError) {
        readable_controller::error(&self.readable_inner(), error.clone());
        self.error_writable_and_unblock(error);
    }
}

impl<I: 'static, O: 'static> TransformCoreOps for TransformShared<I, O> {
    fn backpressure(&self) -> bool {
        self.backpressure.get()
    }

    /// https://streams.spec.whatwg.org/#transform-stream-set-backpressure
    fn set_backpressure(&self, backpressure: bool) {
        debug_assert_ne!(self.backpressure.get(), backpressure);
        let previous = self.backpressure_change.replace(Deferred::new());
        previous.resolve(());
        self.backpressure.set(backpressure);
    }

    /// https://streams.spec.whatwg.org/#transform-stream-error-writable-and-unblock-write
    fn error_writable_and_unblock(&self, error: StreamError) {
        self.take_transformer();
        writable::default_controller::error_if_needed(&self.writable_inner(), error);
        if self.backpressure.get() {
            self.set_backpressure(false);
        }
    }
}

impl<I: 'static, O: 'static> TransformStream<I, O> {
    /// Creates a transform with default strategies: a writable high water
    /// mark of 1 and a readable high water mark of 0, so backpressure
    /// reaches the writer as soon as output is not being read.
    pub fn new(transformer: impl Transformer<I, O> + 'static) -> Self {
        Self::set_up(
            Rc::new(transformer),
            1.0,
            SizeAlgorithm::AlwaysOne,
            0.0,
            SizeAlgorithm::AlwaysOne,
        )
    }

    /// https://streams.spec.whatwg.org/#ts-constructor
    pub fn with_strategies(
        transformer: impl Transformer<I, O> + 'static,
        writable_strategy: QueuingStrategy<I>,
        readable_strategy: QueuingStrategy<O>,
    ) -> StreamResult<Self> {
        let writable_hwm = QueuingStrategy::extract_high_water_mark(Some(&writable_strategy), 1.0)?;
        let writable_size = QueuingStrategy::extract_size_algorithm(Some(&writable_strategy));
        let readable_hwm = QueuingStrategy::extract_high_water_mark(Some(&readable_strategy), 0.0)?;
        let readable_size = QueuingStrategy::extract_size_algorithm(Some(&readable_strategy));
        Ok(Self::set_up(
            Rc::new(transformer),
            writable_hwm,
            writable_size,
            readable_hwm,
            readable_size,
        ))
    }

    /// https://streams.spec.whatwg.org/#initialize-transform-stream
    fn set_up(
        transformer: Rc<dyn Transformer<I, O>>,
        writable_hwm: f64,
        writable_size: SizeAlgorithm<I>,
        readable_hwm: f64,
        readable_size: SizeAlgorithm<O>,
    ) -> Self {
        let reactor = Reactor::new();
        let start_deferred: Deferred<()> = Deferred::new();
        let shared = Rc::new(TransformShared {
            reactor: reactor.clone(),
            transformer: RefCell::new(Some(transformer)),
            backpressure: Cell::new(false),
            backpressure_change: RefCell::new(Deferred::new()),
            readable: RefCell::new(None),
            writable: RefCell::new(None),
            finish: RefCell::new(None),
        });

        // Both sides' start algorithms surface the transformer's start
        // outcome.
        let source_wait = start_deferred.clone();
        let pull_shared = Rc::clone(&shared);
        let cancel_shared = Rc::clone(&shared);
        let readable = ReadableStream::from_closures(
            reactor.clone(),
            Some(Box::new(move |_controller| {
                let settled = source_wait.settled();
                Box::pin(async move { settled.await })
            })),
            move || source_pull(&pull_shared),
            move |reason| source_cancel(&cancel_shared, reason),
            readable_hwm,
            readable_size,
        );
        *shared.readable.borrow_mut() = Some(Rc::clone(&readable.inner));

        let sink_wait = start_deferred.clone();
        let write_shared = Rc::clone(&shared);
        let close_shared = Rc::clone(&shared);
        let abort_shared = Rc::clone(&shared);
        let writable = WritableStream::from_closures(
            reactor.clone(),
            Some(Box::new(move |_controller| {
                let settled = sink_wait.settled();
                Box::pin(async move { settled.await })
            })),
            move |chunk| sink_write(&write_shared, chunk),
            move || sink_close(&close_shared),
            move |reason| sink_abort(&abort_shared, reason),
            writable_hwm,
            writable_size,
        );
        *shared.writable.borrow_mut() = Some(Rc::clone(&writable.inner));

        shared.set_backpressure(true);

        let user_transformer = shared
            .transformer
            .borrow()
            .clone()
            .expect("transformer present at set-up");
        let start = user_transformer.start(shared.controller());
        upon_future(&reactor, start, move |outcome| start_deferred.settle(outcome));

        Self { readable, writable }
    }

    pub fn readable(&self) -> ReadableStream<O> {
        self.readable.clone()
    }

    pub fn writable(&self) -> WritableStream<I> {
        self.writable.clone()
    }

    /// Splits the transform into the pair accepted by
    /// [`ReadableStream::pipe_through`].
    pub fn into_pair(self) -> ReadableWritablePair<I, O> {
        ReadableWritablePair {
            writable: self.writable,
            readable: self.readable,
        }
    }
}

struct IdentityTransformer;

impl<T: 'static> Transformer<T, T> for IdentityTransformer {
    fn transform(
        &self,
        chunk: T,
        controller: TransformStreamDefaultController<T>,
    ) -> AlgorithmFuture {
        let result = controller.enqueue(chunk);
        Box::pin(std::future::ready(result))
    }
}

impl<T: 'static> TransformStream<T, T> {
    /// A transform passing chunks through unchanged; useful as a
    /// backpressure-propagating channel between a pipe's two halves.
    pub fn identity() -> Self {
        Self::new(IdentityTransformer)
    }
}

/// https://streams.spec.whatwg.org/#transform-stream-default-sink-write-algorithm
fn sink_write<I: 'static, O: 'static>(shared: &Rc<TransformShared<I, O>>, chunk: I) -> AlgorithmFuture {
    let shared = Rc::clone(shared);
    Box::pin(async move {
        if shared.backpressure.get() {
            let change = shared.backpressure_change.borrow().clone();
            let _ = change.settled().await;
            let writable = shared.writable_inner();
            if let Some(error) = writable::erroring_error(&writable) {
                return Err(error);
            }
        }
        // https://streams.spec.whatwg.org/#transform-stream-default-controller-perform-transform
        let transformer = shared.transformer.borrow().clone();
        let Some(transformer) = transformer else {
            return Ok(());
        };
        match transformer.transform(chunk, shared.controller()).await {
            Ok(()) => Ok(()),
            Err(error) => {
                shared.error_both_sides(error.clone());
                Err(error)
            }
        }
    })
}

/// https://streams.spec.whatwg.org/#transform-stream-default-sink-close-algorithm
fn sink_close<I: 'static, O: 'static>(shared: &Rc<TransformShared<I, O>>) -> AlgorithmFuture {
    let shared = Rc::clone(shared);
    Box::pin(async move {
        let (finish, first) = shared.claim_finish();
        if first {
            let transformer = shared.take_transformer();
            let flush = match &transformer {
                Some(transformer) => transformer.flush(shared.controller()),
                None => resolved(),
            };
            let flush_shared = Rc::clone(&shared);
            let flush_finish = finish.clone();
            upon_future(&shared.reactor, flush, move |outcome| {
                let readable = flush_shared.readable_inner();
                match outcome {
                    Ok(()) => {
                        let stored_error = readable.core.borrow().state.stored_error();
                        if let Some(error) = stored_error {
                            flush_finish.reject(error);
                        } else {
                            readable_controller::close(&readable);
                            flush_finish.resolve(());
                        }
                    }
                    Err(error) => {
                        readable_controller::error(&readable, error.clone());
                        flush_finish.reject(error);
                    }
                }
            });
        }
        finish.settled().await
    })
}

/// https://streams.spec.whatwg.org/#transform-stream-default-sink-abort-algorithm
fn sink_abort<I: 'static, O: 'static>(
    shared: &Rc<TransformShared<I, O>>,
    reason: StreamError,
) -> AlgorithmFuture {
    let shared = Rc::clone(shared);
    Box::pin(async move {
        let (finish, first) = shared.claim_finish();
        if first {
            let transformer = shared.take_transformer();
            let cancel = match &transformer {
                Some(transformer) => transformer.cancel(reason.clone()),
                None => resolved(),
            };
            let cancel_shared = Rc::clone(&shared);
            let cancel_finish = finish.clone();
            upon_future(&shared.reactor, cancel, move |outcome| {
                let readable = cancel_shared.readable_inner();
                match outcome {
                    Ok(()) => {
                        let stored_error = readable.core.borrow().state.stored_error();
                        if let Some(error) = stored_error {
                            cancel_finish.reject(error);
                        } else {
                            readable_controller::error(&readable, reason);
                            cancel_finish.resolve(());
                        }
                    }
                    Err(error) => {
                        readable_controller::error(&readable, error.clone());
                        cancel_finish.reject(error);
                    }
                }
            });
        }
        finish.settled().await
    })
}

/// https://streams.spec.whatwg.org/#transform-stream-default-source-pull-algorithm
fn source_pull<I: 'static, O: 'static>(shared: &Rc<TransformShared<I, O>>) -> AlgorithmFuture {
    debug_assert!(shared.backpressure.get());
    shared.set_backpressure(false);
    let change = shared.backpressure_change.borrow().clone();
    Box::pin(async move { change.settled().await })
}

/// https://streams.spec.whatwg.org/#transform-stream-default-source-cancel-algorithm
fn source_cancel<I: 'static, O: 'static>(
    shared: &Rc<TransformShared<I, O>>,
    reason: StreamError,
) -> AlgorithmFuture {
    let shared = Rc::clone(shared);
    Box::pin(async move {
        let (finish, first) = shared.claim_finish();
        if first {
            let transformer = shared.take_transformer();
            let cancel = match &transformer {
                Some(transformer) => transformer.cancel(reason.clone()),
                None => resolved(),
            };
            let cancel_shared = Rc::clone(&shared);
            let cancel_finish = finish.clone();
            upon_future(&shared.reactor, cancel, move |outcome| {
                let writable = cancel_shared.writable_inner();
                match outcome {
                    Ok(()) => {
                        if let Some(error) = writable::stored_error_of(&writable) {
                            cancel_finish.reject(error);
                        } else {
                            writable::default_controller::error_if_needed(&writable, reason);
                            unblock_write(&cancel_shared);
                            cancel_finish.resolve(());
                        }
                    }
                    Err(error) => {
                        writable::default_controller::error_if_needed(&writable, error.clone());
                        unblock_write(&cancel_shared);
                        cancel_finish.reject(error);
                    }
                }
            });
        }
        finish.settled().await
    })
}

/// https://streams.spec.whatwg.org/#transform-stream-unblock-write
fn unblock_write<I: 'static, O: 'static>(shared: &Rc<TransformShared<I, O>>) {
    if shared.backpressure.get() {
        shared.set_backpressure(false);
    }
}

#[cfg(test)]
mod tests {
    use crate::{error::ErrorName, readable::ReadResult};

    use super::*;

    #[tokio::test]
    async fn identity_passes_chunks_through() {
        let pair = TransformStream::<u32>::identity().into_pair();
        let writer = pair.writable.get_writer().unwrap();
        let reader = pair.readable.get_reader().unwrap();

        // The readable side's high water mark is zero, so the write only
        // completes once a read pulls the chunk through.
        let (write, read) = futures::join!(writer.write(5), reader.read());
        write.unwrap();
        assert_eq!(read.unwrap(), ReadResult::chunk(5));

        let (close, read) = futures::join!(writer.close(), reader.read());
        close.unwrap();
        assert_eq!(read.unwrap(), ReadResult::done());
        reader.closed().await.unwrap();
    }

    struct Doubler;

    impl Transformer<u32, u64> for Doubler {
        fn transform(
            &self,
            chunk: u32,
            controller: TransformStreamDefaultController<u64>,
        ) -> AlgorithmFuture {
            let result = controller.enqueue(u64::from(chunk) * 2);
            Box::pin(std::future::ready(result))
        }
    }

    #[tokio::test]
    async fn transformer_maps_chunks_between_types() {
        let pair = TransformStream::new(Doubler).into_pair();
        let writer = pair.writable.get_writer().unwrap();
        let reader = pair.readable.get_reader().unwrap();

        let (write, read) = futures::join!(writer.write(21), reader.read());
        write.unwrap();
        assert_eq!(read.unwrap(), ReadResult::chunk(42));
    }

    struct Summing {
        total: Cell<u32>,
    }

    impl Transformer<u32, u32> for Summing {
        fn transform(
            &self,
            chunk: u32,
            _controller: TransformStreamDefaultController<u32>,
        ) -> AlgorithmFuture {
            self.total.set(self.total.get() + chunk);
            resolved()
        }

        fn flush(&self, controller: TransformStreamDefaultController<u32>) -> AlgorithmFuture {
            let result = controller.enqueue(self.total.get());
            Box::pin(std::future::ready(result))
        }
    }

    #[tokio::test]
    async fn flush_emits_trailing_output_before_close() {
        let stream = TransformStream::with_strategies(
            Summing {
                total: Cell::new(0),
            },
            QueuingStrategy::default(),
            QueuingStrategy::with_high_water_mark(1.0),
        )
        .unwrap();
        let pair = stream.into_pair();
        let writer = pair.writable.get_writer().unwrap();
        let reader = pair.readable.get_reader().unwrap();

        writer.write(1).await.unwrap();
        writer.write(2).await.unwrap();
        writer.write(3).await.unwrap();

        let (close, first, second) =
            futures::join!(writer.close(), reader.read(), reader.read());
        close.unwrap();
        assert_eq!(first.unwrap(), ReadResult::chunk(6));
        assert_eq!(second.unwrap(), ReadResult::done());
    }

    struct Failing {
        error: StreamError,
    }

    impl Transformer<u32, u32> for Failing {
        fn transform(
            &self,
            _chunk: u32,
            _controller: TransformStreamDefaultController<u32>,
        ) -> AlgorithmFuture {
            let error = self.error.clone();
            Box::pin(std::future::ready(Err(error)))
        }
    }

    #[tokio::test]
    async fn transform_failure_errors_both_sides() {
        let error = StreamError::type_error("cannot transform this");
        let pair = TransformStream::new(Failing {
            error: error.clone(),
        })
        .into_pair();
        let writer = pair.writable.get_writer().unwrap();
        let reader = pair.readable.get_reader().unwrap();

        let (write, read) = futures::join!(writer.write(1), reader.read());
        assert_eq!(write.unwrap_err(), error);
        assert_eq!(read.unwrap_err(), error);
        assert_eq!(writer.closed().await.unwrap_err(), error);
    }

    struct Terminating;

    impl Transformer<u32, u32> for Terminating {
        fn transform(
            &self,
            _chunk: u32,
            controller: TransformStreamDefaultController<u32>,
        ) -> AlgorithmFuture {
            controller.terminate();
            resolved()
        }
    }

    #[tokio::test]
    async fn terminate_closes_readable_and_errors_writable() {
        let pair = TransformStream::new(Terminating).into_pair();
        let writer = pair.writable.get_writer().unwrap();
        let reader = pair.readable.get_reader().unwrap();

        let (write, read) = futures::join!(writer.write(1), reader.read());
        write.unwrap();
        assert_eq!(read.unwrap(), ReadResult::done());

        let error = writer.write(2).await.unwrap_err();
        assert_eq!(error.name(), ErrorName::TypeError);
        assert_eq!(writer.closed().await.unwrap_err().name(), ErrorName::TypeError);
    }

    #[tokio::test]
    async fn cancelling_the_readable_side_runs_the_cancel_callback_once() {
        struct CancelProbe {
            cancelled: Rc<RefCell<Option<StreamError>>>,
        }

        impl Transformer<u32, u32> for CancelProbe {
            fn transform(
                &self,
                _chunk: u32,
                _controller: TransformStreamDefaultController<u32>,
            ) -> AlgorithmFuture {
                resolved()
            }

            fn cancel(&self, reason: StreamError) -> AlgorithmFuture {
                *self.cancelled.borrow_mut() = Some(reason);
                resolved()
            }
        }

        let cancelled = Rc::new(RefCell::new(None));
        let pair = TransformStream::new(CancelProbe {
            cancelled: Rc::clone(&cancelled),
        })
        .into_pair();
        let writer = pair.writable.get_writer().unwrap();

        let reason = StreamError::aborted("no more output needed");
        pair.readable.cancel(reason.clone()).await.unwrap();
        assert_eq!(cancelled.borrow().clone().unwrap(), reason);

        // The writable side was errored with the same reason.
        assert_eq!(writer.write(1).await.unwrap_err(), reason);
        // The abort path joins the finished cancel instead of re-running it.
        let _ = writer.abort(StreamError::aborted("late")).await;
        assert_eq!(cancelled.borrow().clone().unwrap(), reason);
    }
}
