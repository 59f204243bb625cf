use std::{
    cell::{Cell, RefCell},
    future::Future,
    rc::Rc,
};

use futures::future::LocalBoxFuture;

use crate::{
    abort::{AbortSignal, AbortSubscription},
    error::StreamError,
    readable::{
        acquire_default_reader, ReadResult, ReadableInner, ReadableStreamDefaultReader,
    },
    utils::{
        deferred::Deferred,
        reactor::{drive_with_pair, upon_settled},
    },
    writable::{self, WritableInner, WritableStream, WritableStreamDefaultWriter},
    StreamResult,
};

/// Options controlling how [`ReadableStream::pipe_to`] reacts to the two
/// streams settling, and an optional signal to abort the pipe from outside.
///
/// By default closure and errors propagate in both directions; each
/// `prevent_*` flag suppresses one of the propagations.
///
/// [`ReadableStream::pipe_to`]: crate::ReadableStream::pipe_to
/// https://streams.spec.whatwg.org/#rs-pipe-to
#[derive(Default, Clone)]
pub struct PipeOptions {
    pub prevent_close: bool,
    pub prevent_abort: bool,
    pub prevent_cancel: bool,
    pub signal: Option<AbortSignal>,
}

type ShutdownAction = Box<dyn FnOnce() -> LocalBoxFuture<'static, StreamResult<()>>>;

fn deferred_action(deferred: Deferred<()>) -> LocalBoxFuture<'static, StreamResult<()>> {
    Box::pin(async move { deferred.once().await })
}

/// https://streams.spec.whatwg.org/#readable-stream-pipe-to
pub(crate) fn pipe_to<T: 'static>(
    source: Rc<ReadableInner<T>>,
    dest: WritableStream<T>,
    options: PipeOptions,
) -> impl Future<Output = StreamResult<()>> {
    let source_reactor = source.reactor.clone();
    let dest_reactor = dest.inner.reactor.clone();
    let promise: Deferred<()> = Deferred::new();
    if let Err(error) = start_pipe(source, dest, options, promise.clone()) {
        promise.reject(error);
    }
    drive_with_pair(source_reactor, dest_reactor, promise.once())
}

struct PipeState<T: 'static> {
    dest: Rc<WritableInner<T>>,
    reader: ReadableStreamDefaultReader<T>,
    writer: WritableStreamDefaultWriter<T>,
    prevent_close: bool,
    prevent_abort: bool,
    prevent_cancel: bool,
    shutting_down: Cell<bool>,
    /// The most recent sink write; shutdown waits for it (and any writes
    /// queued while waiting) before acting on the destination.
    current_write: RefCell<Deferred<()>>,
    promise: Deferred<()>,
    signal: Option<AbortSignal>,
    subscription: Cell<Option<AbortSubscription>>,
}

fn start_pipe<T: 'static>(
    source: Rc<ReadableInner<T>>,
    dest: WritableStream<T>,
    options: PipeOptions,
    promise: Deferred<()>,
) -> StreamResult<()> {
    if source.core.borrow().reader.is_some() {
        return Err(StreamError::type_error(
            "Cannot pipe a stream locked to a reader",
        ));
    }
    if dest.locked() {
        return Err(StreamError::type_error(
            "Cannot pipe to a stream locked to a writer",
        ));
    }

    let reader = acquire_default_reader(&source)?;
    let writer = writable::acquire_writer(&dest.inner)?;
    let source_closed = reader.closed_deferred().clone();
    let dest_closed = writer.closed_deferred();

    let state = Rc::new(PipeState {
        dest: Rc::clone(&dest.inner),
        reader,
        writer,
        prevent_close: options.prevent_close,
        prevent_abort: options.prevent_abort,
        prevent_cancel: options.prevent_cancel,
        shutting_down: Cell::new(false),
        current_write: RefCell::new(Deferred::resolved(())),
        promise,
        signal: options.signal.clone(),
        subscription: Cell::new(None),
    });

    let source = Rc::clone(&state.reader.stream);
    let reactor = source.reactor.clone();

    if let Some(signal) = &options.signal {
        let abort_state = Rc::clone(&state);
        let abort_source = Rc::clone(&source);
        let subscription = signal.on_abort(move |reason| {
            let mut actions: Vec<ShutdownAction> = Vec::new();
            if !abort_state.prevent_abort {
                let dest = Rc::clone(&abort_state.dest);
                let error = reason.clone();
                actions.push(Box::new(move || {
                    deferred_action(writable::abort_internal(&dest, Some(error)))
                }));
            }
            if !abort_state.prevent_cancel {
                let error = reason.clone();
                actions.push(Box::new(move || {
                    deferred_action(ReadableInner::cancel(&abort_source, error))
                }));
            }
            let action: ShutdownAction = Box::new(move || {
                Box::pin(async move {
                    let mut outcome = Ok(());
                    for action in actions {
                        let result = action().await;
                        if outcome.is_ok() {
                            outcome = result;
                        }
                    }
                    outcome
                })
            });
            abort_state.shutdown(Some(action), Some(reason));
        });
        state.subscription.set(Some(subscription));
    }

    // Errors must be propagated forward, and closure with them; both arrive
    // through the reader's closed promise.
    let forward_state = Rc::clone(&state);
    upon_settled(&reactor, &source_closed, move |outcome| {
        match outcome {
            Err(error) => {
                if !forward_state.prevent_abort {
                    let dest = Rc::clone(&forward_state.dest);
                    let abort_error = error.clone();
                    let action: ShutdownAction = Box::new(move || {
                        deferred_action(writable::abort_internal(&dest, Some(abort_error)))
                    });
                    forward_state.shutdown(Some(action), Some(error));
                } else {
                    forward_state.shutdown(None, Some(error));
                }
            }
            Ok(()) => {
                if !forward_state.prevent_close {
                    let writer_state = Rc::clone(&forward_state);
                    let action: ShutdownAction = Box::new(move || {
                        deferred_action(writer_state.writer.close_with_error_propagation())
                    });
                    forward_state.shutdown(Some(action), None);
                } else {
                    forward_state.shutdown(None, None);
                }
            }
        }
    });

    // Errors must be propagated backward.
    let backward_state = Rc::clone(&state);
    let backward_source = Rc::clone(&source);
    upon_settled(&reactor, &dest_closed, move |outcome| {
        if let Err(error) = outcome {
            if !backward_state.prevent_cancel {
                let cancel_error = error.clone();
                let action: ShutdownAction = Box::new(move || {
                    deferred_action(ReadableInner::cancel(&backward_source, cancel_error))
                });
                backward_state.shutdown(Some(action), Some(error));
            } else {
                backward_state.shutdown(None, Some(error));
            }
        }
    });

    // Closing must be propagated backward: a destination that is already
    // closed or closing can accept no chunks.
    let closing_state = Rc::clone(&state);
    let closing_source = Rc::clone(&source);
    reactor.spawn(async move {
        if writable::is_closed_or_closing(&closing_state.dest) {
            let error = StreamError::type_error(
                "the destination writable stream closed before all data could be piped to it",
            );
            if !closing_state.prevent_cancel {
                let cancel_error = error.clone();
                let action: ShutdownAction = Box::new(move || {
                    deferred_action(ReadableInner::cancel(&closing_source, cancel_error))
                });
                closing_state.shutdown(Some(action), Some(error));
            } else {
                closing_state.shutdown(None, Some(error));
            }
        }
    });

    let loop_state = Rc::clone(&state);
    reactor.spawn(async move {
        loop {
            if loop_state.shutting_down.get() {
                break;
            }
            let ready = loop_state.writer.ready_deferred();
            if ready.settled().await.is_err() {
                // Destination errored; the backward watcher shuts down.
                break;
            }
            if loop_state.shutting_down.get() {
                break;
            }
            match loop_state.reader.read().await {
                Ok(ReadResult {
                    value: Some(chunk), ..
                }) => {
                    let write = loop_state.writer.write_with_deferred(chunk);
                    write.mark_handled();
                    *loop_state.current_write.borrow_mut() = write;
                }
                // Closure and errors reach the watchers through the closed
                // promise.
                Ok(_) | Err(_) => break,
            }
        }
    });

    Ok(())
}

impl<T: 'static> PipeState<T> {
    /// https://streams.spec.whatwg.org/#rs-pipeTo-shutdown-with-action
    fn shutdown(self: &Rc<Self>, action: Option<ShutdownAction>, original_error: Option<StreamError>) {
        if self.shutting_down.replace(true) {
            return;
        }
        tracing::debug!(errored = original_error.is_some(), "pipe shutting down");
        let state = Rc::clone(self);
        self.reader.stream.reactor.spawn(async move {
            if writable::is_writable(&state.dest)
                && !writable::close_queued_or_in_flight(&state.dest)
            {
                // Drain writes the loop already issued; new ones may be
                // issued while we wait.
                loop {
                    let write = state.current_write.borrow().clone();
                    let _ = write.settled().await;
                    if state.current_write.borrow().ptr_eq(&write) {
                        break;
                    }
                }
            }
            let outcome = match action {
                Some(action) => action().await,
                None => Ok(()),
            };
            let error = match outcome {
                Ok(()) => original_error,
                Err(error) => Some(error),
            };
            state.finalize(error);
        });
    }

    /// https://streams.spec.whatwg.org/#rs-pipeTo-finalize
    fn finalize(&self, error: Option<StreamError>) {
        self.writer.release_lock();
        self.reader.release_lock();
        if let (Some(signal), Some(subscription)) = (&self.signal, self.subscription.take()) {
            signal.unsubscribe(subscription);
        }
        match error {
            Some(error) => self.promise.reject(error),
            None => self.promise.resolve(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        abort::AbortController,
        readable::{ReadableStream, ReadableStreamDefaultController, UnderlyingSource},
        writable::{UnderlyingSink, WritableStreamDefaultController},
    };

    use super::*;

    fn ready() -> crate::AlgorithmFuture {
        Box::pin(std::future::ready(Ok(())))
    }

    struct ChunkSource {
        chunks: RefCell<Vec<u32>>,
        cancelled: Rc<RefCell<Option<StreamError>>>,
    }

    impl ChunkSource {
        fn new(chunks: Vec<u32>) -> (Self, Rc<RefCell<Option<StreamError>>>) {
            let cancelled = Rc::new(RefCell::new(None));
            (
                Self {
                    chunks: RefCell::new(chunks),
                    cancelled: Rc::clone(&cancelled),
                },
                cancelled,
            )
        }
    }

    impl UnderlyingSource<u32> for ChunkSource {
        fn pull(&self, controller: ReadableStreamDefaultController<u32>) -> crate::AlgorithmFuture {
            let mut chunks = self.chunks.borrow_mut();
            if chunks.is_empty() {
                controller.close().unwrap();
            } else {
                controller.enqueue(chunks.remove(0)).unwrap();
            }
            ready()
        }

        fn cancel(&self, reason: StreamError) -> crate::AlgorithmFuture {
            *self.cancelled.borrow_mut() = Some(reason);
            ready()
        }
    }

    #[derive(Default)]
    struct PipeSink {
        written: Rc<RefCell<Vec<u32>>>,
        closed: Rc<Cell<bool>>,
        aborted: Rc<RefCell<Option<StreamError>>>,
    }

    impl UnderlyingSink<u32> for PipeSink {
        fn write(
            &self,
            chunk: u32,
            _controller: WritableStreamDefaultController<u32>,
        ) -> crate::AlgorithmFuture {
            self.written.borrow_mut().push(chunk);
            ready()
        }

        fn close(&self) -> crate::AlgorithmFuture {
            self.closed.set(true);
            ready()
        }

        fn abort(&self, reason: StreamError) -> crate::AlgorithmFuture {
            *self.aborted.borrow_mut() = Some(reason);
            ready()
        }
    }

    #[tokio::test]
    async fn delivers_every_chunk_then_closes_the_destination() {
        let (source, _) = ChunkSource::new(vec![1, 2, 3]);
        let readable = ReadableStream::new(source);
        let sink = PipeSink::default();
        let written = Rc::clone(&sink.written);
        let closed = Rc::clone(&sink.closed);
        let dest = WritableStream::new(sink);

        readable
            .pipe_to(&dest, PipeOptions::default())
            .await
            .unwrap();

        assert_eq!(*written.borrow(), vec![1, 2, 3]);
        assert!(closed.get());
        assert!(!readable.locked());
        assert!(!dest.locked());
    }

    struct BrokenSource {
        error: StreamError,
    }

    impl UnderlyingSource<u32> for BrokenSource {
        fn pull(&self, _controller: ReadableStreamDefaultController<u32>) -> crate::AlgorithmFuture {
            let error = self.error.clone();
            Box::pin(std::future::ready(Err(error)))
        }
    }

    #[tokio::test]
    async fn source_error_aborts_the_destination() {
        let error = StreamError::type_error("source gave out");
        let readable = ReadableStream::new(BrokenSource {
            error: error.clone(),
        });
        let sink = PipeSink::default();
        let aborted = Rc::clone(&sink.aborted);
        let dest = WritableStream::new(sink);

        let outcome = readable.pipe_to(&dest, PipeOptions::default()).await;
        assert_eq!(outcome.unwrap_err(), error);
        assert_eq!(aborted.borrow().clone().unwrap(), error);
    }

    struct RejectingSink {
        error: StreamError,
    }

    impl UnderlyingSink<u32> for RejectingSink {
        fn write(
            &self,
            _chunk: u32,
            _controller: WritableStreamDefaultController<u32>,
        ) -> crate::AlgorithmFuture {
            let error = self.error.clone();
            Box::pin(std::future::ready(Err(error)))
        }
    }

    #[tokio::test]
    async fn destination_error_cancels_the_source() {
        let (source, cancelled) = ChunkSource::new(vec![1, 2, 3]);
        let readable = ReadableStream::new(source);
        let error = StreamError::type_error("destination refused");
        let dest = WritableStream::new(RejectingSink {
            error: error.clone(),
        });

        let outcome = readable.pipe_to(&dest, PipeOptions::default()).await;
        assert_eq!(outcome.unwrap_err(), error);
        assert_eq!(cancelled.borrow().clone().unwrap(), error);
    }

    #[tokio::test]
    async fn aborted_signal_tears_down_both_ends() {
        let (source, cancelled) = ChunkSource::new(vec![1, 2, 3]);
        let readable = ReadableStream::new(source);
        let sink = PipeSink::default();
        let aborted = Rc::clone(&sink.aborted);
        let dest = WritableStream::new(sink);

        let controller = AbortController::new();
        let reason = StreamError::aborted("caller moved on");
        controller.abort(Some(reason.clone()));

        let options = PipeOptions {
            signal: Some(controller.signal()),
            ..PipeOptions::default()
        };
        let outcome = readable.pipe_to(&dest, options).await;
        assert_eq!(outcome.unwrap_err(), reason);
        assert_eq!(aborted.borrow().clone().unwrap(), reason);
        assert_eq!(cancelled.borrow().clone().unwrap(), reason);
    }

    #[tokio::test]
    async fn prevent_close_leaves_the_destination_writable() {
        let (source, _) = ChunkSource::new(vec![1]);
        let readable = ReadableStream::new(source);
        let sink = PipeSink::default();
        let written = Rc::clone(&sink.written);
        let closed = Rc::clone(&sink.closed);
        let dest = WritableStream::new(sink);

        let options = PipeOptions {
            prevent_close: true,
            ..PipeOptions::default()
        };
        readable.pipe_to(&dest, options).await.unwrap();
        assert_eq!(*written.borrow(), vec![1]);
        assert!(!closed.get());

        dest.close().await.unwrap();
        assert!(closed.get());
    }

    #[tokio::test]
    async fn piping_a_locked_stream_is_refused() {
        let (source, _) = ChunkSource::new(vec![1]);
        let readable = ReadableStream::new(source);
        let _reader = readable.get_reader().unwrap();
        let dest = WritableStream::new(PipeSink::default());

        let error = readable
            .pipe_to(&dest, PipeOptions::default())
            .await
            .unwrap_err();
        assert_eq!(error.name(), crate::ErrorName::TypeError);
    }
}
