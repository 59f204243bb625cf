use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use crate::{
    error::{ErrorName, StreamError},
    queuing_strategy::SizeAlgorithm,
    readable::{
        acquire_byob_reader, acquire_default_reader, byte_controller, default_controller,
        default_reader, source::ByteSourceAlgorithms, ByteView, ReadIntoRequest, ReadRequest,
        ReadableInner, ReadableStream, ReadableStreamByobReader, ReadableStreamDefaultReader,
    },
    utils::{deferred::Deferred, reactor::upon_settled},
    StreamResult,
};

fn resolved() -> crate::AlgorithmFuture {
    Box::pin(std::future::ready(Ok(())))
}

fn composite_cancel_reason(reasons: &RefCell<[Option<StreamError>; 2]>) -> StreamError {
    let mut reasons = reasons.borrow_mut();
    let first = reasons[0].take().unwrap_or_else(StreamError::aborted_default);
    let second = reasons[1].take().unwrap_or_else(StreamError::aborted_default);
    StreamError::composite(
        ErrorName::AbortError,
        "both branches of the tee were canceled",
        first,
        second,
    )
}

// ---------------------------------------------------------------------------
// Default tee
// ---------------------------------------------------------------------------

/// https://streams.spec.whatwg.org/#abstract-opdef-readablestreamdefaulttee
struct DefaultTeeState<T: 'static> {
    upstream: Rc<ReadableInner<T>>,
    // Owns the upstream lock for the lifetime of the tee.
    _reader: ReadableStreamDefaultReader<T>,
    reading: Cell<bool>,
    read_again: [Cell<bool>; 2],
    canceled: [Cell<bool>; 2],
    reasons: RefCell<[Option<StreamError>; 2]>,
    branches: RefCell<[Option<Rc<ReadableInner<T>>>; 2]>,
    cancel_deferred: Deferred<()>,
}

impl<T: Clone + 'static> DefaultTeeState<T> {
    fn branch(&self, index: usize) -> Rc<ReadableInner<T>> {
        self.branches.borrow()[index]
            .clone()
            .expect("tee branch used before initialization")
    }

    fn pull(self: &Rc<Self>, branch: usize) {
        if self.reading.get() {
            self.read_again[branch].set(true);
            return;
        }
        self.reading.set(true);
        default_reader::read_internal(
            &self.upstream,
            Box::new(DefaultTeeReadRequest {
                state: Rc::clone(self),
            }),
        );
    }

    fn cancel(self: &Rc<Self>, branch: usize, reason: StreamError) -> crate::AlgorithmFuture {
        self.canceled[branch].set(true);
        self.reasons.borrow_mut()[branch] = Some(reason);
        if self.canceled[1 - branch].get() {
            tracing::debug!("both tee branches canceled, canceling upstream");
            let upstream_cancel =
                ReadableInner::cancel(&self.upstream, composite_cancel_reason(&self.reasons));
            let settle = self.cancel_deferred.clone();
            upon_settled(&self.upstream.reactor, &upstream_cancel, move |outcome| {
                settle.settle(outcome)
            });
        }
        let watch = self.cancel_deferred.settled();
        Box::pin(async move { watch.await })
    }
}

struct DefaultTeeReadRequest<T: 'static> {
    state: Rc<DefaultTeeState<T>>,
}

impl<T: Clone + 'static> ReadRequest<T> for DefaultTeeReadRequest<T> {
    fn chunk_steps(self: Box<Self>, chunk: T) {
        let state = self.state;
        let reactor = state.upstream.reactor.clone();
        // Chunk delivery is deferred a tick so a reentrant cancel settles
        // first, mirroring the microtask the standard queues here.
        reactor.spawn(async move {
            state.read_again[0].set(false);
            state.read_again[1].set(false);
            let mut chunks = [Some(chunk.clone()), Some(chunk)];
            for branch in 0..2 {
                if !state.canceled[branch].get() {
                    let chunk = chunks[branch].take().expect("chunk already delivered");
                    // The branch may have been closed or errored; its
                    // controller already ignores late chunks.
                    let _ = default_controller::enqueue(&state.branch(branch), chunk);
                }
            }
            state.reading.set(false);
            if state.read_again[0].get() {
                state.pull(0);
            }
            if state.read_again[1].get() {
                state.pull(1);
            }
        });
    }

    fn close_steps(self: Box<Self>) {
        let state = self.state;
        let reactor = state.upstream.reactor.clone();
        reactor.spawn(async move {
            state.reading.set(false);
            for branch in 0..2 {
                if !state.canceled[branch].get() {
                    default_controller::close(&state.branch(branch));
                }
            }
            if !state.canceled[0].get() || !state.canceled[1].get() {
                state.cancel_deferred.resolve(());
            }
        });
    }

    fn error_steps(self: Box<Self>, _error: StreamError) {
        // The upstream error reaches the branches through the closed watcher.
        self.state.reading.set(false);
    }
}

pub(crate) fn default_tee<T: Clone + 'static>(
    inner: &Rc<ReadableInner<T>>,
) -> StreamResult<(ReadableStream<T>, ReadableStream<T>)> {
    let reader = acquire_default_reader(inner)?;
    let closed = reader.closed_deferred().clone();
    let state = Rc::new(DefaultTeeState {
        upstream: Rc::clone(inner),
        _reader: reader,
        reading: Cell::new(false),
        read_again: [Cell::new(false), Cell::new(false)],
        canceled: [Cell::new(false), Cell::new(false)],
        reasons: RefCell::new([None, None]),
        branches: RefCell::new([None, None]),
        cancel_deferred: Deferred::new(),
    });
    state.cancel_deferred.mark_handled();

    let mut streams = Vec::with_capacity(2);
    for branch in 0..2 {
        let pull_state = Rc::clone(&state);
        let cancel_state = Rc::clone(&state);
        let stream = ReadableStream::from_closures(
            inner.reactor.clone(),
            None,
            move || {
                pull_state.pull(branch);
                resolved()
            },
            move |reason| cancel_state.cancel(branch, reason),
            1.0,
            SizeAlgorithm::AlwaysOne,
        );
        state.branches.borrow_mut()[branch] = Some(Rc::clone(&stream.inner));
        streams.push(stream);
    }

    let watcher = Rc::clone(&state);
    upon_settled(&inner.reactor, &closed, move |outcome| {
        if let Err(error) = outcome {
            for branch in 0..2 {
                default_controller::error(&watcher.branch(branch), error.clone());
            }
            if !watcher.canceled[0].get() || !watcher.canceled[1].get() {
                watcher.cancel_deferred.resolve(());
            }
        }
    });

    let second = streams.pop().expect("two tee branches");
    let first = streams.pop().expect("two tee branches");
    Ok((first, second))
}

// ---------------------------------------------------------------------------
// Byte tee
// ---------------------------------------------------------------------------

enum TeeReader {
    Default(ReadableStreamDefaultReader<ByteView>),
    Byob(ReadableStreamByobReader),
}

impl TeeReader {
    fn closed(&self) -> Deferred<()> {
        match self {
            Self::Default(reader) => reader.closed_deferred().clone(),
            Self::Byob(reader) => reader.closed_deferred().clone(),
        }
    }
}

/// https://streams.spec.whatwg.org/#abstract-opdef-readablebytestreamtee
///
/// The upstream reader is swapped between default and BYOB flavors depending
/// on whether the pulling branch has an outstanding BYOB request, so
/// downstream BYOB reads keep their zero-copy path through the tee.
struct ByteTeeState {
    upstream: Rc<ReadableInner<ByteView>>,
    reader: RefCell<Option<TeeReader>>,
    /// Bumped on every reader swap; stale closed-watchers check it and bow out.
    generation: Cell<u64>,
    reading: Cell<bool>,
    read_again: [Cell<bool>; 2],
    canceled: [Cell<bool>; 2],
    reasons: RefCell<[Option<StreamError>; 2]>,
    branches: RefCell<[Option<Rc<ReadableInner<ByteView>>>; 2]>,
    cancel_deferred: Deferred<()>,
}

impl ByteTeeState {
    fn branch(&self, index: usize) -> Rc<ReadableInner<ByteView>> {
        self.branches.borrow()[index]
            .clone()
            .expect("tee branch used before initialization")
    }

    fn pull(self: &Rc<Self>, branch: usize) {
        if self.reading.get() {
            self.read_again[branch].set(true);
            return;
        }
        self.reading.set(true);
        match byte_controller::take_byob_view(&self.branch(branch)) {
            None => self.pull_with_default_reader(),
            Some(view) => self.pull_with_byob_reader(view, branch),
        }
    }

    fn pull_with_default_reader(self: &Rc<Self>) {
        self.ensure_reader(false);
        default_reader::read_internal(
            &self.upstream,
            Box::new(ByteTeeDefaultRequest {
                state: Rc::clone(self),
            }),
        );
    }

    fn pull_with_byob_reader(self: &Rc<Self>, view: ByteView, branch: usize) {
        self.ensure_reader(true);
        super::byob_reader::read_into_internal(
            &self.upstream,
            view,
            1,
            Box::new(ByteTeeByobRequest {
                state: Rc::clone(self),
                branch,
            }),
        );
    }

    /// Swaps the upstream reader flavor if needed and re-arms the error
    /// forwarder for the new reader.
    fn ensure_reader(self: &Rc<Self>, byob: bool) {
        {
            let reader = self.reader.borrow();
            let matches_flavor = match reader.as_ref() {
                Some(TeeReader::Byob(_)) => byob,
                Some(TeeReader::Default(_)) => !byob,
                None => false,
            };
            if matches_flavor {
                return;
            }
        }
        if let Some(old) = self.reader.borrow_mut().take() {
            match old {
                TeeReader::Default(reader) => reader.release_lock(),
                TeeReader::Byob(reader) => reader.release_lock(),
            }
        }
        let new_reader = if byob {
            TeeReader::Byob(
                acquire_byob_reader(&self.upstream).expect("tee upstream lock was just released"),
            )
        } else {
            TeeReader::Default(
                acquire_default_reader(&self.upstream)
                    .expect("tee upstream lock was just released"),
            )
        };
        let generation = self.generation.get() + 1;
        self.generation.set(generation);
        self.forward_reader_error(&new_reader, generation);
        *self.reader.borrow_mut() = Some(new_reader);
    }

    /// https://streams.spec.whatwg.org/#ref-for-read-request③ (forwardReaderError)
    fn forward_reader_error(self: &Rc<Self>, reader: &TeeReader, generation: u64) {
        let state = Rc::clone(self);
        upon_settled(&self.upstream.reactor, &reader.closed(), move |outcome| {
            if state.generation.get() != generation {
                return;
            }
            if let Err(error) = outcome {
                for branch in 0..2 {
                    byte_controller::error(&state.branch(branch), error.clone());
                }
                if !state.canceled[0].get() || !state.canceled[1].get() {
                    state.cancel_deferred.resolve(());
                }
            }
        });
    }

    fn cancel(self: &Rc<Self>, branch: usize, reason: StreamError) -> crate::AlgorithmFuture {
        self.canceled[branch].set(true);
        self.reasons.borrow_mut()[branch] = Some(reason);
        if self.canceled[1 - branch].get() {
            tracing::debug!("both tee branches canceled, canceling upstream");
            let upstream_cancel =
                ReadableInner::cancel(&self.upstream, composite_cancel_reason(&self.reasons));
            let settle = self.cancel_deferred.clone();
            upon_settled(&self.upstream.reactor, &upstream_cancel, move |outcome| {
                settle.settle(outcome)
            });
        }
        let watch = self.cancel_deferred.settled();
        Box::pin(async move { watch.await })
    }

    fn finish_read(self: &Rc<Self>, preferred: usize) {
        self.reading.set(false);
        if self.read_again[preferred].get() {
            self.pull(preferred);
        } else if self.read_again[1 - preferred].get() {
            self.pull(1 - preferred);
        }
    }
}

struct ByteTeeDefaultRequest {
    state: Rc<ByteTeeState>,
}

impl ReadRequest<ByteView> for ByteTeeDefaultRequest {
    fn chunk_steps(self: Box<Self>, chunk: ByteView) {
        let state = self.state;
        let reactor = state.upstream.reactor.clone();
        reactor.spawn(async move {
            state.read_again[0].set(false);
            state.read_again[1].set(false);
            let canceled = [state.canceled[0].get(), state.canceled[1].get()];
            let second_chunk = if !canceled[0] && !canceled[1] {
                Some(ByteView::uint8(chunk.to_vec()))
            } else if !canceled[1] {
                Some(chunk.clone())
            } else {
                None
            };
            if !canceled[0] {
                let _ = byte_controller::enqueue(&state.branch(0), chunk);
            }
            if let Some(second_chunk) = second_chunk {
                if !canceled[1] {
                    let _ = byte_controller::enqueue(&state.branch(1), second_chunk);
                }
            }
            state.finish_read(0);
        });
    }

    fn close_steps(self: Box<Self>) {
        let state = self.state;
        let reactor = state.upstream.reactor.clone();
        reactor.spawn(async move {
            state.reading.set(false);
            for branch in 0..2 {
                if !state.canceled[branch].get() {
                    let inner = state.branch(branch);
                    let _ = byte_controller::close(&inner);
                    if byte_controller::has_pending_pull_intos(&inner) {
                        let _ = byte_controller::respond(&inner, 0);
                    }
                }
            }
            if !state.canceled[0].get() || !state.canceled[1].get() {
                state.cancel_deferred.resolve(());
            }
        });
    }

    fn error_steps(self: Box<Self>, _error: StreamError) {
        self.state.reading.set(false);
    }
}

struct ByteTeeByobRequest {
    state: Rc<ByteTeeState>,
    branch: usize,
}

impl ReadIntoRequest for ByteTeeByobRequest {
    fn chunk_steps(self: Box<Self>, chunk: ByteView) {
        let state = self.state;
        let branch = self.branch;
        let reactor = state.upstream.reactor.clone();
        reactor.spawn(async move {
            state.read_again[0].set(false);
            state.read_again[1].set(false);
            let byob_canceled = state.canceled[branch].get();
            let other_canceled = state.canceled[1 - branch].get();
            if !other_canceled {
                let cloned = ByteView::uint8(chunk.to_vec());
                if !byob_canceled {
                    let _ =
                        byte_controller::respond_with_new_view(&state.branch(branch), chunk);
                }
                let _ = byte_controller::enqueue(&state.branch(1 - branch), cloned);
            } else if !byob_canceled {
                let _ = byte_controller::respond_with_new_view(&state.branch(branch), chunk);
            }
            state.finish_read(branch);
        });
    }

    fn close_steps(self: Box<Self>, chunk: Option<ByteView>) {
        let state = self.state;
        let branch = self.branch;
        let reactor = state.upstream.reactor.clone();
        reactor.spawn(async move {
            state.reading.set(false);
            let byob_canceled = state.canceled[branch].get();
            let other_canceled = state.canceled[1 - branch].get();
            if !byob_canceled {
                let _ = byte_controller::close(&state.branch(branch));
            }
            if !other_canceled {
                let _ = byte_controller::close(&state.branch(1 - branch));
            }
            if let Some(chunk) = chunk {
                debug_assert_eq!(chunk.byte_length(), 0);
                if !byob_canceled {
                    let _ =
                        byte_controller::respond_with_new_view(&state.branch(branch), chunk);
                }
                let other = state.branch(1 - branch);
                if !other_canceled && byte_controller::has_pending_pull_intos(&other) {
                    let _ = byte_controller::respond(&other, 0);
                }
            }
            if !byob_canceled || !other_canceled {
                state.cancel_deferred.resolve(());
            }
        });
    }

    fn error_steps(self: Box<Self>, _error: StreamError) {
        self.state.reading.set(false);
    }
}

pub(crate) fn byte_tee(
    inner: &Rc<ReadableInner<ByteView>>,
) -> StreamResult<(ReadableStream<ByteView>, ReadableStream<ByteView>)> {
    let reader = acquire_default_reader(inner)?;
    let state = Rc::new(ByteTeeState {
        upstream: Rc::clone(inner),
        reader: RefCell::new(None),
        generation: Cell::new(0),
        reading: Cell::new(false),
        read_again: [Cell::new(false), Cell::new(false)],
        canceled: [Cell::new(false), Cell::new(false)],
        reasons: RefCell::new([None, None]),
        branches: RefCell::new([None, None]),
        cancel_deferred: Deferred::new(),
    });
    state.cancel_deferred.mark_handled();
    let initial = TeeReader::Default(reader);
    state.forward_reader_error(&initial, 0);
    *state.reader.borrow_mut() = Some(initial);

    let mut streams = Vec::with_capacity(2);
    for branch in 0..2 {
        let pull_state = Rc::clone(&state);
        let cancel_state = Rc::clone(&state);
        let stream = ReadableStream::byte_from_closures(
            inner.reactor.clone(),
            ByteSourceAlgorithms::new(
                move || {
                    pull_state.pull(branch);
                    resolved()
                },
                move |reason| cancel_state.cancel(branch, reason),
            ),
        );
        state.branches.borrow_mut()[branch] = Some(Rc::clone(&stream.inner));
        streams.push(stream);
    }

    let second = streams.pop().expect("two tee branches");
    let first = streams.pop().expect("two tee branches");
    Ok((first, second))
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use crate::{
        readable::{
            source::{UnderlyingByteSource, UnderlyingSource},
            ReadResult, ReadableByteStreamController, ReadableStreamDefaultController,
        },
        AlgorithmFuture,
    };

    use super::*;

    fn ready() -> AlgorithmFuture {
        Box::pin(std::future::ready(Ok(())))
    }

    struct ListSource {
        chunks: RefCell<Vec<u32>>,
        cancelled: Rc<RefCell<Option<StreamError>>>,
    }

    impl ListSource {
        fn new(chunks: Vec<u32>) -> Self {
            Self {
                chunks: RefCell::new(chunks),
                cancelled: Rc::new(RefCell::new(None)),
            }
        }
    }

    impl UnderlyingSource<u32> for ListSource {
        fn pull(&self, controller: ReadableStreamDefaultController<u32>) -> AlgorithmFuture {
            let mut chunks = self.chunks.borrow_mut();
            if chunks.is_empty() {
                controller.close().unwrap();
            } else {
                controller.enqueue(chunks.remove(0)).unwrap();
            }
            ready()
        }

        fn cancel(&self, reason: StreamError) -> AlgorithmFuture {
            *self.cancelled.borrow_mut() = Some(reason);
            ready()
        }
    }

    #[tokio::test]
    async fn both_branches_see_every_chunk() {
        let stream = ReadableStream::new(ListSource::new(vec![1, 2, 3]));
        let (first, second) = stream.tee().unwrap();

        let reader = first.get_reader().unwrap();
        assert_eq!(reader.read().await.unwrap(), ReadResult::chunk(1));
        assert_eq!(reader.read().await.unwrap(), ReadResult::chunk(2));
        assert_eq!(reader.read().await.unwrap(), ReadResult::chunk(3));
        assert_eq!(reader.read().await.unwrap(), ReadResult::done());

        // The second branch buffered everything in the meantime.
        let reader = second.get_reader().unwrap();
        assert_eq!(reader.read().await.unwrap(), ReadResult::chunk(1));
        assert_eq!(reader.read().await.unwrap(), ReadResult::chunk(2));
        assert_eq!(reader.read().await.unwrap(), ReadResult::chunk(3));
        assert_eq!(reader.read().await.unwrap(), ReadResult::done());
    }

    #[tokio::test]
    async fn cancelling_one_branch_leaves_the_other_flowing() {
        let source = ListSource::new(vec![1, 2, 3]);
        let cancelled = Rc::clone(&source.cancelled);
        let stream = ReadableStream::new(source);
        let (first, second) = stream.tee().unwrap();

        let first_reader = first.get_reader().unwrap();
        assert_eq!(first_reader.read().await.unwrap(), ReadResult::chunk(1));
        first_reader.release_lock();
        let first_cancel = first.cancel(StreamError::aborted("done with this branch"));

        let reader = second.get_reader().unwrap();
        assert_eq!(reader.read().await.unwrap(), ReadResult::chunk(2));
        assert_eq!(reader.read().await.unwrap(), ReadResult::chunk(3));
        assert_eq!(reader.read().await.unwrap(), ReadResult::done());

        // One branch alone never cancels the upstream source.
        first_cancel.await.unwrap();
        assert!(cancelled.borrow().is_none());
    }

    #[tokio::test]
    async fn cancelling_both_branches_cancels_upstream_with_both_reasons() {
        let source = ListSource::new(vec![1, 2, 3]);
        let cancelled = Rc::clone(&source.cancelled);
        let stream = ReadableStream::new(source);
        let (first, second) = stream.tee().unwrap();

        let left = StreamError::aborted("left");
        let right = StreamError::aborted("right");
        let (first_cancel, second_cancel) =
            futures::join!(first.cancel(left.clone()), second.cancel(right.clone()));
        first_cancel.unwrap();
        second_cancel.unwrap();

        let reason = cancelled.borrow().clone().unwrap();
        assert_eq!(reason.name(), ErrorName::AbortError);
        assert_eq!(reason.parts(), Some((&left, &right)));
    }

    struct ErroringSource {
        error: StreamError,
    }

    impl UnderlyingSource<u32> for ErroringSource {
        fn pull(&self, _controller: ReadableStreamDefaultController<u32>) -> AlgorithmFuture {
            let error = self.error.clone();
            Box::pin(std::future::ready(Err(error)))
        }
    }

    #[tokio::test]
    async fn upstream_error_reaches_both_branches() {
        let error = StreamError::type_error("upstream broke");
        let stream = ReadableStream::new(ErroringSource {
            error: error.clone(),
        });
        let (first, second) = stream.tee().unwrap();

        let reader = first.get_reader().unwrap();
        assert_eq!(reader.read().await.unwrap_err(), error);
        let reader = second.get_reader().unwrap();
        assert_eq!(reader.read().await.unwrap_err(), error);
    }

    struct BytePushSource {
        sent: Cell<bool>,
    }

    impl UnderlyingByteSource for BytePushSource {
        fn pull(&self, controller: ReadableByteStreamController) -> AlgorithmFuture {
            if self.sent.replace(true) {
                controller.close().unwrap();
            } else {
                controller
                    .enqueue(ByteView::uint8(vec![10, 20, 30]))
                    .unwrap();
            }
            ready()
        }
    }

    #[tokio::test]
    async fn byte_tee_duplicates_byte_chunks() {
        let stream = ReadableStream::byte_source(BytePushSource {
            sent: Cell::new(false),
        })
        .unwrap();
        let (first, second) = stream.tee().unwrap();

        let reader = first.get_reader().unwrap();
        let chunk = reader.read().await.unwrap().value.unwrap();
        assert_eq!(chunk.as_slice(), &[10, 20, 30]);
        assert_eq!(reader.read().await.unwrap(), ReadResult::done());

        let reader = second.get_reader().unwrap();
        let chunk = reader.read().await.unwrap().value.unwrap();
        assert_eq!(chunk.as_slice(), &[10, 20, 30]);
        assert_eq!(reader.read().await.unwrap(), ReadResult::done());
    }
}
