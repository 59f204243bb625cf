use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use crate::{
    error::{ErrorName, StreamError},
    queuing_strategy::QueuingStrategy,
    writable::{UnderlyingSink, WritableStream, WritableStreamDefaultController},
    AlgorithmFuture,
};

fn resolved() -> AlgorithmFuture {
    Box::pin(std::future::ready(Ok(())))
}

#[derive(Default)]
struct RecordingSink {
    written: Rc<RefCell<Vec<u32>>>,
    closed: Rc<Cell<bool>>,
    aborted: Rc<RefCell<Option<StreamError>>>,
}

impl RecordingSink {
    fn into_probes(
        self,
    ) -> (
        Self,
        Rc<RefCell<Vec<u32>>>,
        Rc<Cell<bool>>,
        Rc<RefCell<Option<StreamError>>>,
    ) {
        let written = Rc::clone(&self.written);
        let closed = Rc::clone(&self.closed);
        let aborted = Rc::clone(&self.aborted);
        (self, written, closed, aborted)
    }
}

impl UnderlyingSink<u32> for RecordingSink {
    fn write(&self, chunk: u32, _controller: WritableStreamDefaultController<u32>) -> AlgorithmFuture {
        self.written.borrow_mut().push(chunk);
        resolved()
    }

    fn close(&self) -> AlgorithmFuture {
        self.closed.set(true);
        resolved()
    }

    fn abort(&self, reason: StreamError) -> AlgorithmFuture {
        *self.aborted.borrow_mut() = Some(reason);
        resolved()
    }
}

#[tokio::test]
async fn writes_reach_the_sink_in_order() {
    let (sink, written, ..) = RecordingSink::default().into_probes();
    let stream = WritableStream::new(sink);
    let writer = stream.get_writer().unwrap();

    let first = writer.write(1);
    let second = writer.write(2);
    let third = writer.write(3);
    let (first, second, third) = futures::join!(first, second, third);
    first.unwrap();
    second.unwrap();
    third.unwrap();

    assert_eq!(*written.borrow(), vec![1, 2, 3]);
}

#[tokio::test]
async fn close_flushes_queued_writes_first() {
    let (sink, written, closed, _) = RecordingSink::default().into_probes();
    let stream = WritableStream::new(sink);
    let writer = stream.get_writer().unwrap();

    let write = writer.write(7);
    let close = writer.close();
    let (write, close) = futures::join!(write, close);
    write.unwrap();
    close.unwrap();

    assert_eq!(*written.borrow(), vec![7]);
    assert!(closed.get());
    writer.closed().await.unwrap();

    let error = writer.write(8).await.unwrap_err();
    assert_eq!(error.name(), ErrorName::TypeError);
}

#[tokio::test]
async fn desired_size_tracks_the_queue() {
    let (sink, ..) = RecordingSink::default().into_probes();
    let stream = WritableStream::with_strategy(
        sink,
        QueuingStrategy::with_high_water_mark(2.0),
    )
    .unwrap();
    let writer = stream.get_writer().unwrap();

    assert_eq!(writer.desired_size().unwrap(), Some(2.0));
    let pending = writer.write(7);
    assert_eq!(writer.desired_size().unwrap(), Some(1.0));
    pending.await.unwrap();
    assert_eq!(writer.desired_size().unwrap(), Some(2.0));
}

#[tokio::test]
async fn abort_rejects_queued_writes_and_reaches_the_sink() {
    let (sink, written, _, aborted) = RecordingSink::default().into_probes();
    let stream = WritableStream::new(sink);
    let writer = stream.get_writer().unwrap();
    writer.write(0).await.unwrap();

    let first = writer.write(1);
    let second = writer.write(2);
    let reason = StreamError::aborted("lost interest");
    writer.abort(reason.clone()).await.unwrap();

    // The in-flight write completes; the queued one is dropped.
    first.await.unwrap();
    assert_eq!(second.await.unwrap_err(), reason);
    assert_eq!(*written.borrow(), vec![0, 1]);
    assert_eq!(aborted.borrow().clone().unwrap(), reason);

    assert_eq!(writer.desired_size().unwrap(), None);
    assert_eq!(writer.closed().await.unwrap_err(), reason);
}

#[tokio::test]
async fn ready_applies_backpressure_at_the_high_water_mark() {
    let (sink, ..) = RecordingSink::default().into_probes();
    let stream = WritableStream::new(sink);
    let writer = stream.get_writer().unwrap();

    // Empty queue, high water mark 1: no backpressure.
    writer.ready().await.unwrap();
    let pending = writer.write(1);
    // The queued chunk fills the queue; ready resolves again once the sink
    // has taken it.
    writer.ready().await.unwrap();
    pending.await.unwrap();
    assert_eq!(writer.desired_size().unwrap(), Some(1.0));
}

#[tokio::test]
async fn released_writer_rejects_operations_and_frees_the_lock() {
    let (sink, ..) = RecordingSink::default().into_probes();
    let stream = WritableStream::new(sink);
    let writer = stream.get_writer().unwrap();
    assert!(stream.locked());

    writer.release_lock();
    assert!(!stream.locked());
    let error = writer.write(1).await.unwrap_err();
    assert_eq!(error.name(), ErrorName::TypeError);
    assert!(writer.desired_size().is_err());

    // The lock is free for a new writer.
    let writer = stream.get_writer().unwrap();
    writer.write(2).await.unwrap();
}

#[tokio::test]
async fn dropping_the_writer_releases_the_lock() {
    let (sink, ..) = RecordingSink::default().into_probes();
    let stream = WritableStream::new(sink);
    drop(stream.get_writer().unwrap());
    assert!(!stream.locked());
}

struct FailingSink {
    error: StreamError,
}

impl UnderlyingSink<u32> for FailingSink {
    fn write(&self, _chunk: u32, _controller: WritableStreamDefaultController<u32>) -> AlgorithmFuture {
        let error = self.error.clone();
        Box::pin(std::future::ready(Err(error)))
    }
}

#[tokio::test]
async fn sink_write_failure_errors_the_stream() {
    let error = StreamError::type_error("disk full");
    let stream = WritableStream::new(FailingSink {
        error: error.clone(),
    });
    let writer = stream.get_writer().unwrap();

    assert_eq!(writer.write(1).await.unwrap_err(), error);
    assert_eq!(writer.closed().await.unwrap_err(), error);
    assert_eq!(writer.write(2).await.unwrap_err(), error);
    assert_eq!(writer.desired_size().unwrap(), None);
}

struct SignalWatchingSink {
    observed: Rc<RefCell<Option<StreamError>>>,
}

impl UnderlyingSink<u32> for SignalWatchingSink {
    fn start(&self, controller: WritableStreamDefaultController<u32>) -> AlgorithmFuture {
        let observed = Rc::clone(&self.observed);
        controller.signal().on_abort(move |reason| {
            *observed.borrow_mut() = Some(reason);
        });
        resolved()
    }
}

#[tokio::test]
async fn aborting_fires_the_controller_signal() {
    let observed = Rc::new(RefCell::new(None));
    let stream = WritableStream::new(SignalWatchingSink {
        observed: Rc::clone(&observed),
    });
    let reason = StreamError::aborted("shutting down");
    stream.abort(reason.clone()).await.unwrap();
    assert_eq!(observed.borrow().clone().unwrap(), reason);
}

fn xorshift(state: &mut u32) -> u32 {
    *state ^= *state << 13;
    *state ^= *state >> 17;
    *state ^= *state << 5;
    *state
}

struct CountingSink {
    invocations: Rc<Cell<u32>>,
}

impl UnderlyingSink<u32> for CountingSink {
    fn write(&self, _chunk: u32, _controller: WritableStreamDefaultController<u32>) -> AlgorithmFuture {
        self.invocations.set(self.invocations.get() + 1);
        resolved()
    }

    fn close(&self) -> AlgorithmFuture {
        self.invocations.set(self.invocations.get() + 1);
        resolved()
    }

    fn abort(&self, _reason: StreamError) -> AlgorithmFuture {
        self.invocations.set(self.invocations.get() + 1);
        resolved()
    }
}

#[tokio::test]
async fn sink_stays_quiescent_after_the_stream_settles() {
    // Arbitrary writer operation sequences; once the stream reaches a
    // terminal state the sink must never hear from it again.
    for seed in [1u32, 0x2545_f491, 0x9e37_79b9, 0xdead_beef, 0x0bad_cafe] {
        let mut state = seed;
        let invocations = Rc::new(Cell::new(0));
        let stream = WritableStream::new(CountingSink {
            invocations: Rc::clone(&invocations),
        });
        let writer = stream.get_writer().unwrap();

        for op in 0..12u32 {
            match xorshift(&mut state) % 6 {
                0 => {
                    let _ = writer.close().await;
                }
                1 => {
                    let _ = writer.abort(StreamError::aborted("torn down")).await;
                }
                _ => {
                    let _ = writer.write(op).await;
                }
            }
        }
        let _ = writer.abort(StreamError::aborted("torn down")).await;
        let _ = writer.closed().await;
        let settled = invocations.get();

        for op in 0..8u32 {
            match xorshift(&mut state) % 3 {
                0 => {
                    let _ = writer.close().await;
                }
                1 => {
                    let _ = writer.abort(StreamError::aborted("again")).await;
                }
                _ => {
                    let _ = writer.write(100 + op).await;
                }
            }
        }
        assert_eq!(
            invocations.get(),
            settled,
            "seed {seed:#x}: sink invoked after the stream settled"
        );
    }
}
