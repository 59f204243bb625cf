use std::{cell::Cell, future::Future, rc::Rc};

use crate::{
    error::StreamError,
    readable::{
        byte_controller, default_reader::release_internal, ByteView, ReadIntoRequest, ReadResult,
        ReadableInner, ReadableState,
    },
    utils::{deferred::Deferred, reactor::drive_with},
    StreamResult,
};

/// The exclusive bring-your-own-buffer reader of a byte stream: each read
/// supplies the view the engine fills, so bytes land directly in
/// caller-owned storage.
///
/// Dropping the reader releases its lock.
/// https://streams.spec.whatwg.org/#byob-reader-class
pub struct ReadableStreamByobReader {
    pub(crate) stream: Rc<ReadableInner<ByteView>>,
    closed: Deferred<()>,
    released: Cell<bool>,
}

impl ReadableStreamByobReader {
    pub(crate) fn new(stream: Rc<ReadableInner<ByteView>>, closed: Deferred<()>) -> Self {
        Self {
            stream,
            closed,
            released: Cell::new(false),
        }
    }

    /// Reads into `view`, resolving once at least one element is filled (or
    /// the stream closes). The delivered view covers the filled region of
    /// the same buffer.
    /// https://streams.spec.whatwg.org/#byob-reader-read
    pub fn read_into(&self, view: ByteView) -> impl Future<Output = StreamResult<ReadResult<ByteView>>> {
        self.read_into_with_min(view, 1)
    }

    /// As [`read_into`], but only resolves once at least `min` elements are
    /// filled (closure and errors still resolve early).
    ///
    /// [`read_into`]: ReadableStreamByobReader::read_into
    pub fn read_into_with_min(
        &self,
        view: ByteView,
        min: usize,
    ) -> impl Future<Output = StreamResult<ReadResult<ByteView>>> {
        let deferred: Deferred<ReadResult<ByteView>> = Deferred::new();
        if let Err(error) = self.check_read_into(&view, min) {
            deferred.reject(error);
        } else {
            read_into_internal(
                &self.stream,
                view,
                min,
                Box::new(DeferredReadIntoRequest {
                    deferred: deferred.clone(),
                }),
            );
        }
        drive_with(self.stream.reactor.clone(), deferred.once())
    }

    fn check_read_into(&self, view: &ByteView, min: usize) -> StreamResult<()> {
        if self.released.get() {
            return Err(StreamError::type_error(
                "Cannot read from a stream using a released reader",
            ));
        }
        if view.byte_length() == 0 || view.buffer_byte_length() == 0 {
            return Err(StreamError::type_error("view must have non-zero byteLength"));
        }
        if min == 0 {
            return Err(StreamError::type_error("options.min must be greater than 0"));
        }
        if min > view.len() {
            return Err(StreamError::range_error(
                "options.min must be less than or equal to view's length",
            ));
        }
        Ok(())
    }

    /// https://streams.spec.whatwg.org/#byob-reader-cancel
    pub fn cancel(&self, reason: StreamError) -> impl Future<Output = StreamResult<()>> {
        let deferred = if self.released.get() {
            Deferred::rejected(StreamError::type_error(
                "Cannot cancel a stream using a released reader",
            ))
        } else {
            ReadableInner::cancel(&self.stream, reason)
        };
        drive_with(self.stream.reactor.clone(), deferred.once())
    }

    /// https://streams.spec.whatwg.org/#byob-reader-closed
    pub fn closed(&self) -> impl Future<Output = StreamResult<()>> {
        drive_with(self.stream.reactor.clone(), self.closed.settled())
    }

    pub(crate) fn closed_deferred(&self) -> &Deferred<()> {
        &self.closed
    }

    /// https://streams.spec.whatwg.org/#byob-reader-release-lock
    pub fn release_lock(&self) {
        if self.released.replace(true) {
            return;
        }
        release_internal(&self.stream);
    }
}

impl Drop for ReadableStreamByobReader {
    fn drop(&mut self) {
        if !self.released.replace(true) {
            release_internal(&self.stream);
        }
    }
}

/// https://streams.spec.whatwg.org/#readable-stream-byob-reader-read
pub(crate) fn read_into_internal(
    inner: &Rc<ReadableInner<ByteView>>,
    view: ByteView,
    min: usize,
    request: Box<dyn ReadIntoRequest>,
) {
    {
        let mut core = inner.core.borrow_mut();
        core.disturbed = true;
        if let ReadableState::Errored(error) = &core.state {
            request.error_steps(error.clone());
            return;
        }
    }
    byte_controller::pull_into(inner, view, min, request);
}

pub(crate) struct DeferredReadIntoRequest {
    pub deferred: Deferred<ReadResult<ByteView>>,
}

impl ReadIntoRequest for DeferredReadIntoRequest {
    fn chunk_steps(self: Box<Self>, chunk: ByteView) {
        self.deferred.resolve(ReadResult::chunk(chunk));
    }

    fn close_steps(self: Box<Self>, chunk: Option<ByteView>) {
        self.deferred.resolve(ReadResult {
            value: chunk,
            done: true,
        });
    }

    fn error_steps(self: Box<Self>, error: StreamError) {
        self.deferred.reject(error);
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use crate::{
        error::ErrorName,
        readable::{ReadableByteStreamController, ReadableStream, UnderlyingByteSource},
        AlgorithmFuture,
    };

    use super::*;

    fn ready() -> AlgorithmFuture {
        Box::pin(std::future::ready(Ok(())))
    }

    /// Responds to each pull through the BYOB request, then closes.
    struct Responder {
        payloads: RefCell<Vec<Vec<u8>>>,
        auto_allocate: Option<usize>,
    }

    impl Responder {
        fn new(payloads: Vec<Vec<u8>>) -> Self {
            Self {
                payloads: RefCell::new(payloads),
                auto_allocate: None,
            }
        }
    }

    impl UnderlyingByteSource for Responder {
        fn pull(&self, controller: ReadableByteStreamController) -> AlgorithmFuture {
            let mut payloads = self.payloads.borrow_mut();
            if payloads.is_empty() {
                controller.close().unwrap();
                if let Some(request) = controller.byob_request() {
                    request.respond(0).unwrap();
                }
            } else {
                let payload = payloads.remove(0);
                let request = controller
                    .byob_request()
                    .expect("a pending read supplies a BYOB request");
                request.respond_with(&payload).unwrap();
            }
            ready()
        }

        fn auto_allocate_chunk_size(&self) -> Option<usize> {
            self.auto_allocate
        }
    }

    #[tokio::test]
    async fn byob_read_fills_the_caller_view() {
        let stream = ReadableStream::byte_source(Responder::new(vec![vec![1, 2, 3, 4]])).unwrap();
        let reader = stream.get_byob_reader().unwrap();

        let result = reader.read_into(ByteView::uint8(vec![0; 4])).await.unwrap();
        assert!(!result.done);
        assert_eq!(result.value.unwrap().as_slice(), &[1, 2, 3, 4]);

        let result = reader.read_into(ByteView::uint8(vec![0; 4])).await.unwrap();
        assert!(result.done);
        reader.closed().await.unwrap();
    }

    #[tokio::test]
    async fn default_reads_use_the_auto_allocated_buffer() {
        let stream = ReadableStream::byte_source(Responder {
            payloads: RefCell::new(vec![vec![7, 7]]),
            auto_allocate: Some(16),
        })
        .unwrap();
        let reader = stream.get_reader().unwrap();

        let result = reader.read().await.unwrap();
        assert!(!result.done);
        assert_eq!(result.value.unwrap().as_slice(), &[7, 7]);
    }

    struct Enqueuer {
        chunks: RefCell<Vec<Vec<u8>>>,
    }

    impl UnderlyingByteSource for Enqueuer {
        fn pull(&self, controller: ReadableByteStreamController) -> AlgorithmFuture {
            let mut chunks = self.chunks.borrow_mut();
            if chunks.is_empty() {
                controller.close().unwrap();
            } else {
                controller.enqueue(ByteView::uint8(chunks.remove(0))).unwrap();
            }
            ready()
        }
    }

    #[tokio::test]
    async fn auto_allocating_source_fills_a_byob_view_to_capacity() {
        // The source produces two-byte payloads; a single minimum-fill read
        // with a four-byte view collects both into the caller's buffer.
        let stream = ReadableStream::byte_source(Responder {
            payloads: RefCell::new(vec![vec![0x01, 0x02], vec![0x03, 0x04]]),
            auto_allocate: Some(2),
        })
        .unwrap();
        let reader = stream.get_byob_reader().unwrap();

        let result = reader
            .read_into_with_min(ByteView::uint8(vec![0; 4]), 4)
            .await
            .unwrap();
        assert!(!result.done);
        let view = result.value.unwrap();
        assert_eq!(view.len(), 4);
        assert_eq!(view.as_slice(), &[0x01, 0x02, 0x03, 0x04]);

        let result = reader.read_into(ByteView::uint8(vec![0; 4])).await.unwrap();
        assert!(result.done);
    }

    #[tokio::test]
    async fn enqueued_bytes_satisfy_byob_reads_across_boundaries() {
        let stream = ReadableStream::byte_source(Enqueuer {
            chunks: RefCell::new(vec![vec![5, 6, 7]]),
        })
        .unwrap();
        let reader = stream.get_byob_reader().unwrap();

        let result = reader.read_into(ByteView::uint8(vec![0; 2])).await.unwrap();
        assert_eq!(result.value.unwrap().as_slice(), &[5, 6]);

        // The trailing byte is served from the queue without another pull.
        let result = reader.read_into(ByteView::uint8(vec![0; 2])).await.unwrap();
        assert_eq!(result.value.unwrap().as_slice(), &[7]);
    }

    #[tokio::test]
    async fn read_into_with_min_waits_for_the_minimum() {
        let stream = ReadableStream::byte_source(Enqueuer {
            chunks: RefCell::new(vec![vec![1], vec![2, 3]]),
        })
        .unwrap();
        let reader = stream.get_byob_reader().unwrap();

        let result = reader
            .read_into_with_min(ByteView::uint8(vec![0; 3]), 3)
            .await
            .unwrap();
        assert!(!result.done);
        assert_eq!(result.value.unwrap().as_slice(), &[1, 2, 3]);
    }

    #[tokio::test]
    async fn read_into_validates_its_arguments() {
        let stream = ReadableStream::byte_source(Enqueuer {
            chunks: RefCell::new(vec![vec![1]]),
        })
        .unwrap();
        let reader = stream.get_byob_reader().unwrap();

        let error = reader
            .read_into_with_min(ByteView::uint8(vec![0; 4]), 0)
            .await
            .unwrap_err();
        assert_eq!(error.name(), ErrorName::TypeError);

        let error = reader
            .read_into_with_min(ByteView::uint8(vec![0; 4]), 5)
            .await
            .unwrap_err();
        assert_eq!(error.name(), ErrorName::RangeError);

        let error = reader
            .read_into(ByteView::uint8(Vec::new()))
            .await
            .unwrap_err();
        assert_eq!(error.name(), ErrorName::TypeError);
    }
}
