use std::{
    pin::Pin,
    task::{Context, Poll},
};

use futures::future::LocalBoxFuture;

use crate::{
    error::StreamError,
    readable::{ReadResult, ReadableStreamDefaultReader},
    StreamResult,
};

/// Adapter turning a [`ReadableStream`] into a [`futures::Stream`] of
/// chunks, the async-iteration protocol of this ecosystem.
///
/// Unless [`without_cancel_on_drop`] is used, dropping the adapter before
/// exhaustion cancels the stream; the source's cancel callback then runs the
/// next time the stream is driven by any of its remaining futures.
///
/// [`ReadableStream`]: crate::ReadableStream
/// [`without_cancel_on_drop`]: IntoStream::without_cancel_on_drop
/// https://streams.spec.whatwg.org/#rs-asynciterator
pub struct IntoStream<T: 'static> {
    reader: ReadableStreamDefaultReader<T>,
    pending: Option<LocalBoxFuture<'static, StreamResult<ReadResult<T>>>>,
    finished: bool,
    cancel_on_drop: bool,
}

impl<T: 'static> IntoStream<T> {
    pub(crate) fn new(reader: ReadableStreamDefaultReader<T>) -> Self {
        Self {
            reader,
            pending: None,
            finished: false,
            cancel_on_drop: true,
        }
    }

    /// Leaves the stream open (merely releasing the reader) when the adapter
    /// is dropped early.
    pub fn without_cancel_on_drop(mut self) -> Self {
        self.cancel_on_drop = false;
        self
    }
}

impl<T: 'static> futures::Stream for IntoStream<T> {
    type Item = StreamResult<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        let reader = &this.reader;
        let fut = this
            .pending
            .get_or_insert_with(|| Box::pin(reader.read()));
        match fut.as_mut().poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(outcome) => {
                this.pending = None;
                match outcome {
                    Ok(ReadResult {
                        value: Some(chunk), ..
                    }) => Poll::Ready(Some(Ok(chunk))),
                    Ok(_) => {
                        this.finished = true;
                        Poll::Ready(None)
                    }
                    Err(error) => {
                        this.finished = true;
                        Poll::Ready(Some(Err(error)))
                    }
                }
            }
        }
    }
}

impl<T: 'static> Drop for IntoStream<T> {
    fn drop(&mut self) {
        if !self.finished && self.cancel_on_drop {
            self.reader
                .cancel_in_background(StreamError::aborted("async iteration was abandoned"));
        }
    }
}
