use crate::{
    error::StreamError, transform::TransformStreamDefaultController, AlgorithmFuture,
};

fn resolved() -> AlgorithmFuture {
    Box::pin(std::future::ready(Ok(())))
}

/// User logic turning chunks of `I` into chunks of `O`.
///
/// `transform` is the only required callback; enqueue any number of output
/// chunks on the controller per input chunk. An error returned from any
/// callback errors both sides of the stream.
/// https://streams.spec.whatwg.org/#transformer-api
pub trait Transformer<I, O> {
    /// Called once at construction, before any transform.
    fn start(&self, controller: TransformStreamDefaultController<O>) -> AlgorithmFuture {
        let _ = controller;
        resolved()
    }

    fn transform(
        &self,
        chunk: I,
        controller: TransformStreamDefaultController<O>,
    ) -> AlgorithmFuture;

    /// Called once after the final chunk when the writable side closes;
    /// enqueue trailing output here.
    fn flush(&self, controller: TransformStreamDefaultController<O>) -> AlgorithmFuture {
        let _ = controller;
        resolved()
    }

    /// Called at most once when either side is cancelled or aborted; `flush`
    /// will not run.
    fn cancel(&self, reason: StreamError) -> AlgorithmFuture {
        let _ = reason;
        resolved()
    }
}
