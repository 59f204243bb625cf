use std::rc::Rc;

use crate::{
    error::StreamError,
    readable::{default_controller, ReadableStreamDefaultController},
};

/// Type-erased hooks back into the transform core, so the controller handle
/// only carries the output chunk type.
pub(crate) trait TransformCoreOps {
    fn backpressure(&self) -> bool;
    fn set_backpressure(&self, backpressure: bool);
    fn error_writable_and_unblock(&self, error: StreamError);
}

/// The handle given to transformer callbacks.
/// https://streams.spec.whatwg.org/#ts-default-controller-class
pub struct TransformStreamDefaultController<O: 'static> {
    pub(crate) readable_controller: ReadableStreamDefaultController<O>,
    pub(crate) ops: Rc<dyn TransformCoreOps>,
}

impl<O: 'static> Clone for TransformStreamDefaultController<O> {
    fn clone(&self) -> Self {
        Self {
            readable_controller: self.readable_controller.clone(),
            ops: Rc::clone(&self.ops),
        }
    }
}

impl<O: 'static> TransformStreamDefaultController<O> {
    /// Queues a chunk on the readable side, raising backpressure on the
    /// writable side if the readable queue is now full.
    /// https://streams.spec.whatwg.org/#ts-default-controller-enqueue
    pub fn enqueue(&self, chunk: O) -> Result<(), StreamError> {
        if !self.readable_controller.can_close_or_enqueue() {
            return Err(StreamError::type_error(
                "Readable side is not in a state that permits enqueue",
            ));
        }
        if let Err(error) = self.readable_controller.enqueue(chunk) {
            self.ops.error_writable_and_unblock(error.clone());
            return Err(self.readable_controller.stored_error().unwrap_or(error));
        }
        let backpressure = self.readable_controller.has_backpressure();
        if backpressure != self.ops.backpressure() {
            debug_assert!(backpressure);
            self.ops.set_backpressure(true);
        }
        Ok(())
    }

    /// Errors both sides.
    /// https://streams.spec.whatwg.org/#ts-default-controller-error
    pub fn error(&self, error: StreamError) {
        default_controller::error(&self.readable_controller.inner, error.clone());
        self.ops.error_writable_and_unblock(error);
    }

    /// Closes the readable side and errors the writable side; queued output
    /// is still delivered.
    /// https://streams.spec.whatwg.org/#ts-default-controller-terminate
    pub fn terminate(&self) {
        let _ = self.readable_controller.close();
        self.ops
            .error_writable_and_unblock(StreamError::type_error("TransformStream terminated"));
    }

    /// Desired size of the readable side's queue.
    /// https://streams.spec.whatwg.org/#ts-default-controller-desired-size
    pub fn desired_size(&self) -> Option<f64> {
        self.readable_controller.desired_size()
    }
}
