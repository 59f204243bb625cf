use std::collections::VecDeque;

use crate::error::StreamError;

/// QueueWithSizes is present in readable and writable streams and abstracts
/// away certain queue operations
/// https://streams.spec.whatwg.org/#queue-with-sizes
pub(crate) struct QueueWithSizes<V> {
    queue: VecDeque<ValueWithSize<V>>,
    queue_total_size: f64,
}

impl<V> Default for QueueWithSizes<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> QueueWithSizes<V> {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            queue_total_size: 0.0,
        }
    }

    pub fn enqueue_value_with_size(&mut self, value: V, size: f64) -> Result<(), StreamError> {
        // If ! IsNonNegativeNumber(size) is false, throw a RangeError exception.
        // If size is +∞, throw a RangeError exception.
        if size.is_nan() || size < 0.0 || size.is_infinite() {
            return Err(StreamError::range_error(
                "Size must be a finite, non-NaN, non-negative number.",
            ));
        }

        // Append a new value-with-size with value value and size size to container.[[queue]].
        self.queue.push_back(ValueWithSize { value, size });

        // Set container.[[queueTotalSize]] to container.[[queueTotalSize]] + size.
        self.queue_total_size += size;

        Ok(())
    }

    pub fn dequeue_value(&mut self) -> V {
        // Let valueWithSize be container.[[queue]][0].
        // Remove valueWithSize from container.[[queue]].
        let value_with_size = self
            .queue
            .pop_front()
            .expect("DequeueValue called with empty queue");
        // Set container.[[queueTotalSize]] to container.[[queueTotalSize]] − valueWithSize’s size.
        self.queue_total_size -= value_with_size.size;
        // If container.[[queueTotalSize]] < 0, set container.[[queueTotalSize]] to 0. (This can occur due to rounding errors.)
        if self.queue_total_size < 0.0 {
            self.queue_total_size = 0.0
        }
        value_with_size.value
    }

    pub fn peek_value(&self) -> Option<&V> {
        self.queue.front().map(|entry| &entry.value)
    }

    pub fn peek_value_mut(&mut self) -> Option<&mut V> {
        self.queue.front_mut().map(|entry| &mut entry.value)
    }

    pub fn reset_queue(&mut self) {
        // Set container.[[queue]] to a new empty list.
        self.queue.clear();
        // Set container.[[queueTotalSize]] to 0.
        self.queue_total_size = 0.0;
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn total_size(&self) -> f64 {
        self.queue_total_size
    }
}

struct ValueWithSize<V> {
    value: V,
    size: f64,
}
