use std::{
    cell::RefCell,
    future::Future,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, Waker},
};

use crate::error::StreamError;

/// AbortController hands out a single [`AbortSignal`] and is the only way to
/// abort it.
///
/// The writable controller owns one per stream, exposed through
/// `WritableStreamDefaultController::signal()` so sinks can observe aborts;
/// hosts pass their own through `PipeOptions::signal` to cancel a pipe.
pub struct AbortController {
    signal: AbortSignal,
}

impl Default for AbortController {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortController {
    pub fn new() -> Self {
        Self {
            signal: AbortSignal::new(),
        }
    }

    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    /// Signals abort. A missing reason is replaced with the default
    /// AbortError. Signalling twice is a no-op.
    pub fn abort(&self, reason: Option<StreamError>) {
        self.signal
            .abort_with(reason.unwrap_or_else(StreamError::aborted_default));
    }
}

/// The observable half of the pair. Cloning yields another handle onto the
/// same signal.
#[derive(Clone)]
pub struct AbortSignal {
    inner: Rc<RefCell<SignalInner>>,
}

struct SignalInner {
    reason: Option<StreamError>,
    callbacks: Vec<(u64, Box<dyn FnOnce(StreamError)>)>,
    next_token: u64,
    wakers: Vec<Waker>,
}

/// Token returned by [`AbortSignal::on_abort`]; pass it back to
/// [`AbortSignal::unsubscribe`] to detach the callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbortSubscription(u64);

impl AbortSignal {
    pub(crate) fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(SignalInner {
                reason: None,
                callbacks: Vec::new(),
                next_token: 0,
                wakers: Vec::new(),
            })),
        }
    }

    pub fn aborted(&self) -> bool {
        self.inner.borrow().reason.is_some()
    }

    pub fn reason(&self) -> Option<StreamError> {
        self.inner.borrow().reason.clone()
    }

    /// Registers `callback` to run when the signal aborts; runs it
    /// immediately if the signal already has.
    pub fn on_abort(&self, callback: impl FnOnce(StreamError) + 'static) -> AbortSubscription {
        let mut inner = self.inner.borrow_mut();
        if let Some(reason) = inner.reason.clone() {
            drop(inner);
            callback(reason);
            return AbortSubscription(u64::MAX);
        }
        let token = inner.next_token;
        inner.next_token += 1;
        inner.callbacks.push((token, Box::new(callback)));
        AbortSubscription(token)
    }

    pub fn unsubscribe(&self, subscription: AbortSubscription) {
        self.inner
            .borrow_mut()
            .callbacks
            .retain(|(token, _)| *token != subscription.0);
    }

    /// A future resolving with the abort reason once the signal aborts.
    pub fn signaled(&self) -> Signaled {
        Signaled {
            inner: Rc::clone(&self.inner),
        }
    }

    pub(crate) fn abort_with(&self, reason: StreamError) {
        let callbacks = {
            let mut inner = self.inner.borrow_mut();
            if inner.reason.is_some() {
                return;
            }
            inner.reason = Some(reason.clone());
            for waker in inner.wakers.drain(..) {
                waker.wake();
            }
            std::mem::take(&mut inner.callbacks)
        };
        for (_, callback) in callbacks {
            callback(reason.clone());
        }
    }
}

pub struct Signaled {
    inner: Rc<RefCell<SignalInner>>,
}

impl Future for Signaled {
    type Output = StreamError;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.inner.borrow_mut();
        match &inner.reason {
            Some(reason) => Poll::Ready(reason.clone()),
            None => {
                if !inner.wakers.iter().any(|w| w.will_wake(cx.waker())) {
                    inner.wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::error::ErrorName;

    #[test]
    fn abort_without_reason_uses_the_default() {
        let controller = AbortController::new();
        let signal = controller.signal();
        assert!(!signal.aborted());
        controller.abort(None);
        assert!(signal.aborted());
        let reason = signal.reason().unwrap();
        assert_eq!(reason.name(), ErrorName::AbortError);
    }

    #[test]
    fn callbacks_fire_once_and_unsubscribe_detaches() {
        let controller = AbortController::new();
        let signal = controller.signal();

        let fired = Rc::new(Cell::new(0));
        let fired_cb = Rc::clone(&fired);
        let _keep = signal.on_abort(move |_| fired_cb.set(fired_cb.get() + 1));

        let detached = Rc::new(Cell::new(false));
        let detached_cb = Rc::clone(&detached);
        let subscription = signal.on_abort(move |_| detached_cb.set(true));
        signal.unsubscribe(subscription);

        controller.abort(Some(StreamError::aborted("halt")));
        controller.abort(Some(StreamError::aborted("again")));

        assert_eq!(fired.get(), 1);
        assert!(!detached.get());
        assert_eq!(signal.reason().unwrap(), StreamError::aborted("halt"));
    }

    #[test]
    fn late_registration_fires_immediately() {
        let controller = AbortController::new();
        controller.abort(None);
        let fired = Rc::new(Cell::new(false));
        let fired_cb = Rc::clone(&fired);
        controller.signal().on_abort(move |_| fired_cb.set(true));
        assert!(fired.get());
    }
}
