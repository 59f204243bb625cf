use std::{
    cell::RefCell,
    future::Future,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, Waker},
};

use crate::error::StreamError;

/// A single-shot settleable future, the synchronization primitive between
/// internal state transitions and external observers (reader `closed`, writer
/// `ready`/`closed`, read/write request results, pending abort and cancel
/// results).
///
/// Settles exactly once; later resolve/reject calls are ignored. Consume it
/// either through [`Deferred::once`] (owned, takes the value) or through
/// [`Deferred::settled`] (multi-observer, clones the outcome).
pub(crate) struct Deferred<T> {
    inner: Rc<RefCell<DeferredInner<T>>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

enum State<T> {
    Pending,
    Resolved(T),
    Rejected(StreamError),
    /// A resolved value handed out by `once`.
    Taken,
}

struct DeferredInner<T> {
    state: State<T>,
    wakers: Vec<Waker>,
    handled: bool,
}

impl<T> Deferred<T> {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(DeferredInner {
                state: State::Pending,
                wakers: Vec::new(),
                handled: false,
            })),
        }
    }

    pub fn resolved(value: T) -> Self {
        let deferred = Self::new();
        deferred.resolve(value);
        deferred
    }

    pub fn rejected(error: StreamError) -> Self {
        let deferred = Self::new();
        deferred.reject(error);
        deferred
    }

    pub fn resolve(&self, value: T) {
        let mut inner = self.inner.borrow_mut();
        if let State::Pending = inner.state {
            inner.state = State::Resolved(value);
            for waker in inner.wakers.drain(..) {
                waker.wake();
            }
        }
    }

    pub fn reject(&self, error: StreamError) {
        let mut inner = self.inner.borrow_mut();
        if let State::Pending = inner.state {
            inner.state = State::Rejected(error);
            for waker in inner.wakers.drain(..) {
                waker.wake();
            }
        }
    }

    pub fn settle(&self, outcome: Result<T, StreamError>) {
        match outcome {
            Ok(value) => self.resolve(value),
            Err(error) => self.reject(error),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.inner.borrow().state, State::Pending)
    }

    /// Suppresses the unobserved-rejection diagnostic for this deferred; used
    /// everywhere the engine itself triggers the rejection path.
    pub fn mark_handled(&self) {
        self.inner.borrow_mut().handled = true;
    }

    /// Two handles for the same underlying deferred. Used to detect
    /// replacement, e.g. the pipe loop re-awaiting a new current write.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// The owned single-consumer future. Takes the resolved value; a rejected
    /// outcome is observed as handled.
    pub fn once(&self) -> DeferredOnce<T> {
        DeferredOnce {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: Clone> Deferred<T> {
    /// A settlement watch that leaves the value in place so any number of
    /// observers may await it.
    pub fn settled(&self) -> DeferredSettled<T> {
        DeferredSettled {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T> DeferredInner<T> {
    fn register(&mut self, cx: &Context<'_>) {
        if !self.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            self.wakers.push(cx.waker().clone());
        }
    }
}

impl<T> Drop for DeferredInner<T> {
    fn drop(&mut self) {
        if let State::Rejected(error) = &self.state {
            if !self.handled {
                tracing::debug!(error = %error, "deferred dropped with unobserved rejection");
            }
        }
    }
}

pub(crate) struct DeferredOnce<T> {
    inner: Rc<RefCell<DeferredInner<T>>>,
}

impl<T> Future for DeferredOnce<T> {
    type Output = Result<T, StreamError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.inner.borrow_mut();
        match &inner.state {
            State::Pending => {
                inner.register(cx);
                Poll::Pending
            }
            State::Resolved(_) => {
                let State::Resolved(value) = std::mem::replace(&mut inner.state, State::Taken)
                else {
                    unreachable!()
                };
                Poll::Ready(Ok(value))
            }
            State::Rejected(error) => {
                let error = error.clone();
                inner.handled = true;
                Poll::Ready(Err(error))
            }
            State::Taken => panic!("deferred result already consumed"),
        }
    }
}

pub(crate) struct DeferredSettled<T> {
    inner: Rc<RefCell<DeferredInner<T>>>,
}

impl<T: Clone> Future for DeferredSettled<T> {
    type Output = Result<T, StreamError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.inner.borrow_mut();
        match &inner.state {
            State::Pending => {
                inner.register(cx);
                Poll::Pending
            }
            State::Resolved(value) => Poll::Ready(Ok(value.clone())),
            State::Rejected(error) => {
                let error = error.clone();
                inner.handled = true;
                Poll::Ready(Err(error))
            }
            State::Taken => panic!("deferred result already consumed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn poll_now<F: Future + Unpin>(fut: &mut F) -> Poll<F::Output> {
        let waker = futures::task::noop_waker();
        let mut cx = Context::from_waker(&waker);
        Pin::new(fut).poll(&mut cx)
    }

    #[test]
    fn settles_exactly_once() {
        let deferred = Deferred::new();
        deferred.resolve(1);
        deferred.resolve(2);
        deferred.reject(StreamError::type_error("late"));
        let mut once = deferred.once();
        assert!(matches!(poll_now(&mut once), Poll::Ready(Ok(1))));
    }

    #[test]
    fn once_takes_the_value() {
        let deferred = Deferred::resolved("chunk");
        let mut first = deferred.once();
        assert!(matches!(poll_now(&mut first), Poll::Ready(Ok("chunk"))));
        assert!(!deferred.is_pending());
    }

    #[test]
    fn settled_is_observable_many_times() {
        let deferred = Deferred::resolved(7);
        for _ in 0..3 {
            let mut watch = deferred.settled();
            assert!(matches!(poll_now(&mut watch), Poll::Ready(Ok(7))));
        }
    }

    #[test]
    fn rejection_is_shared_and_marks_handled() {
        let deferred: Deferred<()> = Deferred::rejected(StreamError::type_error("broken"));
        let mut once = deferred.once();
        let Poll::Ready(Err(e)) = poll_now(&mut once) else {
            panic!("expected rejection");
        };
        assert_eq!(e, StreamError::type_error("broken"));
        let mut watch = deferred.settled();
        assert!(matches!(poll_now(&mut watch), Poll::Ready(Err(_))));
    }

    #[test]
    fn pending_then_woken() {
        let deferred = Deferred::new();
        let mut once = deferred.once();
        assert!(poll_now(&mut once).is_pending());
        deferred.resolve(5);
        assert!(matches!(poll_now(&mut once), Poll::Ready(Ok(5))));
    }
}
