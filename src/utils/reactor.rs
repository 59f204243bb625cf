use std::{
    cell::{Cell, RefCell},
    future::Future,
    rc::Rc,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::Context,
};

use futures::{
    future::LocalBoxFuture,
    task::{waker, ArcWake, AtomicWaker},
};

use crate::{error::StreamError, utils::deferred::Deferred};

/// A per-stream local task set.
///
/// Continuation logic (reactions to settled deferreds, user algorithm
/// completions) is parked here instead of running inline, so it never executes
/// inside a `RefCell` borrow of stream state. Every public engine future
/// drives the owning reactor when polled; entangled streams (tee branches, the
/// two sides of a transform) share one reactor so progress on either side
/// drives both.
pub(crate) struct Reactor {
    inner: Rc<ReactorInner>,
}

impl Clone for Reactor {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

struct ReactorInner {
    tasks: RefCell<Vec<LocalBoxFuture<'static, ()>>>,
    incoming: RefCell<Vec<LocalBoxFuture<'static, ()>>>,
    driving: Cell<bool>,
    wakeup: Arc<Wakeup>,
}

/// Wake state shared with task wakers. The flag requests another drive pass;
/// the parent waker propagates wakeups from inside user callbacks (timers and
/// the like) out to whichever host task is currently driving.
struct Wakeup {
    woken: AtomicBool,
    parent: AtomicWaker,
}

impl ArcWake for Wakeup {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.woken.store(true, Ordering::SeqCst);
        arc_self.parent.wake();
    }
}

impl Reactor {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(ReactorInner {
                tasks: RefCell::new(Vec::new()),
                incoming: RefCell::new(Vec::new()),
                driving: Cell::new(false),
                wakeup: Arc::new(Wakeup {
                    woken: AtomicBool::new(false),
                    parent: AtomicWaker::new(),
                }),
            }),
        }
    }

    pub fn spawn(&self, task: impl Future<Output = ()> + 'static) {
        self.inner.incoming.borrow_mut().push(Box::pin(task));
        self.inner.wakeup.woken.store(true, Ordering::SeqCst);
        self.inner.wakeup.parent.wake();
    }

    /// Runs spawned tasks until none can make further progress. Reentrant
    /// calls (a task awaiting an engine future of its own reactor) return
    /// immediately; the outer drive loop is already running them.
    pub fn drive(&self, cx: &mut Context<'_>) {
        if self.inner.driving.get() {
            return;
        }
        self.inner.wakeup.parent.register(cx.waker());
        self.inner.driving.set(true);

        let task_waker = waker(Arc::clone(&self.inner.wakeup));
        let mut task_cx = Context::from_waker(&task_waker);

        loop {
            let mut new_tasks = std::mem::take(&mut *self.inner.incoming.borrow_mut());
            let woken = self.inner.wakeup.woken.swap(false, Ordering::SeqCst);
            if new_tasks.is_empty() && !woken {
                break;
            }

            // Take the task list out so polled tasks can spawn without
            // overlapping borrows; spawns land in `incoming`.
            let mut tasks = std::mem::take(&mut *self.inner.tasks.borrow_mut());
            tasks.append(&mut new_tasks);
            tasks.retain_mut(|task| task.as_mut().poll(&mut task_cx).is_pending());
            *self.inner.tasks.borrow_mut() = tasks;
        }

        self.inner.driving.set(false);
    }
}

/// Wraps a future so that polling it drives `reactor` first. All public
/// engine futures are built this way.
pub(crate) fn drive_with<F>(reactor: Reactor, fut: F) -> impl Future<Output = F::Output>
where
    F: Future + 'static,
{
    let mut fut = Box::pin(fut);
    futures::future::poll_fn(move |cx| {
        reactor.drive(cx);
        fut.as_mut().poll(cx)
    })
}

/// As [`drive_with`], for futures spanning two streams (pipes).
pub(crate) fn drive_with_pair<F>(
    first: Reactor,
    second: Reactor,
    fut: F,
) -> impl Future<Output = F::Output>
where
    F: Future + 'static,
{
    let mut fut = Box::pin(fut);
    futures::future::poll_fn(move |cx| {
        first.drive(cx);
        second.drive(cx);
        fut.as_mut().poll(cx)
    })
}

/// https://webidl.spec.whatwg.org/#dfn-perform-steps-once-promise-is-settled
///
/// Parks `then` on the reactor to run once `deferred` settles.
pub(crate) fn upon_settled<T: Clone + 'static>(
    reactor: &Reactor,
    deferred: &Deferred<T>,
    then: impl FnOnce(Result<T, StreamError>) + 'static,
) {
    let settled = deferred.settled();
    reactor.spawn(async move {
        let outcome = settled.await;
        then(outcome);
    });
}

/// Parks `then` on the reactor to run once `fut` completes. Used to observe
/// user algorithm futures (start/pull/write/close/flush and friends).
pub(crate) fn upon_future<T: 'static>(
    reactor: &Reactor,
    fut: LocalBoxFuture<'static, Result<T, StreamError>>,
    then: impl FnOnce(Result<T, StreamError>) + 'static,
) {
    reactor.spawn(async move {
        let outcome = fut.await;
        then(outcome);
    });
}
