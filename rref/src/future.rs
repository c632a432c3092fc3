//! Single-assignment completion cell.
//!
//! An [RpcFuture] starts out pending and is completed exactly once, either
//! with a value or with an [RpcError].
//! It can be waited upon in three ways:
//!
//!   * by awaiting it from an asynchronous task,
//!   * by blocking the current thread using [RpcFuture::wait],
//!   * by attaching callbacks using [RpcFuture::add_callback].
//!
//! Callbacks run exactly once and in attachment order.
//! Callbacks attached before or while the future is being completed run on
//! the completing thread, which returns from completion only after all of
//! them have run.
//! A callback attached after that runs immediately on the attaching thread.
//!
//! Clones share the same cell.
//!
//! # Blocking
//!
//! [RpcFuture::wait] must not be called from a thread of a single-threaded
//! Tokio runtime that is also responsible for completing the future, since
//! this would deadlock. Await the future instead.

use std::{
    fmt,
    future::Future,
    mem,
    pin::Pin,
    sync::{Arc, Condvar, Mutex},
    task::{Context, Poll, Waker},
    time::{Duration, Instant},
};

use crate::RpcError;

type Callback<T> = Box<dyn FnOnce(&Result<T, RpcError>) + Send + 'static>;

enum State<T> {
    Pending { callbacks: Vec<Callback<T>>, wakers: Vec<Waker> },
    /// `queued` is present while the completing thread runs callbacks.
    Done { result: Result<T, RpcError>, queued: Option<Vec<Callback<T>>> },
}

struct Inner<T> {
    state: Mutex<State<T>>,
    done: Condvar,
}

/// Completion handle of an asynchronous operation.
///
/// See [module-level documentation](self) for details.
pub struct RpcFuture<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for RpcFuture<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> fmt::Debug for RpcFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = self.inner.state.lock().unwrap();
        match &*state {
            State::Pending { callbacks, .. } => {
                f.debug_struct("RpcFuture").field("state", &"pending").field("callbacks", &callbacks.len()).finish()
            }
            State::Done { result: Ok(_), .. } => f.debug_struct("RpcFuture").field("state", &"completed").finish(),
            State::Done { result: Err(err), .. } => {
                f.debug_struct("RpcFuture").field("state", &"failed").field("error", err).finish()
            }
        }
    }
}

impl<T> Default for RpcFuture<T>
where
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RpcFuture<T>
where
    T: Clone + Send + 'static,
{
    /// Creates a pending future.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Pending { callbacks: Vec::new(), wakers: Vec::new() }),
                done: Condvar::new(),
            }),
        }
    }

    /// Creates a future that is already completed with the specified result.
    pub fn ready(result: Result<T, RpcError>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Done { result, queued: None }),
                done: Condvar::new(),
            }),
        }
    }

    /// Creates a future that has already failed.
    pub fn failed(err: RpcError) -> Self {
        Self::ready(Err(err))
    }

    /// Completes the future with a value.
    ///
    /// Returns false if the future was already completed.
    pub fn complete(&self, value: T) -> bool {
        self.set(Ok(value))
    }

    /// Completes the future with an error.
    ///
    /// Returns false if the future was already completed.
    pub fn fail(&self, err: RpcError) -> bool {
        self.set(Err(err))
    }

    /// Completes the future with the specified result.
    ///
    /// Only the first call has an effect; it returns true.
    /// Subsequent calls leave the stored result untouched and return false.
    pub fn set(&self, result: Result<T, RpcError>) -> bool {
        let (mut callbacks, wakers) = {
            let mut state = self.inner.state.lock().unwrap();
            if let State::Done { .. } = &*state {
                return false;
            }
            let done = State::Done { result: result.clone(), queued: Some(Vec::new()) };
            match mem::replace(&mut *state, done) {
                State::Pending { callbacks, wakers } => (callbacks, wakers),
                State::Done { .. } => unreachable!("checked above"),
            }
        };

        self.inner.done.notify_all();
        for waker in wakers {
            waker.wake();
        }

        // Callbacks attached meanwhile are queued behind the running batch.
        loop {
            for callback in callbacks {
                callback(&result);
            }
            let mut state = self.inner.state.lock().unwrap();
            let State::Done { queued, .. } = &mut *state else { unreachable!("future was completed") };
            match queued.take() {
                Some(more) if !more.is_empty() => {
                    *queued = Some(Vec::new());
                    callbacks = more;
                }
                _ => break,
            }
        }
        true
    }

    /// Returns whether the future has completed.
    pub fn is_done(&self) -> bool {
        matches!(&*self.inner.state.lock().unwrap(), State::Done { .. })
    }

    /// Returns the result, if the future has completed.
    pub fn result(&self) -> Option<Result<T, RpcError>> {
        match &*self.inner.state.lock().unwrap() {
            State::Done { result, .. } => Some(result.clone()),
            State::Pending { .. } => None,
        }
    }

    /// Blocks the current thread until the future has completed and returns its result.
    ///
    /// Returns immediately if the future has already completed.
    pub fn wait(&self) -> Result<T, RpcError> {
        let mut state = self.inner.state.lock().unwrap();
        loop {
            if let State::Done { result, .. } = &*state {
                return result.clone();
            }
            state = self.inner.done.wait(state).unwrap();
        }
    }

    /// Blocks the current thread until the future has completed or the timeout has elapsed.
    ///
    /// Returns [None] on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T, RpcError>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock().unwrap();
        loop {
            if let State::Done { result, .. } = &*state {
                return Some(result.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = self.inner.done.wait_timeout(state, deadline - now).unwrap().0;
        }
    }

    /// Attaches a callback that is invoked with the result once the future completes.
    ///
    /// While the future is being completed, the callback is queued behind the
    /// callbacks attached earlier and run by the completing thread.
    /// If completion has finished, the callback is invoked immediately.
    pub fn add_callback<F>(&self, callback: F)
    where
        F: FnOnce(&Result<T, RpcError>) + Send + 'static,
    {
        let result = {
            let mut state = self.inner.state.lock().unwrap();
            match &mut *state {
                State::Pending { callbacks, .. } | State::Done { queued: Some(callbacks), .. } => {
                    callbacks.push(Box::new(callback));
                    return;
                }
                State::Done { result, queued: None } => result.clone(),
            }
        };
        callback(&result);
    }

    /// Returns a future that completes with the result of this future transformed by `f`.
    pub fn then<U, F>(&self, f: F) -> RpcFuture<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(Result<T, RpcError>) -> Result<U, RpcError> + Send + 'static,
    {
        let derived = RpcFuture::new();
        let target = derived.clone();
        self.add_callback(move |result| {
            target.set(f(result.clone()));
        });
        derived
    }
}

impl<T> Future for RpcFuture<T>
where
    T: Clone + Send + 'static,
{
    type Output = Result<T, RpcError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let mut state = self.inner.state.lock().unwrap();
        match &mut *state {
            State::Done { result, .. } => Poll::Ready(result.clone()),
            State::Pending { wakers, .. } => {
                if !wakers.iter().any(|waker| waker.will_wake(cx.waker())) {
                    wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}
