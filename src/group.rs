use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::panic;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::trace;

use crate::fault::CaughtPanic;
use crate::fault::CoalesceError;

/// What a deduplicated call delivered to one of its waiters.
#[derive(Clone, Debug)]
pub struct CallResult<V, E> {
    /// The shared work's value, or the fault that stands in for one.
    pub value: Result<V, CoalesceError<E>>,
    /// True when at least one other caller joined this call before it completed.
    pub shared: bool,
}

/// Classified termination of one call, published once to every waiter.
#[derive(Clone, Debug)]
enum CallOutcome<V, E> {
    Finished {
        value: Result<V, CoalesceError<E>>,
        shared: bool,
    },
    Panicked(CaughtPanic),
    Interrupted,
}

/// How the work future itself ended, before fan-out bookkeeping.
enum Termination<V, E> {
    Finished(Result<V, E>),
    Panicked(CaughtPanic),
    Interrupted,
}

/// What the executor hands back to the task that drove it.
enum Settled<V, E> {
    Delivered(CallResult<V, E>),
    Panicked { caught: CaughtPanic, reported: bool },
}

/// Joiner bookkeeping for one call: how many callers joined after the first,
/// and the subscriber channels to notify on completion. Plain data; the
/// registry lock is its only guard.
struct FanoutState<V, E> {
    dups: usize,
    chans: Vec<oneshot::Sender<CallResult<V, E>>>,
}

/// One in-flight execution. Referenced from the registry and from every task
/// that still cares about its outcome; never duplicated per key.
struct Call<V, E> {
    outcome: broadcast::Sender<CallOutcome<V, E>>,
    cancel: Option<CancellationToken>,
    token_waiters: AtomicUsize,
}

impl<V, E> Call<V, E>
where
    V: Clone,
    E: Clone,
{
    fn new(cancel: Option<CancellationToken>, token_waiters: usize) -> Self {
        let (outcome, _) = broadcast::channel(1);
        Self {
            outcome,
            cancel,
            token_waiters: AtomicUsize::new(token_waiters),
        }
    }
}

/// A call paired with its joiner bookkeeping, as the registry tracks it.
struct Flight<V, E> {
    call: Arc<Call<V, E>>,
    fanout: FanoutState<V, E>,
}

/// All mutable group state, behind the one registry lock.
///
/// `calls` maps each key to its in-flight call. `orphans` holds calls that
/// were forgotten while still executing: their fan-out state stays here so
/// the executor can still deliver to the subscribers attached before the
/// forget.
struct Registry<K, V, E> {
    calls: HashMap<K, Flight<V, E>>,
    orphans: Vec<Flight<V, E>>,
}

impl<K, V, E> Registry<K, V, E>
where
    K: Eq + Hash,
{
    /// Detach the fan-out state belonging to `call`, wherever it lives:
    /// under its key when still registered, or among the orphans when a
    /// forget() moved it aside. A key pointing at some other call is left
    /// alone.
    fn reclaim(&mut self, key: &K, call: &Arc<Call<V, E>>) -> FanoutState<V, E> {
        if self
            .calls
            .get(key)
            .is_some_and(|flight| Arc::ptr_eq(&flight.call, call))
        {
            if let Some(flight) = self.calls.remove(key) {
                return flight.fanout;
            }
        }
        if let Some(at) = self
            .orphans
            .iter()
            .position(|flight| Arc::ptr_eq(&flight.call, call))
        {
            return self.orphans.swap_remove(at).fanout;
        }
        FanoutState {
            dups: 0,
            chans: Vec::new(),
        }
    }
}

enum Entry<V, E> {
    Waiter(broadcast::Receiver<CallOutcome<V, E>>),
    Leader(Arc<Call<V, E>>),
}

struct GroupInner<K, V, E> {
    registry: Mutex<Registry<K, V, E>>,
    request_total: AtomicU64,
    request_deduplicated: AtomicU64,
}

impl<K, V, E> GroupInner<K, V, E>
where
    K: Eq + Hash,
    V: Clone,
    E: Clone,
{
    /// Settle a call: unregister it, publish its outcome and fan it out.
    ///
    /// Runs exactly once per call, from the task that executed the work or,
    /// for an interrupted call, from the executor's drop guard.
    fn complete(
        &self,
        key: &K,
        call: &Arc<Call<V, E>>,
        termination: Termination<V, E>,
    ) -> Settled<V, E> {
        let mut share_panic = None;
        let settled = {
            let mut registry = self.registry.lock();
            let FanoutState { dups, chans } = registry.reclaim(key, call);
            let shared = dups > 0;
            // Waiters subscribe to the outcome channel before this lock was
            // taken, so nobody can miss the single message sent below.
            match termination {
                Termination::Finished(done) => {
                    let value = done.map_err(CoalesceError::Work);
                    let _ = call.outcome.send(CallOutcome::Finished {
                        value: value.clone(),
                        shared,
                    });
                    for chan in chans {
                        let _ = chan.send(CallResult {
                            value: value.clone(),
                            shared,
                        });
                    }
                    Settled::Delivered(CallResult { value, shared })
                }
                Termination::Panicked(caught) => {
                    let _ = call.outcome.send(CallOutcome::Panicked(caught.clone()));
                    // Subscriber channels stay silent: dropping the senders
                    // closes them without a value.
                    let reported = !chans.is_empty();
                    if reported {
                        share_panic = Some(caught.clone());
                    }
                    Settled::Panicked { caught, reported }
                }
                Termination::Interrupted => {
                    debug!("call ended without an outcome");
                    let _ = call.outcome.send(CallOutcome::Interrupted);
                    Settled::Delivered(CallResult {
                        value: Err(CoalesceError::Interrupted),
                        shared,
                    })
                }
            }
        };
        if let Some(caught) = share_panic {
            error!("shared work panicked, re-raising for the process hook");
            // A shared panic must stay a panic. This task exists only to carry
            // it to the process's panic hook, and never resumes.
            tokio::spawn(async move { panic::panic_any(caught) });
        }
        settled
    }
}

/// Flags an abrupt exit when the executor's future is dropped mid-flight.
struct CallGuard<K, V, E>
where
    K: Eq + Hash,
    V: Clone,
    E: Clone,
{
    inner: Arc<GroupInner<K, V, E>>,
    key: K,
    call: Arc<Call<V, E>>,
    armed: bool,
}

impl<K, V, E> Drop for CallGuard<K, V, E>
where
    K: Eq + Hash,
    V: Clone,
    E: Clone,
{
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // The work future was dropped before it resolved: neither a value nor
        // a panic will ever arrive. Record the abrupt exit so blocking
        // joiners are released instead of waiting on a call that no longer
        // exists.
        self.inner
            .complete(&self.key, &self.call, Termination::Interrupted);
    }
}

/// Run the work bound to a call exactly once and settle the call, whatever
/// the work does: resolve, panic, or disappear mid-poll.
async fn run_call<K, V, E, F, Fut>(
    inner: &Arc<GroupInner<K, V, E>>,
    key: K,
    call: Arc<Call<V, E>>,
    work: F,
) -> CallResult<V, E>
where
    K: Eq + Hash,
    V: Clone,
    E: Clone,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<V, E>>,
{
    let mut guard = CallGuard {
        inner: Arc::clone(inner),
        key,
        call,
        armed: true,
    };
    let polled = AssertUnwindSafe(async move { work().await }).catch_unwind().await;
    guard.armed = false;

    let termination = match polled {
        Ok(done) => Termination::Finished(done),
        Err(payload) => Termination::Panicked(CaughtPanic::intercept(payload)),
    };
    match guard.inner.complete(&guard.key, &guard.call, termination) {
        Settled::Delivered(result) => result,
        Settled::Panicked { caught, reported } => {
            if reported {
                // The dedicated task already carried this panic to the hook;
                // keep unwinding here without firing it a second time.
                panic::resume_unwind(Box::new(caught))
            } else {
                panic::panic_any(caught)
            }
        }
    }
}

/// Race a caller's own cancellation token against the call it joined.
///
/// Every cancellable waiter gets one of these. The last waiter to abandon the
/// call is the one that cancels the shared work's token, and it waits for the
/// executor to actually finish before reporting its own cancellation.
async fn race_caller_token<V, E>(
    token: CancellationToken,
    call: Arc<Call<V, E>>,
    mut result: oneshot::Receiver<CallResult<V, E>>,
    output: oneshot::Sender<CallResult<V, E>>,
    mut done: broadcast::Receiver<CallOutcome<V, E>>,
) where
    V: Clone,
    E: Clone,
{
    let mut delivered = tokio::select! {
        outcome = &mut result => match outcome {
            Ok(delivered) => Some(delivered),
            // The executor went away without fanning out. Only the caller's
            // own token can end the wait now.
            Err(_) => {
                token.cancelled().await;
                None
            }
        },
        _ = token.cancelled() => None,
    };

    if call.token_waiters.fetch_sub(1, Ordering::SeqCst) == 1 {
        if let Some(cancel) = &call.cancel {
            trace!("last waiter gone, cancelling the shared work");
            cancel.cancel();
        }
        // Wait for the work to actually stop before reporting our own
        // cancellation, so no task outlives interest in its result.
        let _ = done.recv().await;
    }

    if token.is_cancelled() {
        delivered = Some(CallResult {
            value: Err(CoalesceError::Cancelled),
            shared: false,
        });
    }
    let settled = delivered.unwrap_or(CallResult {
        value: Err(CoalesceError::Interrupted),
        shared: false,
    });
    let _ = output.send(settled);
}

/// Keyed single-flight call deduplication.
///
/// A `Group` guarantees that at most one execution of the work function is in
/// flight per key at any time, and that every concurrent requester for that
/// key observes the same result. Cloning a `Group` produces another handle to
/// the same registry; independent groups deduplicate independently.
#[derive(Clone)]
pub struct Group<K, V, E>
where
    K: Clone + Send + Eq + Hash,
    V: Clone + Send,
    E: Clone + Send,
{
    inner: Arc<GroupInner<K, V, E>>,
}

impl<K, V, E> Group<K, V, E>
where
    K: Clone + Send + Eq + Hash + 'static,
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Create an empty group.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(GroupInner {
                registry: Mutex::new(Registry {
                    calls: HashMap::new(),
                    orphans: Vec::new(),
                }),
                request_total: AtomicU64::new(0),
                request_deduplicated: AtomicU64::new(0),
            }),
        }
    }

    /// Run `work` for `key`, deduplicating against concurrent callers.
    ///
    /// The first arrival for a key executes `work` inside its own future;
    /// everyone else suspends until that execution settles and then shares
    /// its result. `shared` is true whenever more than one caller was
    /// attached to the execution.
    ///
    /// # Panics
    ///
    /// If the shared work panics, the panic is re-raised in every blocking
    /// caller with a [`CaughtPanic`] payload rather than surfaced as an
    /// error value.
    pub async fn execute<F, Fut>(&self, key: K, work: F) -> CallResult<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        self.inner.request_total.fetch_add(1, Ordering::SeqCst);
        let entry = {
            let mut registry = self.inner.registry.lock();
            match registry.calls.get_mut(&key) {
                Some(flight) => {
                    self.inner.request_deduplicated.fetch_add(1, Ordering::SeqCst);
                    flight.fanout.dups += 1;
                    trace!("joining call in flight");
                    Entry::Waiter(flight.call.outcome.subscribe())
                }
                None => {
                    let call = Arc::new(Call::new(None, 0));
                    registry.calls.insert(
                        key.clone(),
                        Flight {
                            call: Arc::clone(&call),
                            fanout: FanoutState {
                                dups: 0,
                                chans: Vec::new(),
                            },
                        },
                    );
                    trace!("starting new call");
                    Entry::Leader(call)
                }
            }
        };
        match entry {
            Entry::Waiter(mut outcome) => {
                let outcome = match outcome.recv().await {
                    Ok(outcome) => outcome,
                    // The sender lives inside the call we subscribed to, so
                    // in the normal run of things we won't reach this code.
                    // Losing it means the executor vanished wholesale; treat
                    // that like an interrupted call.
                    Err(_) => CallOutcome::Interrupted,
                };
                match outcome {
                    // Having joined implies the call had company, so the
                    // published shared flag is necessarily true here.
                    CallOutcome::Finished { value, shared } => CallResult { value, shared },
                    CallOutcome::Panicked(caught) => panic::resume_unwind(Box::new(caught)),
                    CallOutcome::Interrupted => CallResult {
                        value: Err(CoalesceError::Interrupted),
                        shared: true,
                    },
                }
            }
            Entry::Leader(call) => run_call(&self.inner, key, call, work).await,
        }
    }

    /// Like [`execute`](Self::execute), but never blocks the caller: the work
    /// runs on a detached task and the result arrives on the returned
    /// channel.
    ///
    /// Exactly one [`CallResult`] is sent, exactly once. The exception is a
    /// work function that panics or is interrupted: nothing is ever sent and
    /// the channel closes empty. Callers that cannot tolerate an unresolved
    /// channel should combine the receiver with their own timeout, or use
    /// [`dispatch_with_token`](Self::dispatch_with_token).
    ///
    /// Must be called from within a tokio runtime.
    pub fn dispatch<F, Fut>(&self, key: K, work: F) -> oneshot::Receiver<CallResult<V, E>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send,
    {
        self.inner.request_total.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        let call = {
            let mut registry = self.inner.registry.lock();
            match registry.calls.get_mut(&key) {
                Some(flight) => {
                    self.inner.request_deduplicated.fetch_add(1, Ordering::SeqCst);
                    flight.fanout.dups += 1;
                    flight.fanout.chans.push(tx);
                    trace!("subscribed to call in flight");
                    return rx;
                }
                None => {
                    let call = Arc::new(Call::new(None, 0));
                    registry.calls.insert(
                        key.clone(),
                        Flight {
                            call: Arc::clone(&call),
                            fanout: FanoutState {
                                dups: 0,
                                chans: vec![tx],
                            },
                        },
                    );
                    trace!("starting detached call");
                    call
                }
            }
        };
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            run_call(&inner, key, call, work).await;
        });
        rx
    }

    /// Cancellation-aware [`dispatch`](Self::dispatch).
    ///
    /// `work` receives a cancellation token of its own, distinct from
    /// `token` and shared by every joiner of the same call. The work's token
    /// is cancelled only when the last interested waiter has abandoned the
    /// call, so one impatient caller never stops work others still need.
    ///
    /// The returned channel always resolves with exactly one [`CallResult`],
    /// even when this caller gives up: an abandoned wait yields
    /// [`CoalesceError::Cancelled`].
    ///
    /// Must be called from within a tokio runtime.
    pub fn dispatch_with_token<F, Fut>(
        &self,
        token: CancellationToken,
        key: K,
        work: F,
    ) -> oneshot::Receiver<CallResult<V, E>>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send,
    {
        self.inner.request_total.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        let (final_tx, final_rx) = oneshot::channel();

        let mut launch = None;
        let (call, done) = {
            let mut registry = self.inner.registry.lock();
            match registry.calls.get_mut(&key) {
                Some(flight) => {
                    self.inner.request_deduplicated.fetch_add(1, Ordering::SeqCst);
                    flight.fanout.dups += 1;
                    flight.fanout.chans.push(tx);
                    flight.call.token_waiters.fetch_add(1, Ordering::SeqCst);
                    trace!("joining cancellable call in flight");
                    (Arc::clone(&flight.call), flight.call.outcome.subscribe())
                }
                None => {
                    let work_token = CancellationToken::new();
                    let call = Arc::new(Call::new(Some(work_token.clone()), 1));
                    registry.calls.insert(
                        key.clone(),
                        Flight {
                            call: Arc::clone(&call),
                            fanout: FanoutState {
                                dups: 0,
                                chans: vec![tx],
                            },
                        },
                    );
                    trace!("starting cancellable call");
                    let done = call.outcome.subscribe();
                    launch = Some((key, Arc::clone(&call), work_token));
                    (call, done)
                }
            }
        };

        if let Some((key, call, work_token)) = launch {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                run_call(&inner, key, call, move || work(work_token)).await;
            });
        }
        tokio::spawn(race_caller_token(token, call, rx, final_tx, done));

        final_rx
    }

    /// Drop the in-flight call registered for `key`, if any.
    ///
    /// Work already executing continues and still delivers to everyone
    /// attached to it; the next call for `key` starts fresh and does not
    /// merge with the forgotten one.
    pub fn forget(&self, key: &K) {
        let mut registry = self.inner.registry.lock();
        if let Some(flight) = registry.calls.remove(key) {
            debug!("forgot call in flight");
            // The executor still owns this call and comes back for the
            // subscribers attached before the forget; keep them until then.
            registry.orphans.push(flight);
        }
    }

    /// Number of calls currently registered as in flight.
    pub fn in_flight_count(&self) -> usize {
        self.inner.registry.lock().calls.len()
    }

    /// Total requests seen across all entry points.
    pub fn request_count(&self) -> u64 {
        self.inner.request_total.load(Ordering::SeqCst)
    }

    /// Requests that joined an execution already in flight.
    pub fn request_deduplicated_count(&self) -> u64 {
        self.inner.request_deduplicated.load(Ordering::SeqCst)
    }
}

impl<K, V, E> Default for Group<K, V, E>
where
    K: Clone + Send + Eq + Hash + 'static,
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
