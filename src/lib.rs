//! Provides a safe, asynchronous (tokio based), keyed single-flight call
//! deduplicator.
//!
//! If several tasks ask for the same expensive thing at the same time, only
//! one of them should actually do the work. A [`Group`] guarantees that at
//! most one execution of the work function is in flight per key, and that
//! every concurrent requester for that key observes the same result, along
//! with a flag telling it whether the result was shared.
//!
//! There are three ways in:
//!
//! - [`Group::execute`] runs the work inside the first caller's own future
//!   and suspends everyone else until it settles.
//! - [`Group::dispatch`] never blocks: it hands back a one-shot channel and
//!   runs the work on a detached task.
//! - [`Group::dispatch_with_token`] adds reference-counted cancellation: the
//!   work gets its own [`CancellationToken`], which falls only when the last
//!   interested waiter has walked away.
//!
//! Results are *not* cached: as soon as a call settles, the next request for
//! the same key starts a brand-new execution. Layer a cache on top if you
//! want one.
//!
//! An example will probably make usage clear. Two concurrent requests, one
//! slow fetch:
//!
//! ```
//! use coalesce::Group;
//!
//! # tokio_test::block_on(async {
//! let group: Group<&'static str, String, String> = Group::new();
//!
//! let (first, second) = futures::join!(
//!     group.execute("greeting", || async {
//!         tokio::time::sleep(std::time::Duration::from_millis(50)).await;
//!         Ok("hello".to_string())
//!     }),
//!     group.execute("greeting", || async { Ok("unreached".to_string()) }),
//! );
//!
//! // Both callers observe the single execution's value.
//! assert_eq!(first.value.unwrap(), "hello");
//! assert_eq!(second.value.unwrap(), "hello");
//! assert!(first.shared && second.shared);
//! # });
//! ```
//!
//! A caller who may lose interest supplies its own token; the shared work is
//! only stopped once every such caller has given up:
//!
//! ```
//! use coalesce::CoalesceError;
//! use coalesce::Group;
//! use tokio_util::sync::CancellationToken;
//!
//! # tokio_test::block_on(async {
//! let group: Group<u32, String, String> = Group::new();
//! let caller = CancellationToken::new();
//!
//! let receiver = group.dispatch_with_token(caller.clone(), 7, |work_token| async move {
//!     tokio::select! {
//!         _ = work_token.cancelled() => Err("stopped".to_string()),
//!         _ = tokio::time::sleep(std::time::Duration::from_secs(30)) => {
//!             Ok("done".to_string())
//!         }
//!     }
//! });
//!
//! caller.cancel();
//! let result = receiver.await.expect("an abandoned wait still resolves");
//! assert!(matches!(result.value, Err(CoalesceError::Cancelled)));
//! # });
//! ```
//!
//! If the work function panics, sharing does not soften the blow: the panic
//! is re-raised to blocking callers (and, for subscribed channels, on a
//! dedicated task so the process panic hook sees it), never converted into
//! an ordinary error value. See [`CaughtPanic`].
//!
//! [`CancellationToken`]: tokio_util::sync::CancellationToken
mod fault;
mod group;

pub use crate::fault::CaughtPanic;
pub use crate::fault::CoalesceError;
pub use crate::group::CallResult;
pub use crate::group::Group;
