//! Interrupt propagation: a signal that can be raised once from any thread and observed,
//! exactly once, by whichever concurrent reader gets there first.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

use crate::error::Error;
use crate::token::Token;

/// Parameters threaded through a compiled run, analogous to the `CompileScope`'s `interruptible`
/// flag plus the interpreter's interrupt-unwind bookkeeping.
#[derive(Clone, Debug)]
pub struct ExecArgs {
    /// Caps how many times the same interrupt is allowed to re-enter a stream's own error
    /// handler before the interpreter gives up and propagates it outward unconditionally.
    pub max_interrupt_depth: u32,
}

impl Default for ExecArgs {
    fn default() -> Self {
        ExecArgs {
            max_interrupt_depth: 256,
        }
    }
}

/// The signalling half of an interruptible scope subtree.
///
/// Cloning an `InterruptContext` shares the same underlying signal: every clone observes the same
/// `interrupt()` call. Held by a [`crate::scope::CompileScope`] and any of its interruptible
/// descendants that did not open their own.
#[derive(Clone)]
pub struct InterruptContext {
    scope: Token,
    tx: Arc<watch::Sender<Option<Cause>>>,
    rx: watch::Receiver<Option<Cause>>,
    consumed: Arc<AtomicBool>,
}

#[derive(Clone)]
struct Cause {
    error: Option<Arc<Error>>,
}

impl InterruptContext {
    /// Creates a fresh, unsignalled context rooted at `scope`.
    pub fn new(scope: Token) -> Self {
        let (tx, rx) = watch::channel(None);
        InterruptContext {
            scope,
            tx: Arc::new(tx),
            rx,
            consumed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The scope this context was opened at. Used to stamp `Error::Interrupted { scope, .. }`.
    pub fn scope(&self) -> Token {
        self.scope
    }

    /// Raises the interrupt with an optional cause. Idempotent: only the first call's cause is
    /// recorded, later calls are no-ops. Every clone of this context, and every receiver racing
    /// it in [`InterruptContext::race`], observes the change.
    pub fn interrupt(&self, cause: Option<Error>) {
        let signalled = self.tx.send_if_modified(|current| {
            if current.is_some() {
                false
            } else {
                *current = Some(Cause {
                    error: cause.map(Arc::new),
                });
                true
            }
        });
        #[cfg(feature = "trace")]
        if signalled {
            tracing::trace!(scope = ?self.scope, "interrupt signalled");
        }
        #[cfg(not(feature = "trace"))]
        let _ = signalled;
    }

    /// Whether a cause has been set, regardless of whether it has been consumed yet.
    pub fn cause_is_set(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Equivalent to `cause_is_set`, named to match the "is this scope currently interrupted"
    /// query used by `CompileScope::is_interrupted`.
    pub fn is_interrupted(&self) -> bool {
        self.cause_is_set()
    }

    /// Atomically claims the interrupt for this caller. Returns `Some(cause)` exactly once across
    /// every clone of this context; all other callers (concurrent or subsequent) get `None`, even
    /// though `cause_is_set` keeps reporting `true` for them.
    pub fn try_claim(&self) -> Option<Option<Error>> {
        if !self.cause_is_set() {
            return None;
        }
        if self.consumed.swap(true, Ordering::AcqRel) {
            None
        } else {
            Some(self.rx.borrow().as_ref().and_then(|c| {
                c.error.as_ref().map(|e| (**e).clone())
            }))
        }
    }

    /// Races `fut` against this context's interrupt signal. If the interrupt fires first, `fut`
    /// is dropped (cancelling whatever task it represents) and `Err` is returned with an
    /// `Error::Interrupted` built from the claimed cause; `loop_count` starts at 0 and is bumped
    /// by the caller on each re-delivery through a stream's own handler.
    ///
    /// Once the interrupt has already been claimed by someone else (e.g. a `shall_interrupt`
    /// probe between algebra steps), this simply awaits `fut` uninterrupted: the cause is only
    /// ever delivered to a single observer.
    pub async fn race<F, T>(&self, fut: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, Error>>,
    {
        if self.consumed.load(Ordering::Acquire) {
            return fut.await;
        }
        let mut rx = self.rx.clone();
        tokio::select! {
            biased;
            res = fut => res,
            _ = rx.changed() => {
                let cause = self.try_claim().unwrap_or(None);
                Err(Error::Interrupted {
                    scope: self.scope,
                    cause: cause.map(Arc::new),
                    loop_count: 0,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupt_is_idempotent_on_cause() {
        let ctx = InterruptContext::new(Token::new());
        ctx.interrupt(Some(Error::IllegalState("first")));
        ctx.interrupt(Some(Error::IllegalState("second")));
        let claimed = ctx.try_claim().unwrap();
        match claimed {
            Some(Error::IllegalState(msg)) => assert_eq!(msg, "first"),
            other => panic!("unexpected cause: {other:?}"),
        }
    }

    #[test]
    fn try_claim_succeeds_exactly_once() {
        let ctx = InterruptContext::new(Token::new());
        ctx.interrupt(None);
        assert!(ctx.try_claim().is_some());
        assert!(ctx.try_claim().is_none());
        // cause_is_set keeps reporting true for everyone else.
        assert!(ctx.cause_is_set());
    }

    #[tokio::test]
    async fn race_prefers_interrupt_once_signalled() {
        let ctx = InterruptContext::new(Token::new());
        ctx.interrupt(Some(Error::IllegalState("cut")));
        let never = std::future::pending::<Result<(), Error>>();
        let res = ctx.race(never).await;
        assert!(matches!(res, Err(Error::Interrupted { .. })));
    }

    #[tokio::test]
    async fn race_returns_future_result_when_never_interrupted() {
        let ctx = InterruptContext::new(Token::new());
        let res = ctx.race(async { Ok::<_, Error>(42) }).await;
        assert_eq!(res.unwrap(), 42);
    }
}
