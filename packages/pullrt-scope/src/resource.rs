//! A single acquired resource and its lease/release lifecycle.

use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::token::Token;

/// Runs a resource's cleanup action. Boxed so `Resource` does not need to be generic over the
/// value it was acquired for.
pub type Finalizer = Box<dyn FnOnce() -> Result<()> + Send>;

enum State {
    /// Created but not yet acquired: no finalizer, zero leases.
    Pending,
    /// Acquired; may be leased. `release_requested` is set once `release()` is called while
    /// leases are still outstanding.
    Open {
        finalizer: Finalizer,
        leases: usize,
        release_requested: bool,
    },
    /// The finalizer has run (or acquisition was aborted). Terminal.
    Closed,
}

/// One resource registered with a [`crate::scope::CompileScope`].
///
/// A `Resource` transitions `Pending -> Open -> Closed` and never backwards. Its finalizer runs
/// exactly once, only after `release()` has been requested *and* its lease count has reached
/// zero.
pub struct Resource {
    id: Token,
    state: Mutex<State>,
}

impl Resource {
    /// Allocates a resource in `Pending` state with no finalizer and zero leases.
    pub fn create() -> Arc<Resource> {
        Arc::new(Resource {
            id: Token::new(),
            state: Mutex::new(State::Pending),
        })
    }

    /// The resource's identity, used to look it up for explicit release.
    pub fn id(&self) -> Token {
        self.id
    }

    /// Installs `finalizer`, transitioning `Pending -> Open`.
    ///
    /// If the resource was already closed — e.g. because the scope it was registered in closed
    /// out from under a concurrent acquisition — `finalizer` is run immediately instead, and any
    /// error it raises is surfaced.
    pub fn acquired(&self, finalizer: Finalizer) -> Result<()> {
        let mut guard = self.state.lock().unwrap();
        match &*guard {
            State::Pending => {
                *guard = State::Open {
                    finalizer,
                    leases: 0,
                    release_requested: false,
                };
                Ok(())
            }
            State::Closed => {
                drop(guard);
                finalizer()
            }
            State::Open { .. } => {
                unreachable!("acquired() called twice on the same resource")
            }
        }
    }

    /// While `Open`, increments the lease count and returns a handle that defers finalization
    /// until cancelled. Returns `None` if the resource is `Closed`.
    pub fn lease(self: &Arc<Self>) -> Option<Lease> {
        let mut guard = self.state.lock().unwrap();
        match &mut *guard {
            State::Open { leases, .. } => {
                *leases += 1;
                Some(Lease {
                    resource: self.clone(),
                })
            }
            State::Pending | State::Closed => None,
        }
    }

    /// Marks the resource for release. Runs the finalizer synchronously if there are no
    /// outstanding leases; otherwise defers it until the last lease is cancelled.
    pub fn release(&self) -> Result<()> {
        let ready = {
            let mut guard = self.state.lock().unwrap();
            match &mut *guard {
                State::Pending => {
                    *guard = State::Closed;
                    None
                }
                State::Open {
                    leases,
                    release_requested,
                    ..
                } if *leases > 0 => {
                    *release_requested = true;
                    None
                }
                State::Open { .. } => match std::mem::replace(&mut *guard, State::Closed) {
                    State::Open { finalizer, .. } => Some(finalizer),
                    _ => unreachable!(),
                },
                State::Closed => None,
            }
        };
        match ready {
            Some(finalizer) => finalizer(),
            None => Ok(()),
        }
    }

    fn cancel_lease(&self) -> Result<()> {
        let ready = {
            let mut guard = self.state.lock().unwrap();
            match &mut *guard {
                State::Open {
                    leases,
                    release_requested,
                    ..
                } => {
                    *leases -= 1;
                    if *leases == 0 && *release_requested {
                        match std::mem::replace(&mut *guard, State::Closed) {
                            State::Open { finalizer, .. } => Some(finalizer),
                            _ => unreachable!(),
                        }
                    } else {
                        None
                    }
                }
                State::Pending | State::Closed => None,
            }
        };
        match ready {
            Some(finalizer) => finalizer(),
            None => Ok(()),
        }
    }
}

/// A counted, cancellable handle returned by [`Resource::lease`] (or, composed, by
/// [`crate::scope::CompileScope::lease`]). Defers finalization of the leased resource until
/// `cancel` is called.
pub struct Lease {
    resource: Arc<Resource>,
}

impl Lease {
    /// Releases this lease. If this was the last outstanding lease and the resource's release had
    /// already been requested, runs the finalizer.
    pub fn cancel(self) -> Result<()> {
        self.resource.cancel_lease()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_finalizer(counter: Arc<AtomicUsize>) -> Finalizer {
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn release_without_leases_runs_finalizer_immediately() {
        let r = Resource::create();
        let runs = Arc::new(AtomicUsize::new(0));
        r.acquired(counting_finalizer(runs.clone())).unwrap();
        r.release().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn release_with_outstanding_lease_defers_finalizer() {
        let r = Resource::create();
        let runs = Arc::new(AtomicUsize::new(0));
        r.acquired(counting_finalizer(runs.clone())).unwrap();
        let lease = r.lease().unwrap();
        r.release().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        lease.cancel().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn lease_after_close_returns_none() {
        let r = Resource::create();
        r.acquired(counting_finalizer(Arc::new(AtomicUsize::new(0))))
            .unwrap();
        r.release().unwrap();
        assert!(r.lease().is_none());
    }

    #[test]
    fn acquired_on_already_closed_runs_finalizer_and_surfaces_error() {
        #[derive(Debug, thiserror::Error)]
        #[error("boom")]
        struct Boom;

        let r = Resource::create();
        r.release().unwrap(); // Pending -> Closed with no finalizer.
        let err = r
            .acquired(Box::new(|| Err(Error::user(Boom))))
            .unwrap_err();
        assert!(matches!(err, Error::User(_)));
    }

    #[test]
    fn multiple_leases_each_require_cancellation() {
        let r = Resource::create();
        let runs = Arc::new(AtomicUsize::new(0));
        r.acquired(counting_finalizer(runs.clone())).unwrap();
        let l1 = r.lease().unwrap();
        let l2 = r.lease().unwrap();
        r.release().unwrap();
        l1.cancel().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        l2.cancel().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
