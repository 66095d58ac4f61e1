//! The scope tree: a `CompileScope` owns a set of resources and a set of child scopes, and
//! guarantees that closing it releases both, children first, in reverse-registration order.

use std::sync::{Arc, Mutex, Weak};

use smallvec::SmallVec;

use crate::error::{Error, Result};
use crate::interrupt::InterruptContext;
use crate::resource::{Finalizer, Lease, Resource};
use crate::token::Token;

/// Most scopes hold a handful of resources/children at most; inlining a few avoids a heap
/// allocation for the common case, same tradeoff `sycamore_reactive::NodeState` makes for its
/// dependency list.
type ResourceList = SmallVec<[Arc<Resource>; 4]>;
type ChildList = SmallVec<[Arc<CompileScope>; 4]>;

struct ScopeState {
    resources: ResourceList,
    children: ChildList,
    closed: bool,
}

/// A node in the scope tree.
///
/// Every `CompileScope` holds a strong reference to its children and a weak reference to its
/// parent, so a scope tree never keeps itself alive via a reference cycle: once the last external
/// handle (typically the interpreter's current-scope pointer) and all child handles are dropped,
/// the whole subtree is freed even if `close` was never called.
pub struct CompileScope {
    id: Token,
    parent: Option<Weak<CompileScope>>,
    interrupt: Option<InterruptContext>,
    state: Mutex<ScopeState>,
}

/// Handle returned by [`CompileScope::lease`]: keeps every resource registered directly in this
/// scope alive (via its own lease) until cancelled, independent of the scope's own lifetime.
pub struct ScopeLease {
    leases: Vec<Lease>,
}

impl ScopeLease {
    /// Cancels every underlying resource lease, collecting and combining any finalizer errors.
    pub fn cancel(self) -> Result<()> {
        let errors: Vec<Error> = self
            .leases
            .into_iter()
            .filter_map(|l| l.cancel().err())
            .collect();
        match Error::composite(errors) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl CompileScope {
    /// Creates a new root scope. `interruptible` determines whether this scope (and, by
    /// inheritance, any descendant that doesn't open its own) can be interrupted.
    pub fn root(interruptible: bool) -> Arc<CompileScope> {
        let id = Token::new();
        Arc::new(CompileScope {
            id,
            parent: None,
            interrupt: interruptible.then(|| InterruptContext::new(id)),
            state: Mutex::new(ScopeState {
                resources: ResourceList::new(),
                children: ChildList::new(),
                closed: false,
            }),
        })
    }

    /// This scope's identity.
    pub fn id(&self) -> Token {
        self.id
    }

    /// Opens a child scope registered under `self`. `interruptible` opts the child into its own,
    /// independent interrupt context; when `false`, the child inherits the nearest interruptible
    /// ancestor's context (or has none, if there is no such ancestor).
    ///
    /// If `self` has already been closed, delegates to the nearest still-open ancestor instead of
    /// failing outright; only a fully closed chain (root included) is an error.
    pub fn open(self: &Arc<Self>, interruptible: bool) -> Result<Arc<CompileScope>> {
        let target = self.nearest_open_ancestor();
        let mut guard = target.state.lock().unwrap();
        if guard.closed {
            return Err(Error::IllegalState("open called on a closed scope"));
        }
        let child_id = Token::new();
        let interrupt = if interruptible {
            Some(InterruptContext::new(child_id))
        } else {
            target.interrupt.clone()
        };
        let child = Arc::new(CompileScope {
            id: child_id,
            parent: Some(Arc::downgrade(&target)),
            interrupt,
            state: Mutex::new(ScopeState {
                resources: ResourceList::new(),
                children: ChildList::new(),
                closed: false,
            }),
        });
        guard.children.push(child.clone());
        Ok(child)
    }

    /// Registers a freshly created resource with `self`, runs `acquire` to produce its value and
    /// finalizer, and installs the finalizer on the resource. If the scope was concurrently
    /// closed before `acquire` completed, the finalizer still runs (immediately, via
    /// `Resource::acquired`'s closed-path), so partially-acquired resources never leak.
    ///
    /// Returns the acquired value paired with the resource's [`Token`], so a caller can later
    /// target it with [`CompileScope::release_resource`] independent of this scope's own close.
    #[cfg_attr(feature = "trace", tracing::instrument(level = "trace", skip_all, fields(scope = ?self.id)))]
    pub fn acquire_resource<T>(
        self: &Arc<Self>,
        acquire: impl FnOnce() -> Result<(T, Finalizer)>,
    ) -> Result<(T, Token)> {
        let resource = Resource::create();
        let id = resource.id();
        {
            let mut guard = self.state.lock().unwrap();
            if guard.closed {
                return Err(Error::AcquireAfterScopeClosed);
            }
            guard.resources.push(resource.clone());
        }
        match acquire() {
            Ok((value, finalizer)) => {
                resource.acquired(finalizer)?;
                Ok((value, id))
            }
            Err(err) => {
                // The resource never got a finalizer installed, so unregister it and release it
                // (a no-op finalizer-wise, but it may still surface a late-close error) rather
                // than leaving a dangling Pending entry in this scope's resource list.
                let cleanup_err = self.release_resource(id).err();
                Err(Error::combine(Some(err), cleanup_err).expect("primary error is always Some"))
            }
        }
    }

    /// Releases a single resource registered directly in this scope by id, removing it from the
    /// scope's bookkeeping. A no-op if the id is not found (already released).
    pub fn release_resource(&self, id: Token) -> Result<()> {
        let resource = {
            let mut guard = self.state.lock().unwrap();
            let idx = guard.resources.iter().position(|r| r.id() == id);
            idx.map(|i| guard.resources.remove(i))
        };
        match resource {
            Some(r) => r.release(),
            None => Ok(()),
        }
    }

    /// Leases a snapshot of every resource visible from this scope: its own resources, its direct
    /// children's resources, and every ancestor's resources. Resources acquired after this call is
    /// taken are not covered, per SPEC_FULL.md §4.D.
    ///
    /// Returns `None` if this scope is already closed at the moment of the call — per the resolved
    /// open question in SPEC_FULL.md §9, `lease` never races a concurrent `close` into handing back
    /// a lease over a scope that has already flipped to closed, even if its finalizers haven't run
    /// yet.
    pub fn lease(&self) -> Option<ScopeLease> {
        let mut resources: ResourceList = {
            let guard = self.state.lock().unwrap();
            if guard.closed {
                return None;
            }
            let mut collected = guard.resources.clone();
            for child in &guard.children {
                collected.extend(child.state.lock().unwrap().resources.iter().cloned());
            }
            collected
        };
        let mut ancestor = self.parent();
        while let Some(scope) = ancestor {
            resources.extend(scope.state.lock().unwrap().resources.iter().cloned());
            ancestor = scope.parent();
        }
        let leases = resources.iter().filter_map(|r| r.lease()).collect();
        Some(ScopeLease { leases })
    }

    /// Closes this scope: recursively closes every child (in reverse-registration order, so the
    /// most recently opened child is torn down first), then releases every directly-registered
    /// resource (also in reverse-registration order), then unregisters itself from its parent.
    /// Idempotent. All failures encountered along the way are collected and combined rather than
    /// short-circuiting, per the "close keeps going" testable property.
    #[cfg_attr(feature = "trace", tracing::instrument(level = "trace", skip_all, fields(scope = ?self.id)))]
    pub fn close(self: &Arc<Self>) -> Result<()> {
        let (children, resources) = {
            let mut guard = self.state.lock().unwrap();
            if guard.closed {
                return Ok(());
            }
            guard.closed = true;
            let mut children = std::mem::take(&mut guard.children);
            let mut resources = std::mem::take(&mut guard.resources);
            children.reverse();
            resources.reverse();
            (children, resources)
        };

        let mut errors = Vec::new();
        for child in children {
            if let Err(e) = child.close() {
                errors.push(e);
            }
        }
        for resource in resources {
            if let Err(e) = resource.release() {
                errors.push(e);
            }
        }
        if let Some(parent) = self.parent.as_ref().and_then(Weak::upgrade) {
            parent.release_child_scope(self.id);
        }
        match Error::composite(errors) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Removes `child_id` from this scope's child list without closing it. Called by a child at
    /// the end of its own `close`; a no-op if the child is not present (e.g. this scope itself was
    /// already closed and cleared its child list first).
    fn release_child_scope(&self, child_id: Token) {
        let mut guard = self.state.lock().unwrap();
        guard.children.retain(|c| c.id != child_id);
    }

    /// This scope's parent, if it has one and it hasn't been dropped.
    pub fn parent(&self) -> Option<Arc<CompileScope>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    /// Whether `ancestor` is a strict ancestor of `self` (i.e. not `self` itself), walking up via
    /// parent links.
    pub fn has_ancestor(&self, ancestor: Token) -> bool {
        let mut current = self.parent();
        while let Some(scope) = current {
            if scope.id == ancestor {
                return true;
            }
            current = scope.parent();
        }
        false
    }

    /// Walks up from `self` (not open-closed aware — every scope in the chain may or may not
    /// still be open) to find the nearest *open* ancestor, returning `self` if it is itself open
    /// and has no closed ancestors in the way. Used by `open` to re-root a child request made on
    /// an already-closed scope.
    pub fn nearest_open_ancestor(self: &Arc<Self>) -> Arc<CompileScope> {
        let mut current = self.clone();
        loop {
            if !current.state.lock().unwrap().closed {
                return current;
            }
            match current.parent() {
                Some(parent) => current = parent,
                None => return current,
            }
        }
    }

    /// Raises this scope's interrupt context, if it has one (propagating to every descendant
    /// scope that inherited the same context). A no-op on a non-interruptible scope.
    pub fn interrupt(&self, cause: Option<Error>) {
        if let Some(ctx) = &self.interrupt {
            ctx.interrupt(cause);
        }
    }

    /// Whether this scope currently has a set interrupt cause.
    pub fn is_interrupted(&self) -> bool {
        self.interrupt.as_ref().is_some_and(InterruptContext::is_interrupted)
    }

    /// Atomically claims this scope's interrupt cause, if any and not already claimed. See
    /// [`InterruptContext::try_claim`].
    pub fn shall_interrupt(&self) -> Option<Option<Error>> {
        self.interrupt.as_ref().and_then(InterruptContext::try_claim)
    }

    /// Runs `fut` to completion unless this scope's interrupt context fires first, in which case
    /// `fut` is dropped and an `Error::Interrupted` is returned. Scopes with no interrupt context
    /// simply await `fut` uninterrupted.
    pub async fn interruptible_eval<F, T>(&self, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        match &self.interrupt {
            Some(ctx) => ctx.race(fut).await,
            None => fut.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn tracking_acquire(
        log: Arc<Mutex<Vec<&'static str>>>,
        name: &'static str,
    ) -> impl FnOnce() -> Result<((), Finalizer)> {
        move || {
            log.lock().unwrap().push(name);
            let log2 = log.clone();
            Ok((
                (),
                Box::new(move || {
                    log2.lock().unwrap().push(name);
                    Ok(())
                }) as Finalizer,
            ))
        }
    }

    #[test]
    fn close_releases_resources_in_reverse_order() {
        let root = CompileScope::root(false);
        let log = Arc::new(Mutex::new(Vec::new()));
        root.acquire_resource(tracking_acquire(log.clone(), "a")).unwrap();
        root.acquire_resource(tracking_acquire(log.clone(), "b")).unwrap();
        root.close().unwrap();
        // Each name appears once for acquire and once for release; releases land in reverse.
        let trace = log.lock().unwrap().clone();
        assert_eq!(trace, vec!["a", "b", "b", "a"]);
    }

    #[test]
    fn close_is_idempotent() {
        let root = CompileScope::root(false);
        root.close().unwrap();
        root.close().unwrap();
    }

    #[test]
    fn child_unregisters_from_parent_on_close() {
        let root = CompileScope::root(false);
        let child = root.open(false).unwrap();
        child.close().unwrap();
        assert_eq!(root.state.lock().unwrap().children.len(), 0);
    }

    #[test]
    fn closing_parent_closes_children_first() {
        let root = CompileScope::root(false);
        let log = Arc::new(Mutex::new(Vec::new()));
        root.acquire_resource(tracking_acquire(log.clone(), "root")).unwrap();
        let child = root.open(false).unwrap();
        child.acquire_resource(tracking_acquire(log.clone(), "child")).unwrap();
        root.close().unwrap();
        let trace = log.lock().unwrap().clone();
        assert_eq!(trace, vec!["root", "child", "child", "root"]);
    }

    #[test]
    fn acquire_after_close_fails() {
        let root = CompileScope::root(false);
        root.close().unwrap();
        let err = root
            .acquire_resource(|| Ok(((), Box::new(|| Ok(())) as Finalizer)))
            .unwrap_err();
        assert!(matches!(err, Error::AcquireAfterScopeClosed));
    }

    #[test]
    fn has_ancestor_walks_the_chain() {
        let root = CompileScope::root(false);
        let child = root.open(false).unwrap();
        let grandchild = child.open(false).unwrap();
        assert!(grandchild.has_ancestor(root.id()));
        assert!(grandchild.has_ancestor(child.id()));
        assert!(!root.has_ancestor(grandchild.id()));
        assert!(!grandchild.has_ancestor(grandchild.id()), "ancestor check is strict");
    }

    #[test]
    fn non_interruptible_child_inherits_parent_context() {
        let root = CompileScope::root(true);
        let child = root.open(false).unwrap();
        root.interrupt(None);
        assert!(child.is_interrupted());
    }

    #[test]
    fn interruptible_child_has_independent_context() {
        let root = CompileScope::root(true);
        let child = root.open(true).unwrap();
        root.interrupt(None);
        assert!(!child.is_interrupted());
    }

    #[test]
    fn lease_outlives_scope_close() {
        let root = CompileScope::root(false);
        let runs = Arc::new(AtomicUsize::new(0));
        let runs2 = runs.clone();
        root.acquire_resource(|| {
            Ok((
                (),
                Box::new(move || {
                    runs2.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }) as Finalizer,
            ))
        })
        .unwrap();
        let lease = root.lease().unwrap();
        root.close().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        lease.cancel().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn lease_on_closed_scope_returns_none() {
        let root = CompileScope::root(false);
        root.close().unwrap();
        assert!(root.lease().is_none());
    }

    #[test]
    fn lease_covers_children_and_ancestors() {
        let root = CompileScope::root(false);
        let runs = Arc::new(AtomicUsize::new(0));
        root.acquire_resource(|| {
            let runs = runs.clone();
            Ok(((), Box::new(move || { runs.fetch_add(1, Ordering::SeqCst); Ok(()) }) as Finalizer))
        })
        .unwrap();
        let child = root.open(false).unwrap();
        child
            .acquire_resource(|| {
                let runs = runs.clone();
                Ok(((), Box::new(move || { runs.fetch_add(1, Ordering::SeqCst); Ok(()) }) as Finalizer))
            })
            .unwrap();
        // Leasing from the child must cover its own resource AND the root's (an ancestor's).
        let lease = child.lease().unwrap();
        root.close().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        lease.cancel().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn close_combines_multiple_finalizer_errors() {
        #[derive(Debug, thiserror::Error)]
        #[error("boom {0}")]
        struct Boom(&'static str);

        let root = CompileScope::root(false);
        root.acquire_resource(|| {
            Ok(((), Box::new(|| Err(Error::user(Boom("a")))) as Finalizer))
        })
        .unwrap();
        root.acquire_resource(|| {
            Ok(((), Box::new(|| Err(Error::user(Boom("b")))) as Finalizer))
        })
        .unwrap();
        let err = root.close().unwrap_err();
        match err {
            Error::Composite(list) => assert_eq!(list.len(), 2),
            other => panic!("expected Composite, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn interruptible_eval_races_interrupt() {
        let root = CompileScope::root(true);
        root.interrupt(Some(Error::IllegalState("stop")));
        let res = root
            .interruptible_eval(std::future::pending::<Result<()>>())
            .await;
        assert!(matches!(res, Err(Error::Interrupted { .. })));
    }
}
