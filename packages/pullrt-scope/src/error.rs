//! Error kinds for the scope tree and, by re-export, the step interpreter built on top of it.

use std::sync::Arc;

use crate::token::Token;

/// A type-erased user error, as raised by `acquire`, `release`, an evaluated effect, or a fold
/// combiner. Kept behind an `Arc` (rather than `Box`) so [`Error`] stays `Clone`, which the
/// interrupt machinery needs in order to let several readers observe the same cause.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Everything that can go wrong while walking the scope tree or the step interpreter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// A resource acquisition was attempted on a scope that had already been closed.
    #[error("resource acquisition attempted after scope was closed")]
    AcquireAfterScopeClosed,

    /// An operation required a scope invariant (e.g. "is interruptible", "has an open ancestor")
    /// that did not hold.
    #[error("illegal scope state: {0}")]
    IllegalState(&'static str),

    /// Interrupt marker used by the step interpreter's unwinding logic. `cause` is the original
    /// error passed to `interrupt`, if any; `loop_count` is bumped each time this same interrupt
    /// is re-delivered to a stream's own error handler at `scope` (see SPEC_FULL.md §4.E).
    #[error("interrupted at scope {scope:?} (reentry {loop_count})")]
    Interrupted {
        scope: Token,
        cause: Option<Arc<Error>>,
        loop_count: u32,
    },

    /// An aggregate of two or more failures collected while closing a scope or tearing down a
    /// partially acquired resource. Never contains another `Composite` — see [`Error::composite`].
    #[error("{} errors occurred: {0:?}", .0.len())]
    Composite(Vec<Error>),

    /// An error surfaced from user-supplied code: `acquire`, `release`, an evaluated effect, or a
    /// fold combiner.
    #[error("{0}")]
    User(BoxError),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wraps a concrete user error as an [`Error::User`].
    pub fn user<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::User(Arc::new(err))
    }

    /// Flattens `errors` into a single `Error`: an empty list has no error, a one-element list is
    /// returned unwrapped, and anything longer is wrapped in a single `Composite` with any nested
    /// `Composite`s merged in (property 8 in SPEC_FULL.md §8).
    pub fn composite(errors: Vec<Error>) -> Option<Error> {
        let mut flat = Vec::with_capacity(errors.len());
        for e in errors {
            match e {
                Error::Composite(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => None,
            1 => flat.pop(),
            _ => Some(Error::Composite(flat)),
        }
    }

    /// Combines two optional failures (e.g. a primary error and a cleanup error) into one,
    /// per the "merge acquire error with cleanup error" rule in SPEC_FULL.md §7.
    pub fn combine(a: Option<Error>, b: Option<Error>) -> Option<Error> {
        match (a, b) {
            (None, None) => None,
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (Some(a), Some(b)) => Error::composite(vec![a, b]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_of_one_is_unwrapped() {
        let e = Error::composite(vec![Error::AcquireAfterScopeClosed]).unwrap();
        assert!(matches!(e, Error::AcquireAfterScopeClosed));
    }

    #[test]
    fn composite_flattens_nested_composites() {
        let inner = Error::composite(vec![
            Error::AcquireAfterScopeClosed,
            Error::IllegalState("x"),
        ])
        .unwrap();
        let outer = Error::composite(vec![inner, Error::IllegalState("y")]).unwrap();
        match outer {
            Error::Composite(list) => assert_eq!(list.len(), 3),
            other => panic!("expected a flattened Composite, got {other:?}"),
        }
    }

    #[test]
    fn composite_of_none_is_none() {
        assert!(Error::composite(vec![]).is_none());
    }
}
