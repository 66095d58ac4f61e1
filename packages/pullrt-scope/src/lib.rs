//! Scope tree and resource-lifecycle primitives for a pull-based streaming runtime.
//!
//! A [`CompileScope`] owns a set of [`Resource`]s and a set of child scopes. Closing a scope
//! releases its resources and recursively closes its children, collecting rather than
//! short-circuiting on failure. Any scope can be made interruptible: an [`InterruptContext`]
//! raised on a scope is visible to every descendant that inherited it, and races cleanly against
//! in-flight effects via [`CompileScope::interruptible_eval`].

mod error;
mod interrupt;
mod resource;
mod scope;
mod token;

pub use error::{BoxError, Error, Result};
pub use interrupt::{ExecArgs, InterruptContext};
pub use resource::{Finalizer, Lease, Resource};
pub use scope::{CompileScope, ScopeLease};
pub use token::Token;
