//! `Pull<O, R>`: this crate's free-monad-like term type, and the algebra steps it is built from.
//!
//! Kept deliberately thin: the load-bearing logic lives in the scope tree
//! (`pullrt_scope::CompileScope`) and the interpreter (`crate::interp`) that drives these terms
//! against it.

use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use pullrt_scope::{CompileScope, Error, Finalizer, Token};

use crate::segment::Segment;

/// A pending effect evaluated via `scope.interruptible_eval`.
pub type BoxFuture = Pin<Box<dyn Future<Output = Result<Box<dyn Any + Send>, Error>> + Send>>;

/// One constructor of the interpreter's instruction set.
pub enum Step<O> {
    /// Emit a segment to the fold; carries no further result.
    Output(Segment<O, ()>),
    /// Force a segment into (chunks, result); chunks are emitted, the boxed result continues.
    Run(Segment<O, Box<dyn Any + Send>>),
    /// Pull from a nested, same-output-type stream just enough to expose one leading chunk.
    Uncons(Box<Pull<O, ()>>, usize, usize),
    /// Evaluate an effectful future, racing interruption.
    Eval(BoxFuture),
    /// Acquire a resource: runs `f`, which produces the boxed acquired value and its finalizer.
    Acquire(Box<dyn FnOnce() -> Result<(Box<dyn Any + Send>, Finalizer), Error> + Send>),
    /// Release a previously acquired resource by id.
    Release(Token),
    /// Open a child scope, optionally interruptible.
    OpenScope(bool),
    /// Close a previously opened scope.
    CloseScope(Arc<CompileScope>),
    /// Read the current scope.
    GetScope,
}

/// The continuation of a `Bind` node.
pub type Cont<O, R> = Box<dyn FnOnce(Result<Box<dyn Any + Send>, Error>) -> Pull<O, R> + Send>;

/// An installed error handler, as attached by [`Pull::handle_error_with`]. Kept as an `Arc<dyn
/// Fn>` (rather than `FnOnce`) because the interpreter's interrupt-unwinding logic may invoke the
/// same handler repeatedly — once per reentry — up to `max_interrupt_depth`.
pub type Handler<O, R> = Arc<dyn Fn(Error) -> Pull<O, R> + Send + Sync>;

/// This crate's free-monad-like term: a stream is built up as a `Pull<O, R>`, where `O` is the
/// type of values emitted along the way and `R` is the final result.
pub enum Pull<O, R> {
    Pure(R),
    Fail(Error),
    Bind(Step<O>, Cont<O, R>),
    /// `inner` with `handler` installed: if `inner` (or anything it binds into) fails, the
    /// interpreter calls `handler` with the failure instead of propagating it. Left as data
    /// rather than eagerly resolved, so the interpreter — not a recursive Rust call — drives how
    /// many times a self-reinstalling handler gets to run (see `crate::interp`).
    HandleErrorWith(Box<Pull<O, R>>, Handler<O, R>),
}

impl<O, R> Pull<O, R>
where
    O: Send + 'static,
    R: Send + 'static,
{
    pub fn pure(r: R) -> Self {
        Pull::Pure(r)
    }

    pub fn fail(e: Error) -> Self {
        Pull::Fail(e)
    }

    /// Sequences `self` with `k`, feeding `self`'s result into `k`. Any handler installed on
    /// `self` via [`Pull::handle_error_with`] stays installed around `k` too.
    pub fn flat_map<R2>(self, k: impl FnOnce(R) -> Pull<O, R2> + Send + 'static) -> Pull<O, R2>
    where
        R2: Send + 'static,
    {
        match self {
            Pull::Pure(r) => k(r),
            Pull::Fail(e) => Pull::Fail(e),
            Pull::Bind(step, cont) => {
                Pull::Bind(step, Box::new(move |res| cont(res).flat_map(k)))
            }
            Pull::HandleErrorWith(inner, handler) => {
                Pull::HandleErrorWith(Box::new(inner.flat_map(k)), handler)
            }
        }
    }

    /// Installs an error handler around `self`. Left as data (a [`Pull::HandleErrorWith`] node)
    /// rather than resolved here: the interpreter decides when and how many times to invoke it,
    /// which is what lets it bound a self-reinstalling handler by `max_interrupt_depth` instead of
    /// recursing on the Rust call stack.
    pub fn handle_error_with(
        self,
        f: impl Fn(Error) -> Pull<O, R> + Send + Sync + 'static,
    ) -> Pull<O, R> {
        Pull::HandleErrorWith(Box::new(self), Arc::new(f))
    }
}

fn output<O>(values: Vec<O>) -> Pull<O, ()>
where
    O: Send + 'static,
{
    Pull::Bind(
        Step::Output(Segment::new(values, ())),
        Box::new(|res| match res {
            Ok(_) => Pull::Pure(()),
            Err(e) => Pull::Fail(e),
        }),
    )
}

/// Emits `values` as a single segment.
pub fn emit<O>(values: Vec<O>) -> Pull<O, ()>
where
    O: Send + 'static,
{
    output(values)
}

/// Evaluates `fut` as an effect, yielding its boxed result to the continuation.
pub fn eval<O, T>(fut: impl Future<Output = Result<T, Error>> + Send + 'static) -> Pull<O, T>
where
    O: Send + 'static,
    T: Send + 'static,
{
    let boxed: BoxFuture = Box::pin(async move { fut.await.map(|t| Box::new(t) as Box<dyn Any + Send>) });
    Pull::Bind(
        Step::Eval(boxed),
        Box::new(|res| match res {
            Ok(boxed) => match boxed.downcast::<T>() {
                Ok(t) => Pull::Pure(*t),
                Err(_) => Pull::Fail(Error::IllegalState("Eval returned the wrong type")),
            },
            Err(e) => Pull::Fail(e),
        }),
    )
}

/// Acquires a resource via `f`, yielding its value and the resource's [`Token`] to the
/// continuation. The token can later be passed to [`release`] to release this specific resource
/// ahead of its scope closing.
pub fn acquire<O, T>(
    f: impl FnOnce() -> Result<(T, Finalizer), Error> + Send + 'static,
) -> Pull<O, (T, Token)>
where
    O: Send + 'static,
    T: Send + 'static,
{
    let thunk: Box<dyn FnOnce() -> Result<(Box<dyn Any + Send>, Finalizer), Error> + Send> =
        Box::new(move || f().map(|(t, fin)| (Box::new(t) as Box<dyn Any + Send>, fin)));
    Pull::Bind(
        Step::Acquire(thunk),
        Box::new(|res| match res {
            Ok(boxed) => match boxed.downcast::<(Box<dyn Any + Send>, Token)>() {
                Ok(pair) => {
                    let (inner, token) = *pair;
                    match inner.downcast::<T>() {
                        Ok(t) => Pull::Pure((*t, token)),
                        Err(_) => Pull::Fail(Error::IllegalState("Acquire returned the wrong type")),
                    }
                }
                Err(_) => Pull::Fail(Error::IllegalState("Acquire returned the wrong type")),
            },
            Err(e) => Pull::Fail(e),
        }),
    )
}

/// Releases a resource previously acquired with [`acquire`].
pub fn release<O>(id: Token) -> Pull<O, ()>
where
    O: Send + 'static,
{
    Pull::Bind(
        Step::Release(id),
        Box::new(|res| match res {
            Ok(_) => Pull::Pure(()),
            Err(e) => Pull::Fail(e),
        }),
    )
}

/// Reads the interpreter's current scope without changing it.
pub fn get_scope<O>() -> Pull<O, Arc<CompileScope>>
where
    O: Send + 'static,
{
    Pull::Bind(
        Step::GetScope,
        Box::new(|res| match res {
            Ok(boxed) => match boxed.downcast::<Arc<CompileScope>>() {
                Ok(scope) => Pull::Pure(*scope),
                Err(_) => Pull::Fail(Error::IllegalState("GetScope returned the wrong type")),
            },
            Err(e) => Pull::Fail(e),
        }),
    )
}

/// Opens a child scope under the interpreter's current scope, optionally interruptible, and
/// yields a handle to it. The opened scope becomes the interpreter's current scope for whatever
/// follows in the term.
pub fn open_scope<O>(interruptible: bool) -> Pull<O, Arc<CompileScope>>
where
    O: Send + 'static,
{
    Pull::Bind(
        Step::OpenScope(interruptible),
        Box::new(|res| match res {
            Ok(boxed) => match boxed.downcast::<Arc<CompileScope>>() {
                Ok(scope) => Pull::Pure(*scope),
                Err(_) => Pull::Fail(Error::IllegalState("OpenScope returned the wrong type")),
            },
            Err(e) => Pull::Fail(e),
        }),
    )
}

/// Closes a scope previously returned by [`open_scope`]. The interpreter's current scope reverts
/// to `scope`'s nearest open ancestor.
pub fn close_scope<O>(scope: Arc<CompileScope>) -> Pull<O, ()>
where
    O: Send + 'static,
{
    Pull::Bind(
        Step::CloseScope(scope),
        Box::new(|res| match res {
            Ok(_) => Pull::Pure(()),
            Err(e) => Pull::Fail(e),
        }),
    )
}

/// Forces `seg` into its emitted chunk plus terminal result: the chunk is folded into the
/// caller's accumulator and the result feeds the rest of the term.
pub fn run<O, R>(seg: Segment<O, R>) -> Pull<O, R>
where
    O: Send + 'static,
    R: Send + 'static,
{
    Pull::Bind(
        Step::Run(seg.map_result(|r| Box::new(r) as Box<dyn Any + Send>)),
        Box::new(|res| match res {
            Ok(boxed) => match boxed.downcast::<R>() {
                Ok(r) => Pull::Pure(*r),
                Err(_) => Pull::Fail(Error::IllegalState("Run returned the wrong type")),
            },
            Err(e) => Pull::Fail(e),
        }),
    )
}

/// Pulls just enough of `inner` to expose at most one chunk of size `<= chunk_size`, doing at most
/// `max_steps` units of algebra work, returning the chunk plus the remainder of `inner` (or `None`
/// if `inner` was already exhausted).
pub fn uncons<O>(
    inner: Pull<O, ()>,
    chunk_size: usize,
    max_steps: usize,
) -> Pull<O, Option<(Vec<O>, Pull<O, ()>)>>
where
    O: Send + 'static,
{
    Pull::Bind(
        Step::Uncons(Box::new(inner), chunk_size, max_steps),
        Box::new(|res| match res {
            Ok(boxed) => match boxed.downcast::<Option<(Vec<O>, Pull<O, ()>)>>() {
                Ok(result) => Pull::Pure(*result),
                Err(_) => Pull::Fail(Error::IllegalState("Uncons returned the wrong type")),
            },
            Err(e) => Pull::Fail(e),
        }),
    )
}
