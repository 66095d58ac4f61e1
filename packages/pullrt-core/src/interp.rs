//! The step interpreter: walks a [`Pull`] term against a current scope, folding emitted segments
//! and driving scope operations, with bounded interrupt unwinding.
//!
//! Two invariants hold everywhere in this module:
//! - `scope.shall_interrupt()` is probed exactly once per `Bind`, immediately before running that
//!   step's effect, and its cause (if any) is fed to the pending continuation exactly like any
//!   other per-step error — it does not jump straight to a handler.
//! - Rewriting an `Error::Interrupted` (bumping its reentry counter, capping it at
//!   `max_interrupt_depth`) and dispatching to the innermost installed
//!   [`crate::algebra::Pull::HandleErrorWith`] handler both happen in exactly one place: when the
//!   trampoline sees a bare `Pull::Fail`. Every other error path (probe misses, `Acquire` /
//!   `Release` / `Eval` failures) funnels through a continuation first and so always arrives here.

use std::any::Any;
use std::sync::Arc;

use pullrt_scope::{CompileScope, Error, ExecArgs, Result};

use crate::algebra::{Handler, Pull, Step};
use crate::segment::SplitResult;

/// Runs `term` to completion against `scope`, folding every emitted value into `init` with `g`.
///
/// This is the fold loop of SPEC_FULL.md §4.E: a flat trampoline, not a recursive walker, so long
/// streams don't blow the native stack. Recursion only happens per nested `Uncons`, itself bounded
/// by `max_steps`.
pub async fn fold<O, B>(
    mut term: Pull<O, B>,
    mut scope: Arc<CompileScope>,
    init: B,
    mut g: impl FnMut(&mut B, O) -> Result<()>,
    args: &ExecArgs,
) -> Result<B>
where
    O: Send + 'static,
    B: Send + 'static,
{
    let mut acc = init;
    let mut handlers: Vec<Handler<O, B>> = Vec::new();
    loop {
        match term {
            Pull::Pure(b) => return Ok(b),
            Pull::Fail(e) => {
                let err = match e {
                    Error::Interrupted { .. } => {
                        match rewrite_interrupt(&scope, e, args.max_interrupt_depth) {
                            Ok(rewritten) => rewritten,
                            Err(terminal) => return Err(terminal),
                        }
                    }
                    other => other,
                };
                match handlers.pop() {
                    Some(handler) => term = handler(err),
                    None => return Err(err),
                }
            }
            Pull::HandleErrorWith(inner, handler) => {
                handlers.push(handler);
                term = *inner;
            }
            Pull::Bind(step, cont) => {
                if let Some(cause) = scope.shall_interrupt() {
                    term = cont(Err(interrupt_error(scope.id(), cause)));
                    continue;
                }
                match step {
                    Step::Output(seg) => {
                        let (values, ()) = seg.into_parts();
                        term = match fold_values(&mut acc, values, &mut g) {
                            Ok(()) => cont(Ok(Box::new(()))),
                            Err(e) => cont(Err(e)),
                        };
                    }
                    Step::Run(seg) => {
                        let (values, boxed_r) = seg.into_parts();
                        term = match fold_values(&mut acc, values, &mut g) {
                            Ok(()) => cont(Ok(boxed_r)),
                            Err(e) => cont(Err(e)),
                        };
                    }
                    Step::Uncons(inner, chunk_size, max_steps) => {
                        let (result, new_scope) =
                            uncons(*inner, scope.clone(), chunk_size, max_steps).await;
                        scope = new_scope;
                        term = cont(result);
                    }
                    Step::Eval(fut) => {
                        term = match scope.interruptible_eval(fut).await {
                            Ok(v) => cont(Ok(v)),
                            Err(e) => cont(Err(e)),
                        };
                    }
                    Step::Acquire(f) => {
                        term = match scope.acquire_resource(f) {
                            Ok(value) => cont(Ok(value)),
                            Err(e) => cont(Err(e)),
                        };
                    }
                    Step::Release(id) => {
                        term = match scope.release_resource(id) {
                            Ok(()) => cont(Ok(Box::new(()))),
                            Err(e) => cont(Err(e)),
                        };
                    }
                    Step::OpenScope(interruptible) => {
                        term = match scope.open(interruptible) {
                            Ok(child) => {
                                scope = child.clone();
                                cont(Ok(Box::new(child)))
                            }
                            Err(e) => cont(Err(e)),
                        };
                    }
                    Step::CloseScope(inner) => {
                        let res = inner.close();
                        scope = inner.nearest_open_ancestor();
                        term = match res {
                            Ok(()) => cont(Ok(Box::new(()))),
                            Err(e) => cont(Err(e)),
                        };
                    }
                    Step::GetScope => {
                        term = cont(Ok(Box::new(scope.clone())));
                    }
                }
            }
        }
    }
}

/// Folds `values` into `acc` in place, stopping at the first error. `acc` reflects every value
/// folded before the failure, so the interpreter can keep going after feeding the error to the
/// stream's continuation.
fn fold_values<O, B>(
    acc: &mut B,
    values: Vec<O>,
    g: &mut impl FnMut(&mut B, O) -> Result<()>,
) -> Result<()> {
    for value in values {
        g(acc, value)?;
    }
    Ok(())
}

/// Recursively walks `inner` until it yields at most one chunk of size `<= chunk_size` within
/// `<= max_steps` work units, or is exhausted. Mirrors `fold`'s dispatch but collects the leading
/// chunk instead of folding it away: both `Output` and `Run` are chunk-producing primitives this
/// walker must surface directly. A nested `Uncons` is not supported inside an `Uncons` walk by
/// this minimal interpreter (see DESIGN.md).
async fn uncons<O>(
    mut term: Pull<O, ()>,
    mut scope: Arc<CompileScope>,
    chunk_size: usize,
    max_steps: usize,
) -> (Result<Box<dyn Any + Send>>, Arc<CompileScope>)
where
    O: Send + 'static,
{
    let mut handlers: Vec<Handler<O, ()>> = Vec::new();
    let mut steps_left = max_steps;
    loop {
        match term {
            Pull::Pure(()) => {
                let none: Option<(Vec<O>, Pull<O, ()>)> = None;
                return (Ok(Box::new(none)), scope);
            }
            Pull::Fail(e) => {
                let err = match e {
                    Error::Interrupted { .. } => {
                        match rewrite_interrupt(&scope, e, u32::MAX) {
                            Ok(rewritten) => rewritten,
                            Err(terminal) => return (Err(terminal), scope),
                        }
                    }
                    other => other,
                };
                match handlers.pop() {
                    Some(handler) => term = handler(err),
                    None => return (Err(err), scope),
                }
            }
            Pull::HandleErrorWith(inner, handler) => {
                handlers.push(handler);
                term = *inner;
            }
            Pull::Bind(step, cont) => {
                if let Some(cause) = scope.shall_interrupt() {
                    term = cont(Err(interrupt_error(scope.id(), cause)));
                    continue;
                }
                match step {
                    Step::Output(seg) => match seg.split_at(chunk_size, steps_left) {
                        SplitResult::Done(values, ()) => {
                            let remainder = cont(Ok(Box::new(())));
                            return (Ok(Box::new(Some((values, remainder)))), scope);
                        }
                        SplitResult::NotDone(prefix, remainder_seg) => {
                            let remainder = Pull::Bind(Step::Output(remainder_seg), cont);
                            return (Ok(Box::new(Some((prefix, remainder)))), scope);
                        }
                    },
                    Step::Eval(fut) => {
                        steps_left = steps_left.saturating_sub(1);
                        term = match scope.interruptible_eval(fut).await {
                            Ok(v) => cont(Ok(v)),
                            Err(e) => cont(Err(e)),
                        };
                    }
                    Step::Acquire(f) => {
                        steps_left = steps_left.saturating_sub(1);
                        term = match scope.acquire_resource(f) {
                            Ok(value) => cont(Ok(value)),
                            Err(e) => cont(Err(e)),
                        };
                    }
                    Step::Release(id) => {
                        steps_left = steps_left.saturating_sub(1);
                        term = match scope.release_resource(id) {
                            Ok(()) => cont(Ok(Box::new(()))),
                            Err(e) => cont(Err(e)),
                        };
                    }
                    Step::OpenScope(interruptible) => {
                        steps_left = steps_left.saturating_sub(1);
                        term = match scope.open(interruptible) {
                            Ok(child) => {
                                scope = child.clone();
                                cont(Ok(Box::new(child)))
                            }
                            Err(e) => cont(Err(e)),
                        };
                    }
                    Step::CloseScope(inner) => {
                        steps_left = steps_left.saturating_sub(1);
                        let res = inner.close();
                        scope = inner.nearest_open_ancestor();
                        term = match res {
                            Ok(()) => cont(Ok(Box::new(()))),
                            Err(e) => cont(Err(e)),
                        };
                    }
                    Step::GetScope => {
                        term = cont(Ok(Box::new(scope.clone())));
                    }
                    Step::Run(seg) => match seg.split_at(chunk_size, steps_left) {
                        SplitResult::Done(values, boxed_r) => {
                            let remainder = cont(Ok(boxed_r));
                            return (Ok(Box::new(Some((values, remainder)))), scope);
                        }
                        SplitResult::NotDone(prefix, remainder_seg) => {
                            let remainder = Pull::Bind(Step::Run(remainder_seg), cont);
                            return (Ok(Box::new(Some((prefix, remainder)))), scope);
                        }
                    },
                    Step::Uncons(..) => {
                        term = cont(Err(Error::IllegalState(
                            "nested Uncons inside uncons is not supported by this minimal interpreter",
                        )));
                    }
                }
                if steps_left == 0 {
                    // Budget exhausted before a chunk surfaced: hand back an empty chunk paired
                    // with whatever's left of the term, rather than silently dropping the
                    // remainder.
                    let empty: Vec<O> = Vec::new();
                    return (Ok(Box::new(Some((empty, term)))), scope);
                }
            }
        }
    }
}

fn interrupt_error(scope: pullrt_scope::Token, cause: Option<Error>) -> Error {
    Error::Interrupted {
        scope,
        cause: cause.map(Arc::new),
        loop_count: 0,
    }
}

/// Rewrites an interrupt error for redelivery through the stream's installed error handler,
/// bumping its reentry counter; returns `Err` with a terminal error once `max_interrupt_depth` is
/// reached. Non-interrupt errors, and interrupts that don't target `current` or one of its
/// ancestors, pass through unchanged.
fn rewrite_interrupt(
    current: &Arc<CompileScope>,
    err: Error,
    max_depth: u32,
) -> std::result::Result<Error, Error> {
    match err {
        Error::Interrupted {
            scope,
            cause,
            loop_count,
        } if current.id() == scope || current.has_ancestor(scope) => {
            let next = loop_count + 1;
            let rewritten = Error::Interrupted {
                scope,
                cause,
                loop_count: next,
            };
            if next >= max_depth {
                Err(rewritten)
            } else {
                Ok(rewritten)
            }
        }
        other => Ok(other),
    }
}
