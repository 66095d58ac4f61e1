//! The interpreter's entry point: compiles a [`Pull`] term into a final result, guaranteeing the
//! root scope is closed on every path.

use std::sync::Arc;

use pullrt_scope::{CompileScope, Error, ExecArgs, Result};

use crate::algebra::Pull;
use crate::interp;

/// Runs `stream` to completion, folding every emitted value into `init` with `g`, against a fresh
/// root scope. The root is always closed before returning — on success *and* on failure — and any
/// close error is composited with whatever error the fold itself produced.
pub async fn compile<O, B>(
    stream: Pull<O, B>,
    init: B,
    g: impl FnMut(&mut B, O) -> Result<()>,
) -> Result<B>
where
    O: Send + 'static,
    B: Send + 'static,
{
    compile_with(stream, init, g, &ExecArgs::default(), false).await
}

/// Like [`compile`], but lets the caller pick [`ExecArgs`] and whether the root scope itself is
/// interruptible.
pub async fn compile_with<O, B>(
    stream: Pull<O, B>,
    init: B,
    g: impl FnMut(&mut B, O) -> Result<()>,
    args: &ExecArgs,
    root_interruptible: bool,
) -> Result<B>
where
    O: Send + 'static,
    B: Send + 'static,
{
    let root = CompileScope::root(root_interruptible);
    let fold_result = interp::fold(stream, root.clone(), init, g, args).await;
    let close_result = root.close();
    match (fold_result, close_result) {
        (Ok(b), Ok(())) => Ok(b),
        (Ok(_), Err(close_err)) => Err(close_err),
        (Err(fold_err), Ok(())) => Err(fold_err),
        (Err(fold_err), Err(close_err)) => {
            Err(Error::composite(vec![fold_err, close_err]).expect("two errors present"))
        }
    }
}

/// Returns a handle to `root`'s interrupt context by interrupting it with `cause` — convenience
/// used by callers that kick off a separately-spawned compile and want to cut it short.
pub fn interrupt_root(root: &Arc<CompileScope>, cause: Option<Error>) {
    root.interrupt(cause);
}
