//! Pull-based stream compiler: an algebra of step requests (emit, acquire/release, open/close a
//! sub-scope, evaluate an effect, pull a nested stream) interpreted against the scope tree and
//! resource lifecycle provided by `pullrt_scope`.

mod algebra;
mod compile;
mod interp;
mod segment;

pub use algebra::{
    acquire, close_scope, emit, eval, get_scope, open_scope, release, run, uncons, Cont, Handler,
    Pull, Step,
};
pub use compile::{compile, compile_with, interrupt_root};
pub use segment::{Segment, SplitResult};

pub use pullrt_scope::{CompileScope, Error, ExecArgs, Finalizer, Lease, Result, ScopeLease, Token};
