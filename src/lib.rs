//! quill: an embeddable, class-based scripting language.
//!
//! Source text flows through the [`lexer`] and scope-aware [`parser`] into a
//! tree-walking [`runtime::Interpreter`]. Programs run on threads owned by a
//! [`threads::ThreadManager`], which allows one main execution at a time and
//! funnels every failure through a single handler.

pub mod ast;
pub mod class;
pub mod diagnostics;
pub mod environment;
pub mod lexer;
pub mod native;
pub mod output;
pub mod parser;
pub mod repl;
pub mod runtime;
pub mod stdlib;
pub mod threads;
pub mod value;

pub use diagnostics::{CodeError, ErrorKind, QuillError, SourceSpan};
pub use native::{CallContext, NativeCallable, RegistrationError, Signature};
pub use output::{BufferSink, ErrorFormat, OutputSink, StdoutSink};
pub use repl::Repl;
pub use runtime::{Context, Interpreter, Runtime, RuntimeBuilder, RuntimeConfig};
pub use threads::{
    CancellationToken, FatalError, ManagerError, ProgramFuture, ProgramHandle, ProgramState,
    ThreadManager,
};
pub use value::{Value, ValueType};
