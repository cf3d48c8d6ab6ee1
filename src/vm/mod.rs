//! The interpreter tier: per-method descriptors, call-site caches, the
//! operand stack machine, exception dispatch and GC root reporting.
#[macro_use]
mod macros;
pub mod cache;
mod calls;
pub mod config;
pub mod emit;
pub mod error;
pub mod exceptions;
pub mod frame;
pub mod gc;
pub mod host;
mod instructions;
pub mod interpreter;
pub mod method;
pub mod metrics;
mod objects;
pub mod opcodes;
pub mod registry;
pub mod stack;
pub mod standalone;
pub mod tiering;
pub mod tracer;

pub use config::InterpreterConfig;
pub use emit::{ILBuilder, Label};
pub use error::{ExecResult, ManagedExceptionKind, Unwind, VmError};
pub use exceptions::{ClauseKind, ExceptionClause};
pub use gc::RootVisitor;
pub use host::{Host, MetadataResolver, ObjectModel};
pub use interpreter::{ArgBlock, Interpreter, ReturnValue};
pub use method::{GenericContext, LocalVar, MethodDefinition, MethodDescriptor, MethodHandle};
pub use metrics::{InterpreterMetrics, MetricsSnapshot};
pub use registry::MethodRegistry;
pub use standalone::StandaloneRuntime;
pub use tiering::{BackgroundTieringManager, RecordingTieringManager, TierCompiler, TieringManager};
