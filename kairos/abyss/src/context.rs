//! Execution contexts and the context switch.
//!
//! A [`Context`] is the saved machine state of one kernel thread. A context
//! only makes progress while a processor is granted to it. [`switch`] grants
//! the processor of the calling context to another context and suspends the
//! caller until a processor is granted back to it. A context that was retired
//! while switched out must [`abandon`] itself.
pub use crate::hosted::context::{Context, ContextExit, abandon, exit_to, spawn, switch};
