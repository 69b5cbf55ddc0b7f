//! Context assembly
//!
//! [`ContextAssembler`] selects results under a token budget and
//! [`ContextRenderer`] turns the selection into sectioned text.

mod assembler;
mod render;

pub use assembler::{ContextAssembler, OptimizedContext, CONTEXT_HEADER};
pub use render::{ContextRenderer, ContextSource, RenderedContext};
