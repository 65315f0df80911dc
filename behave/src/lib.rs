mod codec;
mod compiler;
mod disasm;
mod expr;
mod graph;
mod interpreter;
mod lanes;
mod memory;
mod node;
mod program;
mod query;
mod script;
mod trace;

pub use codec::DecodeError;
pub use compiler::*;
pub use disasm::*;
pub use expr::*;
pub use graph::*;
pub use interpreter::*;
pub use lanes::*;
pub(crate) use memory::align_up;
pub use memory::*;
pub use node::*;
pub use program::*;
pub use query::*;
pub use script::*;
pub use trace::*;
