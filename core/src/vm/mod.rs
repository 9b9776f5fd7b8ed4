pub mod bytecode;
pub mod decode;
mod dispatch;
pub mod fault;
pub mod frame;
pub mod function;
#[allow(clippy::module_inception)]
mod vm;

pub use bytecode::{ArgKind, CodeUnit, Const, Opcode, RawInstr};
pub use decode::{Decoded, Operand, decode_at};
pub use fault::{FaultKind, VmFault};
pub use frame::{Block, BlockKind, Frame};
pub use function::{FunctionValue, bind_arguments};
pub use vm::{Signal, Vm};
