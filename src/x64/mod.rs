pub mod builder;
pub mod display;
pub mod instruction;

pub use builder::{Assembly, Ending, Section, SubroutineId};
pub use instruction::{Instruction, Opcode, Operand, Reg, Size};
