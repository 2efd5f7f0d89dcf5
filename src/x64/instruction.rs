#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reg {
    Rax,
    Rcx,
    Rdx,
    Rsp,
    Rbp,
    R8,
    R9,
    R10,
    R11,
    Xmm0,
    Xmm1,
    Xmm2,
    Xmm3,
    Xmm4,
}

/// Integer argument registers, by argument position.
pub const INT_ARGS: [Reg; 4] = [Reg::Rcx, Reg::Rdx, Reg::R8, Reg::R9];
/// Floating-point argument registers, by argument position.
pub const FLOAT_ARGS: [Reg; 4] = [Reg::Xmm0, Reg::Xmm1, Reg::Xmm2, Reg::Xmm3];

/// Bytes the caller reserves above the outgoing arguments for register spills.
pub const SHADOW_SPACE: u32 = 32;

impl Reg {
    pub fn is_float(self) -> bool {
        matches!(
            self,
            Reg::Xmm0 | Reg::Xmm1 | Reg::Xmm2 | Reg::Xmm3 | Reg::Xmm4
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Size {
    Byte,
    Word,
    Dword,
    Qword,
}

impl Size {
    /// Operand width for a value of `bytes` bytes. Anything wider than 4 bytes is a qword.
    pub fn from_bytes(bytes: u32) -> Self {
        match bytes {
            0 | 1 => Size::Byte,
            2 => Size::Word,
            3 | 4 => Size::Dword,
            _ => Size::Qword,
        }
    }

    pub fn bytes(self) -> u32 {
        match self {
            Size::Byte => 1,
            Size::Word => 2,
            Size::Dword => 4,
            Size::Qword => 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Base {
    Reg(Reg),
    /// RIP-relative reference to a data label.
    Rel(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Reg(Reg, Size),
    Mem {
        base: Base,
        disp: i32,
        size: Option<Size>,
    },
    Imm(i64),
    Label(String),
}

impl Operand {
    pub fn reg(reg: Reg) -> Self {
        Operand::Reg(reg, Size::Qword)
    }

    pub fn sized(reg: Reg, size: Size) -> Self {
        Operand::Reg(reg, size)
    }

    pub fn mem(reg: Reg, disp: i32, size: Size) -> Self {
        Operand::Mem {
            base: Base::Reg(reg),
            disp,
            size: Some(size),
        }
    }

    pub fn global(label: impl Into<String>, size: Option<Size>) -> Self {
        Operand::Mem {
            base: Base::Rel(label.into()),
            disp: 0,
            size,
        }
    }

    /// The same memory location with a different access width.
    pub fn with_size(self, size: Option<Size>) -> Self {
        match self {
            Operand::Mem { base, disp, .. } => Operand::Mem { base, disp, size },
            other => other,
        }
    }
}

impl From<i64> for Operand {
    fn from(v: i64) -> Self {
        Self::Imm(v)
    }
}

impl From<Reg> for Operand {
    fn from(r: Reg) -> Self {
        Self::reg(r)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Mov,
    Movsx,
    Movsxd,
    Movzx,
    Lea,
    Add,
    Sub,
    Imul,
    Idiv,
    Div,
    Cqo,
    Xor,
    And,
    Or,
    Neg,
    Cmp,
    Test,
    Sete,
    Setne,
    Setl,
    Setle,
    Setg,
    Setge,
    Setb,
    Setbe,
    Seta,
    Setae,
    Jmp,
    Jnz,
    Call,
    Ret,
    Push,
    Pop,
    Movss,
    Movsd,
    Movaps,
    Addss,
    Addsd,
    Subss,
    Subsd,
    Mulss,
    Mulsd,
    Divss,
    Divsd,
    Comiss,
    Comisd,
    Cvtsi2ss,
    Cvtsi2sd,
    Cvttss2si,
    Cvttsd2si,
    Cvtss2sd,
    Cvtsd2ss,
    Xorps,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub opcode: Opcode,
    pub dest: Option<Operand>,
    pub src: Option<Operand>,
}

impl Instruction {
    pub fn bare(opcode: Opcode) -> Self {
        Instruction {
            opcode,
            dest: None,
            src: None,
        }
    }

    pub fn unary(opcode: Opcode, dest: impl Into<Operand>) -> Self {
        Instruction {
            opcode,
            dest: Some(dest.into()),
            src: None,
        }
    }

    pub fn binary(opcode: Opcode, dest: impl Into<Operand>, src: impl Into<Operand>) -> Self {
        Instruction {
            opcode,
            dest: Some(dest.into()),
            src: Some(src.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_follow_byte_widths() {
        assert_eq!(Size::from_bytes(1), Size::Byte);
        assert_eq!(Size::from_bytes(2), Size::Word);
        assert_eq!(Size::from_bytes(4), Size::Dword);
        assert_eq!(Size::from_bytes(8), Size::Qword);
        assert_eq!(Size::Qword.bytes(), 8);
    }

    #[test]
    fn builds_two_operand_instruction() {
        let inst = Instruction::binary(Opcode::Add, Reg::Rax, Reg::Rcx);
        assert_eq!(inst.opcode, Opcode::Add);
        assert!(matches!(inst.dest, Some(Operand::Reg(Reg::Rax, Size::Qword))));
        assert!(matches!(inst.src, Some(Operand::Reg(Reg::Rcx, Size::Qword))));
    }

    #[test]
    fn argument_registers_are_split_by_class() {
        assert!(INT_ARGS.iter().all(|r| !r.is_float()));
        assert!(FLOAT_ARGS.iter().all(|r| r.is_float()));
    }
}
