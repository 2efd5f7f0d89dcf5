use std::fmt;

use super::instruction::{Base, Instruction, Opcode, Operand, Reg, Size};

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Opcode::Mov => "mov",
            Opcode::Movsx => "movsx",
            Opcode::Movsxd => "movsxd",
            Opcode::Movzx => "movzx",
            Opcode::Lea => "lea",
            Opcode::Add => "add",
            Opcode::Sub => "sub",
            Opcode::Imul => "imul",
            Opcode::Idiv => "idiv",
            Opcode::Div => "div",
            Opcode::Cqo => "cqo",
            Opcode::Xor => "xor",
            Opcode::And => "and",
            Opcode::Or => "or",
            Opcode::Neg => "neg",
            Opcode::Cmp => "cmp",
            Opcode::Test => "test",
            Opcode::Sete => "sete",
            Opcode::Setne => "setne",
            Opcode::Setl => "setl",
            Opcode::Setle => "setle",
            Opcode::Setg => "setg",
            Opcode::Setge => "setge",
            Opcode::Setb => "setb",
            Opcode::Setbe => "setbe",
            Opcode::Seta => "seta",
            Opcode::Setae => "setae",
            Opcode::Jmp => "jmp",
            Opcode::Jnz => "jnz",
            Opcode::Call => "call",
            Opcode::Ret => "ret",
            Opcode::Push => "push",
            Opcode::Pop => "pop",
            Opcode::Movss => "movss",
            Opcode::Movsd => "movsd",
            Opcode::Movaps => "movaps",
            Opcode::Addss => "addss",
            Opcode::Addsd => "addsd",
            Opcode::Subss => "subss",
            Opcode::Subsd => "subsd",
            Opcode::Mulss => "mulss",
            Opcode::Mulsd => "mulsd",
            Opcode::Divss => "divss",
            Opcode::Divsd => "divsd",
            Opcode::Comiss => "comiss",
            Opcode::Comisd => "comisd",
            Opcode::Cvtsi2ss => "cvtsi2ss",
            Opcode::Cvtsi2sd => "cvtsi2sd",
            Opcode::Cvttss2si => "cvttss2si",
            Opcode::Cvttsd2si => "cvttsd2si",
            Opcode::Cvtss2sd => "cvtss2sd",
            Opcode::Cvtsd2ss => "cvtsd2ss",
            Opcode::Xorps => "xorps",
        };
        f.write_str(s)
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Size::Byte => "byte",
            Size::Word => "word",
            Size::Dword => "dword",
            Size::Qword => "qword",
        };
        f.write_str(s)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.opcode)?;
        if let Some(dest) = &self.dest {
            write!(f, " {}", fmt_operand(dest))?;
        }
        if let Some(src) = &self.src {
            write!(f, ", {}", fmt_operand(src))?;
        }
        Ok(())
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&fmt_operand(self))
    }
}

fn fmt_operand(op: &Operand) -> String {
    match op {
        Operand::Reg(reg, size) => reg_name(*reg, *size).to_string(),
        Operand::Imm(v) => v.to_string(),
        Operand::Label(name) => name.clone(),
        Operand::Mem { base, disp, size } => {
            let address = match base {
                Base::Reg(reg) => format_disp(reg_name(*reg, Size::Qword), *disp),
                Base::Rel(label) => format_disp(&format!("rel {label}"), *disp),
            };
            match size {
                Some(size) => format!("{size} {address}"),
                None => address,
            }
        }
    }
}

fn format_disp(base: &str, disp: i32) -> String {
    match disp {
        0 => format!("[{base}]"),
        d if d < 0 => format!("[{base} - {}]", -(d as i64)),
        d => format!("[{base} + {d}]"),
    }
}

/// NASM register name for the given access width. SSE registers ignore the width.
pub fn reg_name(reg: Reg, size: Size) -> &'static str {
    match (reg, size) {
        (Reg::Rax, Size::Qword) => "rax",
        (Reg::Rax, Size::Dword) => "eax",
        (Reg::Rax, Size::Word) => "ax",
        (Reg::Rax, Size::Byte) => "al",
        (Reg::Rcx, Size::Qword) => "rcx",
        (Reg::Rcx, Size::Dword) => "ecx",
        (Reg::Rcx, Size::Word) => "cx",
        (Reg::Rcx, Size::Byte) => "cl",
        (Reg::Rdx, Size::Qword) => "rdx",
        (Reg::Rdx, Size::Dword) => "edx",
        (Reg::Rdx, Size::Word) => "dx",
        (Reg::Rdx, Size::Byte) => "dl",
        (Reg::Rsp, Size::Qword) => "rsp",
        (Reg::Rsp, Size::Dword) => "esp",
        (Reg::Rsp, Size::Word) => "sp",
        (Reg::Rsp, Size::Byte) => "spl",
        (Reg::Rbp, Size::Qword) => "rbp",
        (Reg::Rbp, Size::Dword) => "ebp",
        (Reg::Rbp, Size::Word) => "bp",
        (Reg::Rbp, Size::Byte) => "bpl",
        (Reg::R8, Size::Qword) => "r8",
        (Reg::R8, Size::Dword) => "r8d",
        (Reg::R8, Size::Word) => "r8w",
        (Reg::R8, Size::Byte) => "r8b",
        (Reg::R9, Size::Qword) => "r9",
        (Reg::R9, Size::Dword) => "r9d",
        (Reg::R9, Size::Word) => "r9w",
        (Reg::R9, Size::Byte) => "r9b",
        (Reg::R10, Size::Qword) => "r10",
        (Reg::R10, Size::Dword) => "r10d",
        (Reg::R10, Size::Word) => "r10w",
        (Reg::R10, Size::Byte) => "r10b",
        (Reg::R11, Size::Qword) => "r11",
        (Reg::R11, Size::Dword) => "r11d",
        (Reg::R11, Size::Word) => "r11w",
        (Reg::R11, Size::Byte) => "r11b",
        (Reg::Xmm0, _) => "xmm0",
        (Reg::Xmm1, _) => "xmm1",
        (Reg::Xmm2, _) => "xmm2",
        (Reg::Xmm3, _) => "xmm3",
        (Reg::Xmm4, _) => "xmm4",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use insta::assert_snapshot;

    #[test]
    fn renders_register_widths() {
        assert_eq!(reg_name(Reg::Rax, Size::Dword), "eax");
        assert_eq!(reg_name(Reg::R8, Size::Byte), "r8b");
        assert_eq!(reg_name(Reg::Xmm1, Size::Dword), "xmm1");
    }

    #[test]
    fn renders_memory_operands() {
        let lines = [
            Instruction::binary(
                Opcode::Mov,
                Operand::mem(Reg::Rbp, -12, Size::Dword),
                Operand::sized(Reg::Rax, Size::Dword),
            ),
            Instruction::binary(Opcode::Mov, Reg::Rcx, Operand::mem(Reg::Rbp, 24, Size::Qword)),
            Instruction::binary(Opcode::Lea, Reg::Rax, Operand::global("message", None)),
            Instruction::binary(
                Opcode::Movsx,
                Reg::Rax,
                Operand::mem(Reg::R11, 0, Size::Byte),
            ),
            Instruction::unary(Opcode::Call, Operand::Label("HeapAlloc".into())),
            Instruction::bare(Opcode::Cqo),
        ]
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n");
        assert_snapshot!(lines, @r"
        mov dword [rbp - 12], eax
        mov rcx, qword [rbp + 24]
        lea rax, [rel message]
        movsx rax, byte [r11]
        call HeapAlloc
        cqo
        ");
    }
}
