use crate::lang::symbols::{SymbolId, SymbolKind, SymbolTable, VOID};
use crate::lang::types::FullType;
use crate::lang::{CompileError, SemanticError};
use crate::x64::{Assembly, Instruction, Opcode, Operand, Reg, Size, SubroutineId};

/// Bytes of frame every value element occupies while it is live.
pub const SLOT: u32 = 8;

/// Where a live intermediate value can be found once the emitted code runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackValue {
    Integer { value: i64, ty: FullType },
    /// A `.data` label: a floating literal's storage, or a string's address.
    Constant { label: String, ty: FullType },
    /// Held in a register right now; its slot is written only on spill.
    Register { reg: Reg, ty: FullType },
    /// Written to its slot, extended to 64 bits for integers.
    Spilled { ty: FullType },
    Symbol { id: SymbolId, ty: FullType },
    /// The slot holds an address; `ty` is the type stored there.
    Reference { ty: FullType },
    Type(FullType),
    Name(String),
}

impl StackValue {
    pub fn ty(&self) -> Option<&FullType> {
        match self {
            StackValue::Integer { ty, .. }
            | StackValue::Constant { ty, .. }
            | StackValue::Register { ty, .. }
            | StackValue::Spilled { ty }
            | StackValue::Symbol { ty, .. }
            | StackValue::Reference { ty } => Some(ty),
            StackValue::Type(_) | StackValue::Name(_) => None,
        }
    }

    /// Logical size on the model. References count as the address.
    pub fn size(&self) -> u32 {
        match self {
            StackValue::Type(_) | StackValue::Name(_) => 0,
            _ => SLOT,
        }
    }

    pub fn describe(&self, table: &SymbolTable) -> String {
        match self {
            StackValue::Integer { value, .. } => format!("literal {value}"),
            StackValue::Constant { label, .. } => format!("constant {label}"),
            StackValue::Register { ty, .. } | StackValue::Spilled { ty } => {
                format!("temporary {}", ty.describe(table))
            }
            StackValue::Symbol { id, .. } => format!("'{}'", table.get(*id).name),
            StackValue::Reference { ty } => format!("reference to {}", ty.describe(table)),
            StackValue::Type(ty) => format!("type {}", ty.describe(table)),
            StackValue::Name(name) => format!("name '{name}'"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackEntry {
    pub value: StackValue,
    /// Home slot is `[rbp - offset]`; zero for zero-sized elements.
    pub offset: u32,
}

/// Instruction sink for one subroutine.
pub struct Emitter<'a> {
    pub asm: &'a mut Assembly,
    pub table: &'a SymbolTable,
    pub sub: SubroutineId,
    pub line: usize,
}

impl Emitter<'_> {
    pub fn emit(&mut self, inst: Instruction) {
        self.asm.emit(self.sub, inst);
    }

    pub fn op(&mut self, opcode: Opcode, dest: impl Into<Operand>, src: impl Into<Operand>) {
        self.emit(Instruction::binary(opcode, dest, src));
    }
}

/// Compile-time shadow of the run-time evaluation stack of one function.
#[derive(Debug, Clone, Default)]
pub struct StackModel {
    entries: Vec<StackEntry>,
    depth: u32,
    locals: u32,
    high_water: u32,
    outgoing: u32,
}

impl StackModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn high_water(&self) -> u32 {
        self.high_water
    }

    /// Bytes the function's prologue must reserve beyond the shadow space.
    pub fn frame_bytes(&self) -> u32 {
        self.high_water + self.outgoing
    }

    pub fn reset(&mut self) {
        *self = StackModel::default();
    }

    /// Drops every evaluation entry at a statement boundary.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.depth = 0;
    }

    pub fn reserve_local(&mut self, bytes: u32) -> i32 {
        self.locals += bytes.max(1).div_ceil(SLOT) * SLOT;
        self.high_water = self.high_water.max(self.locals + self.depth);
        -(self.locals as i32)
    }

    pub fn note_outgoing(&mut self, bytes: u32) {
        self.outgoing = self.outgoing.max(bytes);
    }

    pub fn peek(&self) -> Option<&StackEntry> {
        self.entries.last()
    }

    /// Entry `depth` places below the top; `peek_at(0)` is the top.
    pub fn peek_at(&self, depth: usize) -> Option<&StackEntry> {
        self.entries.len().checked_sub(depth + 1).map(|i| &self.entries[i])
    }

    /// Pushes a value, first spilling any value still held in a register.
    pub fn push(&mut self, em: &mut Emitter, value: StackValue) {
        self.spill_registers(em);
        let size = value.size();
        self.depth += size;
        self.high_water = self.high_water.max(self.locals + self.depth);
        let offset = if size == 0 { 0 } else { self.locals + self.depth };
        self.entries.push(StackEntry { value, offset });
    }

    pub fn push_register(&mut self, em: &mut Emitter, reg: Reg, ty: FullType) {
        self.push(em, StackValue::Register { reg, ty });
    }

    /// Records an address held in `reg` as a reference to a `ty` value.
    pub fn push_address(&mut self, em: &mut Emitter, reg: Reg, ty: FullType) {
        self.push(em, StackValue::Reference { ty });
        let offset = self.entries.last().map(|e| e.offset).unwrap_or_default();
        em.op(Opcode::Mov, slot(offset, Size::Qword), reg);
    }

    pub fn pop(&mut self) -> Option<StackEntry> {
        let entry = self.entries.pop()?;
        self.depth -= entry.value.size();
        Some(entry)
    }

    /// Writes the live register value, if any, to its home slot.
    pub fn spill_registers(&mut self, em: &mut Emitter) {
        for entry in &mut self.entries {
            if let StackValue::Register { reg, ty } = &entry.value {
                let home = slot(entry.offset, Size::Qword);
                if reg.is_float() {
                    let (mov, size) = float_move(ty, em.table);
                    em.op(mov, home.with_size(Some(size)), *reg);
                } else {
                    em.op(Opcode::Mov, home, *reg);
                }
                entry.value = StackValue::Spilled { ty: ty.clone() };
            }
        }
    }

    /// Pops the top value and materializes it in `reg`, converting between
    /// the integer and floating classes when `reg` requires it.
    pub fn take_into(&mut self, em: &mut Emitter, reg: Reg) -> Result<FullType, CompileError> {
        let entry = self.pop_value(em)?;
        let ty = entry.value.ty().cloned().unwrap_or_else(|| FullType::new(VOID));
        let width = if ty.is_float(em.table) { ty.size(em.table) } else { 8 };
        load(em, &entry, reg, width)?;
        Ok(ty)
    }

    /// Like `take_into`, converting the value to `target` along the way.
    pub fn take_as(
        &mut self,
        em: &mut Emitter,
        reg: Reg,
        target: &FullType,
    ) -> Result<FullType, CompileError> {
        let entry = self.pop_value(em)?;
        let ty = entry.value.ty().cloned().unwrap_or_else(|| target.clone());
        let width = if target.is_float(em.table) {
            target.size(em.table)
        } else if ty.is_float(em.table) {
            ty.size(em.table)
        } else {
            8
        };
        load(em, &entry, reg, width)?;
        Ok(ty)
    }

    /// Pops an assignable value and puts its address in `reg`.
    pub fn take_address(&mut self, em: &mut Emitter, reg: Reg) -> Result<FullType, CompileError> {
        let entry = self.pop_value(em)?;
        match &entry.value {
            StackValue::Symbol { id, ty } => {
                let location = symbol_operand(em.table, *id).with_size(None);
                em.op(Opcode::Lea, reg, location);
                Ok(ty.clone())
            }
            StackValue::Reference { ty } => {
                em.op(Opcode::Mov, reg, slot(entry.offset, Size::Qword));
                Ok(ty.clone())
            }
            other => Err(SemanticError::NotAssignable {
                what: other.describe(em.table),
                line: em.line,
            }
            .into()),
        }
    }

    pub fn pop_value(&mut self, em: &mut Emitter) -> Result<StackEntry, CompileError> {
        self.pop().ok_or_else(|| {
            crate::lang::SyntaxError::MissingOperand {
                op: "expression".into(),
                line: em.line,
            }
            .into()
        })
    }
}

pub fn slot(offset: u32, size: Size) -> Operand {
    Operand::mem(Reg::Rbp, -(offset as i32), size)
}

/// Memory operand of a variable, parameter or global.
pub fn symbol_operand(table: &SymbolTable, id: SymbolId) -> Operand {
    let sym = table.get(id);
    let size = Size::from_bytes(sym.ty.size(table));
    match sym.kind {
        SymbolKind::GlobalVariable => Operand::global(table.label(id), Some(size)),
        _ => Operand::mem(Reg::Rbp, sym.offset, size),
    }
}

/// `movss`/`movsd` and the matching width for a floating type.
pub fn float_move(ty: &FullType, table: &SymbolTable) -> (Opcode, Size) {
    if ty.size(table) == 4 {
        (Opcode::Movss, Size::Dword)
    } else {
        (Opcode::Movsd, Size::Qword)
    }
}

/// Loads an integer of type `ty` from `src`, extending it to 64 bits.
pub fn load_int(em: &mut Emitter, reg: Reg, src: Operand, ty: &FullType) {
    let bytes = ty.size(em.table);
    let unsigned = ty.is_unsigned(em.table);
    let size = Size::from_bytes(bytes);
    let src = src.with_size(Some(size));
    match (size, unsigned) {
        (Size::Qword, _) => em.op(Opcode::Mov, reg, src),
        (Size::Dword, false) => em.op(Opcode::Movsxd, reg, src),
        (Size::Dword, true) => em.op(Opcode::Mov, Operand::sized(reg, Size::Dword), src),
        (_, false) => em.op(Opcode::Movsx, reg, src),
        (_, true) => em.op(Opcode::Movzx, reg, src),
    }
}

/// Stores the low bytes of `reg` (or the float in it) as a `ty` value at `dest`.
pub fn store(em: &mut Emitter, dest: Operand, ty: &FullType, reg: Reg) {
    if ty.is_float(em.table) {
        let (mov, size) = float_move(ty, em.table);
        em.op(mov, dest.with_size(Some(size)), reg);
    } else {
        let size = Size::from_bytes(ty.size(em.table));
        em.op(Opcode::Mov, dest.with_size(Some(size)), Operand::sized(reg, size));
    }
}

/// Converts between float widths in place, or from an integer register.
fn int_to_float(em: &mut Emitter, xmm: Reg, int: Reg, width: u32) {
    let op = if width == 4 { Opcode::Cvtsi2ss } else { Opcode::Cvtsi2sd };
    em.op(op, xmm, int);
}

fn float_to_int(em: &mut Emitter, int: Reg, xmm: Reg, width: u32) {
    let op = if width == 4 { Opcode::Cvttss2si } else { Opcode::Cvttsd2si };
    em.op(op, int, xmm);
}

fn resize_float(em: &mut Emitter, xmm: Reg, from: u32, to: u32) {
    match (from, to) {
        (4, 8) => em.op(Opcode::Cvtss2sd, xmm, xmm),
        (8, 4) => em.op(Opcode::Cvtsd2ss, xmm, xmm),
        _ => {}
    }
}

/// Materializes `entry` into `reg`. `width` is the float width wanted when
/// `reg` is an SSE register, or the width of a float source being truncated.
fn load(em: &mut Emitter, entry: &StackEntry, reg: Reg, width: u32) -> Result<(), CompileError> {
    let ty = match entry.value.ty() {
        Some(ty) => ty.clone(),
        None => {
            return Err(SemanticError::TypeMismatch {
                expected: "a value".into(),
                found: entry.value.describe(em.table),
                line: em.line,
            }
            .into());
        }
    };
    let table = em.table;
    let is_float = ty.is_float(table);
    let float_width = ty.size(table);

    // a float source is first loaded into an SSE register
    let float_dst = if reg.is_float() { reg } else { Reg::Xmm4 };
    // an integer source headed for an SSE register goes through rax
    let int_dst = if reg.is_float() { Reg::Rax } else { reg };

    let load_float_from = |em: &mut Emitter, src: Operand| {
        let (mov, size) = float_move(&ty, table);
        em.op(mov, float_dst, src.with_size(Some(size)));
    };

    match &entry.value {
        StackValue::Integer { value, .. } => {
            em.op(Opcode::Mov, int_dst, *value);
        }
        StackValue::Constant { label, .. } => {
            if is_float {
                load_float_from(em, Operand::global(label.clone(), None));
            } else {
                em.op(Opcode::Lea, int_dst, Operand::global(label.clone(), None));
            }
        }
        StackValue::Register { reg: held, .. } => {
            if is_float {
                if *held != float_dst {
                    em.op(Opcode::Movaps, float_dst, *held);
                }
            } else if *held != int_dst {
                em.op(Opcode::Mov, int_dst, *held);
            }
        }
        StackValue::Spilled { .. } => {
            let home = slot(entry.offset, Size::Qword);
            if is_float {
                load_float_from(em, home);
            } else {
                em.op(Opcode::Mov, int_dst, home);
            }
        }
        StackValue::Symbol { id, .. } => {
            let location = symbol_operand(table, *id);
            if is_float {
                load_float_from(em, location);
            } else {
                load_int(em, int_dst, location, &ty);
            }
        }
        StackValue::Reference { .. } => {
            em.op(Opcode::Mov, Reg::R11, slot(entry.offset, Size::Qword));
            let location = Operand::mem(Reg::R11, 0, Size::Qword);
            if is_float {
                load_float_from(em, location);
            } else {
                load_int(em, int_dst, location, &ty);
            }
        }
        StackValue::Type(_) | StackValue::Name(_) => {}
    }

    match (is_float, reg.is_float()) {
        (true, true) => resize_float(em, reg, float_width, width),
        (true, false) => float_to_int(em, reg, float_dst, float_width),
        (false, true) => int_to_float(em, reg, int_dst, width),
        (false, false) => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x64::display::reg_name;

    fn body(asm: &Assembly, sub: SubroutineId) -> Vec<String> {
        asm.subroutine(sub)
            .body
            .iter()
            .map(|line| match line {
                crate::x64::builder::Line::Inst(inst) => inst.to_string(),
                crate::x64::builder::Line::Label(l) => format!("{l}:"),
            })
            .collect()
    }

    #[test]
    fn depth_is_conserved_and_high_water_is_monotonic() {
        let table = SymbolTable::new();
        let mut asm = Assembly::new();
        let sub = asm.enter_subroutine("f");
        let mut em = Emitter {
            asm: &mut asm,
            table: &table,
            sub,
            line: 1,
        };
        let int = FullType::new(table.primitive("int"));
        let mut model = StackModel::new();

        let mut high = 0;
        model.push(&mut em, StackValue::Integer { value: 1, ty: int.clone() });
        model.push_register(&mut em, Reg::Rax, int.clone());
        model.push(&mut em, StackValue::Type(int.clone()));
        assert_eq!(model.depth(), 16);
        assert!(model.high_water() >= high);
        high = model.high_water();

        model.pop();
        model.take_into(&mut em, Reg::Rcx).unwrap();
        assert_eq!(model.depth(), 8);
        assert!(model.high_water() >= high);

        model.take_into(&mut em, Reg::Rax).unwrap();
        assert_eq!(model.depth(), 0);
        assert_eq!(model.high_water(), 16);
    }

    #[test]
    fn pushing_spills_the_live_register() {
        let table = SymbolTable::new();
        let mut asm = Assembly::new();
        let sub = asm.enter_subroutine("f");
        let int = FullType::new(table.primitive("int"));
        let mut model = StackModel::new();
        {
            let mut em = Emitter {
                asm: &mut asm,
                table: &table,
                sub,
                line: 1,
            };
            model.push_register(&mut em, Reg::Rax, int.clone());
            model.push(&mut em, StackValue::Integer { value: 2, ty: int.clone() });
            assert!(matches!(
                model.peek_at(1).unwrap().value,
                StackValue::Spilled { .. }
            ));
            model.take_into(&mut em, Reg::Rcx).unwrap();
            model.take_into(&mut em, Reg::Rax).unwrap();
        }
        assert_eq!(
            body(&asm, sub),
            vec![
                "mov qword [rbp - 8], rax",
                "mov rcx, 2",
                "mov rax, qword [rbp - 8]",
            ]
        );
    }

    #[test]
    fn references_load_through_r11() {
        let table = SymbolTable::new();
        let mut asm = Assembly::new();
        let sub = asm.enter_subroutine("f");
        let ch = FullType::new(table.primitive("char"));
        let mut model = StackModel::new();
        {
            let mut em = Emitter {
                asm: &mut asm,
                table: &table,
                sub,
                line: 1,
            };
            model.push_address(&mut em, Reg::Rax, ch);
            model.take_into(&mut em, Reg::Rdx).unwrap();
        }
        assert_eq!(
            body(&asm, sub),
            vec![
                "mov qword [rbp - 8], rax",
                "mov r11, qword [rbp - 8]",
                "movsx rdx, byte [r11]",
            ]
        );
        assert_eq!(reg_name(Reg::R11, Size::Qword), "r11");
    }

    #[test]
    fn integer_literal_converts_into_sse_register() {
        let table = SymbolTable::new();
        let mut asm = Assembly::new();
        let sub = asm.enter_subroutine("f");
        let int = FullType::new(table.primitive("int"));
        let float = FullType::new(table.primitive("float"));
        let mut model = StackModel::new();
        {
            let mut em = Emitter {
                asm: &mut asm,
                table: &table,
                sub,
                line: 1,
            };
            model.push(&mut em, StackValue::Integer { value: 3, ty: int });
            model.take_as(&mut em, Reg::Xmm1, &float).unwrap();
        }
        assert_eq!(body(&asm, sub), vec!["mov rax, 3", "cvtsi2ss xmm1, rax"]);
    }

    #[test]
    fn locals_sit_below_the_frame_pointer() {
        let mut model = StackModel::new();
        assert_eq!(model.reserve_local(4), -8);
        assert_eq!(model.reserve_local(8), -16);
        model.note_outgoing(16);
        assert_eq!(model.frame_bytes(), 32);
    }

    #[test]
    fn empty_model_reports_missing_operand() {
        let table = SymbolTable::new();
        let mut asm = Assembly::new();
        let sub = asm.enter_subroutine("f");
        let mut em = Emitter {
            asm: &mut asm,
            table: &table,
            sub,
            line: 3,
        };
        let err = StackModel::new().take_into(&mut em, Reg::Rax).unwrap_err();
        assert_eq!(err.line(), Some(3));
    }
}
