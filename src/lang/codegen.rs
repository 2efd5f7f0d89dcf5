use crate::lang::constant::intern_string;
use crate::lang::expr::{CallTarget, OpKind, PostfixItem, call_result_type};
use crate::lang::stack::{Emitter, StackModel, StackValue, float_move, slot, store, symbol_operand};
use crate::lang::symbols::{SymbolId, SymbolKind, VOID, Visibility};
use crate::lang::types::{FullType, Qualifier};
use crate::lang::{CompileError, SemanticError, SyntaxError, UnimplementedError};
use crate::x64::builder::Ending;
use crate::x64::instruction::{FLOAT_ARGS, INT_ARGS, SHADOW_SPACE};
use crate::x64::{Assembly, Instruction, Opcode, Operand, Reg, Size};

pub const HEAP_HANDLE: &str = "__sable_heap_handle";
const HEAP_SLOT: &str = "__sable_heap";
/// HEAP_ZERO_MEMORY
const HEAP_FLAGS: i64 = 8;

/// Declares the heap externs and the cached-handle helper on first use.
pub fn ensure_heap(asm: &mut Assembly) {
    if asm.find(HEAP_HANDLE).is_some() {
        return;
    }
    asm.declare_external("GetProcessHeap");
    asm.declare_external("HeapAlloc");
    asm.declare_external("HeapFree");
    asm.write_bss(format!("{HEAP_SLOT} resq 1"));

    let helper = asm.enter_subroutine(HEAP_HANDLE);
    let cached = Operand::global(HEAP_SLOT, Some(Size::Qword));
    asm.emit(helper, Instruction::binary(Opcode::Mov, Reg::Rax, cached.clone()));
    asm.emit(helper, Instruction::binary(Opcode::Test, Reg::Rax, Reg::Rax));
    asm.emit(helper, Instruction::unary(Opcode::Jnz, Operand::Label(".cached".into())));
    asm.emit(helper, Instruction::unary(Opcode::Call, Operand::Label("GetProcessHeap".into())));
    asm.emit(helper, Instruction::binary(Opcode::Mov, cached, Reg::Rax));
    asm.emit_label(helper, ".cached");
    asm.set_ending(helper, Ending::Return);
}

fn call(em: &mut Emitter, label: &str) {
    em.emit(Instruction::unary(Opcode::Call, Operand::Label(label.to_string())));
}

/// Loads the process heap handle into `rcx`. Clobbers every volatile register.
fn heap_handle(em: &mut Emitter) {
    ensure_heap(em.asm);
    call(em, HEAP_HANDLE);
    em.op(Opcode::Mov, Reg::Rcx, Reg::Rax);
}

/// `HeapAlloc(rcx, HEAP_ZERO_MEMORY, r8)`; result in `rax`.
fn heap_alloc(em: &mut Emitter) {
    em.op(Opcode::Mov, Operand::sized(Reg::Rdx, Size::Dword), HEAP_FLAGS);
    call(em, "HeapAlloc");
}

/// Constructor entry: allocate the object and store it in `this`'s home slot.
pub fn allocate_this(em: &mut Emitter, size: Operand) {
    heap_handle(em);
    em.op(Opcode::Mov, Reg::R8, size);
    heap_alloc(em);
    em.op(Opcode::Mov, Operand::mem(Reg::Rbp, 16, Size::Qword), Reg::Rax);
}

/// Evaluates a postfix expression in function scope, leaving its value on the model.
pub fn evaluate(
    items: &[PostfixItem],
    model: &mut StackModel,
    em: &mut Emitter,
    scope: Option<SymbolId>,
) -> Result<Option<FullType>, CompileError> {
    let mut eval = Evaluator { model, scope };
    for item in items {
        eval.item(em, item)?;
    }
    Ok(eval.model.peek().and_then(|e| e.value.ty().cloned()))
}

/// `delete expr;` hands the pointer back to the process heap.
pub fn delete(
    items: &[PostfixItem],
    model: &mut StackModel,
    em: &mut Emitter,
    scope: Option<SymbolId>,
) -> Result<(), CompileError> {
    let ty = evaluate(items, model, em, scope)?.ok_or(SyntaxError::MissingOperand {
        op: "delete".into(),
        line: em.line,
    })?;
    if !ty.is_pointer() && !ty.is_aggregate(em.table) {
        return Err(SemanticError::NotPointer {
            what: ty.describe(em.table),
            line: em.line,
        }
        .into());
    }
    model.spill_registers(em);
    heap_handle(em);
    em.op(Opcode::Xor, Operand::sized(Reg::Rdx, Size::Dword), Operand::sized(Reg::Rdx, Size::Dword));
    model.take_into(em, Reg::R8)?;
    call(em, "HeapFree");
    Ok(())
}

struct Evaluator<'m> {
    model: &'m mut StackModel,
    scope: Option<SymbolId>,
}

impl Evaluator<'_> {
    fn item(&mut self, em: &mut Emitter, item: &PostfixItem) -> Result<(), CompileError> {
        match item {
            PostfixItem::Integer(value) => {
                let mut ty = FullType::new(em.table.primitive("int"));
                if i32::try_from(*value).is_err() {
                    ty.qualifiers.insert(Qualifier::Long);
                }
                self.model.push(em, StackValue::Integer { value: *value, ty });
            }
            PostfixItem::Float(text) => {
                let label = format!("__sable_f{}", em.asm.fresh());
                em.asm.write_data(format!("{label} dq {text}"));
                let ty = FullType::new(em.table.primitive("double"));
                self.model.push(em, StackValue::Constant { label, ty });
            }
            PostfixItem::Str(text) => {
                let label = intern_string(em.asm, text);
                let ty = FullType::new(em.table.primitive("char")).pointer_to();
                self.model.push(em, StackValue::Constant { label, ty });
            }
            PostfixItem::Symbol(id) => self.symbol(em, *id)?,
            PostfixItem::Type(ty) => self.model.push(em, StackValue::Type(ty.clone())),
            PostfixItem::Name(name) => self.model.push(em, StackValue::Name(name.clone())),
            PostfixItem::Operator(kind) => self.operator(em, *kind)?,
            PostfixItem::Call { target, argc } => self.call(em, *target, *argc)?,
            PostfixItem::FunctionMarker(_) | PostfixItem::CallEnd { .. } => {
                return Err(SyntaxError::MalformedArguments { line: em.line }.into());
            }
        }
        Ok(())
    }

    fn symbol(&mut self, em: &mut Emitter, id: SymbolId) -> Result<(), CompileError> {
        let sym = em.table.get(id);
        match sym.kind {
            SymbolKind::LocalVariable | SymbolKind::Parameter | SymbolKind::GlobalVariable => {
                let ty = sym.ty.clone();
                self.model.push(em, StackValue::Symbol { id, ty });
            }
            // namespace receivers are resolved by the `.` that follows
            SymbolKind::Namespace => {
                let ty = FullType::new(VOID);
                self.model.push(em, StackValue::Symbol { id, ty });
            }
            SymbolKind::StructField => {
                // a bare field inside a method reads through `this`
                let this = self.this(em)?;
                let ty = sym.ty.clone();
                let offset = sym.offset;
                self.model.spill_registers(em);
                em.op(Opcode::Mov, Reg::Rax, symbol_operand(em.table, this));
                if offset != 0 {
                    em.op(Opcode::Add, Reg::Rax, offset as i64);
                }
                self.model.push_address(em, Reg::Rax, ty);
            }
            _ => {
                return Err(SemanticError::TypeMismatch {
                    expected: "a value".into(),
                    found: format!("'{}'", sym.name),
                    line: em.line,
                }
                .into());
            }
        }
        Ok(())
    }

    fn this(&self, em: &Emitter) -> Result<SymbolId, CompileError> {
        em.table
            .lookup("this", self.scope)
            .filter(|id| em.table.get(*id).kind == SymbolKind::Parameter)
            .ok_or_else(|| {
                SemanticError::Undefined {
                    name: "this".into(),
                    line: em.line,
                }
                .into()
            })
    }

    fn peek_ty(&self, em: &Emitter, depth: usize) -> Result<FullType, CompileError> {
        let entry = self.model.peek_at(depth).ok_or(SyntaxError::MissingOperand {
            op: "expression".into(),
            line: em.line,
        })?;
        entry.value.ty().cloned().ok_or_else(|| {
            SemanticError::TypeMismatch {
                expected: "a value".into(),
                found: entry.value.describe(em.table),
                line: em.line,
            }
            .into()
        })
    }

    fn operator(&mut self, em: &mut Emitter, kind: OpKind) -> Result<(), CompileError> {
        match kind {
            OpKind::Add | OpKind::Sub | OpKind::Mul | OpKind::Div | OpKind::Mod => {
                self.arithmetic(em, kind)
            }
            OpKind::Eq | OpKind::Ne | OpKind::Lt | OpKind::Gt | OpKind::Le | OpKind::Ge => {
                self.compare(em, kind)
            }
            OpKind::And | OpKind::Or => self.logical(em, kind),
            OpKind::Assign => self.assign(em),
            OpKind::HeapAssign => self.heap_assign(em),
            OpKind::Cast => self.cast(em),
            OpKind::Negate => self.negate(em),
            OpKind::Not => {
                let ty = self.peek_ty(em, 0)?;
                self.require_scalar(em, &ty)?;
                self.model.take_into(em, Reg::Rax)?;
                em.op(Opcode::Test, Reg::Rax, Reg::Rax);
                self.set_bool(em, Opcode::Sete);
                Ok(())
            }
            OpKind::AddressOf => {
                let ty = self.model.take_address(em, Reg::Rax)?;
                self.model.push_register(em, Reg::Rax, ty.pointer_to());
                Ok(())
            }
            OpKind::Deref => {
                let ty = self.peek_ty(em, 0)?;
                let pointee = ty.deref().ok_or_else(|| SemanticError::NotPointer {
                    what: ty.describe(em.table),
                    line: em.line,
                })?;
                self.model.take_into(em, Reg::Rax)?;
                self.model.push_address(em, Reg::Rax, pointee);
                Ok(())
            }
            OpKind::Dot => self.member(em),
            OpKind::Subscript => self.subscript(em),
        }
    }

    fn require_scalar(&self, em: &Emitter, ty: &FullType) -> Result<(), CompileError> {
        if ty.is_integral(em.table) || ty.is_pointer() || ty.is_aggregate(em.table) {
            Ok(())
        } else {
            Err(SemanticError::TypeMismatch {
                expected: "integral or pointer value".into(),
                found: ty.describe(em.table),
                line: em.line,
            }
            .into())
        }
    }

    fn require_numeric(&self, em: &Emitter, ty: &FullType) -> Result<(), CompileError> {
        if ty.is_integral(em.table) || ty.is_float(em.table) {
            Ok(())
        } else {
            Err(SemanticError::TypeMismatch {
                expected: "numeric value".into(),
                found: ty.describe(em.table),
                line: em.line,
            }
            .into())
        }
    }

    /// Common floating type of two operands, if either is floating.
    fn float_result(&self, em: &Emitter, lhs: &FullType, rhs: &FullType) -> Option<FullType> {
        let table = em.table;
        if !lhs.is_float(table) && !rhs.is_float(table) {
            return None;
        }
        let wide = [lhs, rhs]
            .into_iter()
            .any(|t| t.is_float(table) && t.size(table) == 8);
        let name = if wide { "double" } else { "float" };
        Some(FullType::new(table.primitive(name)))
    }

    fn arithmetic(&mut self, em: &mut Emitter, kind: OpKind) -> Result<(), CompileError> {
        let rhs = self.peek_ty(em, 0)?;
        let lhs = self.peek_ty(em, 1)?;
        if lhs.is_pointer() || rhs.is_pointer() {
            return Err(UnimplementedError::PointerArithmetic { line: em.line }.into());
        }
        self.require_numeric(em, &lhs)?;
        self.require_numeric(em, &rhs)?;

        if let Some(ty) = self.float_result(em, &lhs, &rhs) {
            let double = ty.size(em.table) == 8;
            let opcode = match (kind, double) {
                (OpKind::Add, false) => Opcode::Addss,
                (OpKind::Add, true) => Opcode::Addsd,
                (OpKind::Sub, false) => Opcode::Subss,
                (OpKind::Sub, true) => Opcode::Subsd,
                (OpKind::Mul, false) => Opcode::Mulss,
                (OpKind::Mul, true) => Opcode::Mulsd,
                (OpKind::Div, false) => Opcode::Divss,
                (OpKind::Div, true) => Opcode::Divsd,
                _ => return Err(SemanticError::FloatRemainder { line: em.line }.into()),
            };
            self.model.take_as(em, Reg::Xmm1, &ty)?;
            self.model.take_as(em, Reg::Xmm0, &ty)?;
            em.op(opcode, Reg::Xmm0, Reg::Xmm1);
            self.model.push_register(em, Reg::Xmm0, ty);
            return Ok(());
        }

        let table = em.table;
        let unsigned = lhs.is_unsigned(table) || rhs.is_unsigned(table);
        let mut ty = if lhs.size(table) >= rhs.size(table) { lhs } else { rhs };
        if unsigned && !ty.is_unsigned(table) {
            ty.qualifiers.insert(Qualifier::Unsigned);
        }
        self.model.take_into(em, Reg::Rcx)?;
        self.model.take_into(em, Reg::Rax)?;
        match kind {
            OpKind::Add => em.op(Opcode::Add, Reg::Rax, Reg::Rcx),
            OpKind::Sub => em.op(Opcode::Sub, Reg::Rax, Reg::Rcx),
            OpKind::Mul => em.op(Opcode::Imul, Reg::Rax, Reg::Rcx),
            _ => {
                if unsigned {
                    let edx = Operand::sized(Reg::Rdx, Size::Dword);
                    em.op(Opcode::Xor, edx.clone(), edx);
                    em.emit(Instruction::unary(Opcode::Div, Reg::Rcx));
                } else {
                    em.emit(Instruction::bare(Opcode::Cqo));
                    em.emit(Instruction::unary(Opcode::Idiv, Reg::Rcx));
                }
                if kind == OpKind::Mod {
                    em.op(Opcode::Mov, Reg::Rax, Reg::Rdx);
                }
            }
        }
        self.model.push_register(em, Reg::Rax, ty);
        Ok(())
    }

    fn set_bool(&mut self, em: &mut Emitter, setcc: Opcode) {
        em.emit(Instruction::unary(setcc, Operand::sized(Reg::Rax, Size::Byte)));
        em.op(
            Opcode::Movzx,
            Operand::sized(Reg::Rax, Size::Dword),
            Operand::sized(Reg::Rax, Size::Byte),
        );
        let ty = FullType::new(em.table.primitive("bool"));
        self.model.push_register(em, Reg::Rax, ty);
    }

    fn compare(&mut self, em: &mut Emitter, kind: OpKind) -> Result<(), CompileError> {
        let rhs = self.peek_ty(em, 0)?;
        let lhs = self.peek_ty(em, 1)?;
        let unsigned_cc = |kind: OpKind| match kind {
            OpKind::Eq => Opcode::Sete,
            OpKind::Ne => Opcode::Setne,
            OpKind::Lt => Opcode::Setb,
            OpKind::Le => Opcode::Setbe,
            OpKind::Gt => Opcode::Seta,
            _ => Opcode::Setae,
        };

        if let Some(ty) = self.float_result(em, &lhs, &rhs) {
            self.require_numeric(em, &lhs)?;
            self.require_numeric(em, &rhs)?;
            let cmp = if ty.size(em.table) == 8 { Opcode::Comisd } else { Opcode::Comiss };
            self.model.take_as(em, Reg::Xmm1, &ty)?;
            self.model.take_as(em, Reg::Xmm0, &ty)?;
            em.op(cmp, Reg::Xmm0, Reg::Xmm1);
            self.set_bool(em, unsigned_cc(kind));
            return Ok(());
        }

        self.require_scalar(em, &lhs)?;
        self.require_scalar(em, &rhs)?;
        let unsigned = lhs.is_unsigned(em.table) || rhs.is_unsigned(em.table);
        let setcc = if unsigned {
            unsigned_cc(kind)
        } else {
            match kind {
                OpKind::Eq => Opcode::Sete,
                OpKind::Ne => Opcode::Setne,
                OpKind::Lt => Opcode::Setl,
                OpKind::Le => Opcode::Setle,
                OpKind::Gt => Opcode::Setg,
                _ => Opcode::Setge,
            }
        };
        self.model.take_into(em, Reg::Rcx)?;
        self.model.take_into(em, Reg::Rax)?;
        em.op(Opcode::Cmp, Reg::Rax, Reg::Rcx);
        self.set_bool(em, setcc);
        Ok(())
    }

    /// `&&` and `||` evaluate both operands.
    fn logical(&mut self, em: &mut Emitter, kind: OpKind) -> Result<(), CompileError> {
        let rhs = self.peek_ty(em, 0)?;
        let lhs = self.peek_ty(em, 1)?;
        self.require_scalar(em, &lhs)?;
        self.require_scalar(em, &rhs)?;
        self.model.take_into(em, Reg::Rcx)?;
        self.model.take_into(em, Reg::Rax)?;
        let al = Operand::sized(Reg::Rax, Size::Byte);
        let cl = Operand::sized(Reg::Rcx, Size::Byte);
        em.op(Opcode::Test, Reg::Rax, Reg::Rax);
        em.emit(Instruction::unary(Opcode::Setne, al.clone()));
        em.op(Opcode::Test, Reg::Rcx, Reg::Rcx);
        em.emit(Instruction::unary(Opcode::Setne, cl.clone()));
        let combine = if kind == OpKind::And { Opcode::And } else { Opcode::Or };
        em.op(combine, al.clone(), cl);
        em.op(Opcode::Movzx, Operand::sized(Reg::Rax, Size::Dword), al);
        let ty = FullType::new(em.table.primitive("bool"));
        self.model.push_register(em, Reg::Rax, ty);
        Ok(())
    }

    fn check_assignable(&self, em: &Emitter, dest: &FullType) -> Result<(), CompileError> {
        let entry = self.model.peek_at(0).ok_or(SyntaxError::MissingOperand {
            op: "=".into(),
            line: em.line,
        })?;
        let value = self.peek_ty(em, 0)?;
        let table = em.table;
        let literal = matches!(entry.value, StackValue::Integer { .. });
        let ok = if dest.is_void(table) {
            false
        } else if dest.is_pointer() || dest.is_aggregate(table) {
            value.is_pointer() || value.same_as(dest) || literal
        } else {
            value.is_integral(table) || value.is_float(table)
        };
        if ok {
            Ok(())
        } else {
            Err(SemanticError::TypeMismatch {
                expected: dest.describe(table),
                found: value.describe(table),
                line: em.line,
            }
            .into())
        }
    }

    /// Stores the top value into the element below it and re-pushes it.
    fn assign(&mut self, em: &mut Emitter) -> Result<(), CompileError> {
        let dest_entry = self.model.peek_at(1).ok_or(SyntaxError::MissingOperand {
            op: "=".into(),
            line: em.line,
        })?;
        let dest = match &dest_entry.value {
            StackValue::Symbol { id, ty } if em.table.get(*id).kind != SymbolKind::Namespace => {
                ty.clone()
            }
            StackValue::Reference { ty } => ty.clone(),
            other => {
                return Err(SemanticError::NotAssignable {
                    what: other.describe(em.table),
                    line: em.line,
                }
                .into());
            }
        };
        self.check_assignable(em, &dest)?;

        let reg = if dest.is_float(em.table) { Reg::Xmm0 } else { Reg::Rax };
        self.model.take_as(em, reg, &dest)?;
        let entry = self.model.pop_value(em)?;
        let target = match entry.value {
            StackValue::Reference { .. } => {
                em.op(Opcode::Mov, Reg::R10, slot(entry.offset, Size::Qword));
                Operand::mem(Reg::R10, 0, Size::Qword)
            }
            StackValue::Symbol { id, .. } => symbol_operand(em.table, id),
            other => {
                return Err(SemanticError::NotAssignable {
                    what: other.describe(em.table),
                    line: em.line,
                }
                .into());
            }
        };
        store(em, target, &dest, reg);
        self.model.push_register(em, reg, dest);
        Ok(())
    }

    /// `p ~= n` allocates `n` elements of `p`'s pointee (or one object block).
    fn heap_assign(&mut self, em: &mut Emitter) -> Result<(), CompileError> {
        let count_ty = self.peek_ty(em, 0)?;
        if !count_ty.is_integral(em.table) {
            return Err(SemanticError::TypeMismatch {
                expected: "integral element count".into(),
                found: count_ty.describe(em.table),
                line: em.line,
            }
            .into());
        }
        let dest = self.peek_ty(em, 1)?;
        let element = if let Some(pointee) = dest.deref() {
            pointee.size(em.table)
        } else if dest.is_aggregate(em.table) {
            em.table
                .get(dest.base)
                .type_info()
                .map(|t| t.size)
                .unwrap_or_default()
        } else {
            return Err(SemanticError::NotPointer {
                what: dest.describe(em.table),
                line: em.line,
            }
            .into());
        };

        self.model.spill_registers(em);
        heap_handle(em);
        self.model.take_into(em, Reg::R8)?;
        if element != 1 {
            em.op(Opcode::Mov, Reg::Rax, element.max(1) as i64);
            em.op(Opcode::Imul, Reg::R8, Reg::Rax);
        }
        heap_alloc(em);

        let entry = self.model.pop_value(em)?;
        match entry.value {
            StackValue::Symbol { id, .. } if em.table.get(id).kind != SymbolKind::Namespace => {
                let home = symbol_operand(em.table, id).with_size(Some(Size::Qword));
                em.op(Opcode::Mov, home, Reg::Rax);
            }
            StackValue::Reference { .. } => {
                em.op(Opcode::Mov, Reg::R10, slot(entry.offset, Size::Qword));
                em.op(Opcode::Mov, Operand::mem(Reg::R10, 0, Size::Qword), Reg::Rax);
            }
            other => {
                return Err(SemanticError::NotAssignable {
                    what: other.describe(em.table),
                    line: em.line,
                }
                .into());
            }
        }
        self.model.push_register(em, Reg::Rax, dest);
        Ok(())
    }

    fn cast(&mut self, em: &mut Emitter) -> Result<(), CompileError> {
        let target = match self.model.pop_value(em)?.value {
            StackValue::Type(ty) => ty,
            other => {
                return Err(SemanticError::TypeMismatch {
                    expected: "a type after '=>'".into(),
                    found: other.describe(em.table),
                    line: em.line,
                }
                .into());
            }
        };
        let table = em.table;
        if target.is_aggregate(table) {
            return Err(UnimplementedError::ObjectCast {
                ty: target.describe(table),
                line: em.line,
            }
            .into());
        }
        if target.is_void(table) {
            return Err(SemanticError::TypeMismatch {
                expected: "a value type".into(),
                found: "void".into(),
                line: em.line,
            }
            .into());
        }
        let source = self.peek_ty(em, 0)?;
        if source.is_aggregate(table) && !target.is_pointer() {
            return Err(UnimplementedError::ObjectCast {
                ty: source.describe(table),
                line: em.line,
            }
            .into());
        }

        if target.is_float(table) {
            self.model.take_as(em, Reg::Xmm0, &target)?;
            self.model.push_register(em, Reg::Xmm0, target);
            return Ok(());
        }

        self.model.take_as(em, Reg::Rax, &target)?;
        let size = Size::from_bytes(target.size(table));
        let unsigned = target.is_unsigned(table);
        match (size, unsigned) {
            (Size::Qword, _) => {}
            (Size::Dword, false) => em.op(Opcode::Movsxd, Reg::Rax, Operand::sized(Reg::Rax, Size::Dword)),
            (Size::Dword, true) => em.op(
                Opcode::Mov,
                Operand::sized(Reg::Rax, Size::Dword),
                Operand::sized(Reg::Rax, Size::Dword),
            ),
            (narrow, false) => em.op(Opcode::Movsx, Reg::Rax, Operand::sized(Reg::Rax, narrow)),
            (narrow, true) => em.op(Opcode::Movzx, Reg::Rax, Operand::sized(Reg::Rax, narrow)),
        }
        self.model.push_register(em, Reg::Rax, target);
        Ok(())
    }

    fn negate(&mut self, em: &mut Emitter) -> Result<(), CompileError> {
        let ty = self.peek_ty(em, 0)?;
        self.require_numeric(em, &ty)?;
        if ty.is_float(em.table) {
            let sub = if ty.size(em.table) == 8 { Opcode::Subsd } else { Opcode::Subss };
            self.model.take_into(em, Reg::Xmm1)?;
            em.op(Opcode::Xorps, Reg::Xmm0, Reg::Xmm0);
            em.op(sub, Reg::Xmm0, Reg::Xmm1);
            self.model.push_register(em, Reg::Xmm0, ty);
        } else {
            self.model.take_into(em, Reg::Rax)?;
            em.emit(Instruction::unary(Opcode::Neg, Reg::Rax));
            self.model.push_register(em, Reg::Rax, ty);
        }
        Ok(())
    }

    /// `base[index]` leaves a reference to the indexed element.
    fn subscript(&mut self, em: &mut Emitter) -> Result<(), CompileError> {
        let index = self.peek_ty(em, 0)?;
        let base = self.peek_ty(em, 1)?;
        if !index.is_integral(em.table) {
            return Err(SemanticError::TypeMismatch {
                expected: "integral index".into(),
                found: index.describe(em.table),
                line: em.line,
            }
            .into());
        }
        let element = base.deref().ok_or_else(|| SemanticError::NotPointer {
            what: base.describe(em.table),
            line: em.line,
        })?;
        let size = element.size(em.table);
        self.model.take_into(em, Reg::Rcx)?;
        self.model.take_into(em, Reg::Rax)?;
        if size != 1 {
            em.op(Opcode::Mov, Reg::Rdx, size as i64);
            em.op(Opcode::Imul, Reg::Rcx, Reg::Rdx);
        }
        em.op(Opcode::Add, Reg::Rax, Reg::Rcx);
        self.model.push_address(em, Reg::Rax, element);
        Ok(())
    }

    /// `lhs.name`: a field reference, or a namespace member.
    fn member(&mut self, em: &mut Emitter) -> Result<(), CompileError> {
        let name = match self.model.pop_value(em)?.value {
            StackValue::Name(name) => name,
            other => {
                return Err(SyntaxError::Expected {
                    expected: "member name".into(),
                    found: other.describe(em.table),
                    line: em.line,
                }
                .into());
            }
        };
        let table = em.table;

        if let Some(StackValue::Symbol { id, .. }) = self.model.peek().map(|e| &e.value)
            && table.get(*id).kind == SymbolKind::Namespace
        {
            let ns = *id;
            let member = table
                .lookup_immediate(&name, Some(ns))
                .ok_or_else(|| SemanticError::UnknownMember {
                    ty: table.get(ns).name.clone(),
                    member: name.clone(),
                    line: em.line,
                })?;
            self.model.pop();
            return self.symbol(em, member);
        }

        let ty = self.peek_ty(em, 0)?;
        let field = (ty.is_aggregate(table))
            .then(|| table.member(ty.base, &name))
            .flatten()
            .filter(|id| table.get(*id).kind == SymbolKind::StructField)
            .ok_or_else(|| SemanticError::UnknownMember {
                ty: ty.describe(table),
                member: name.clone(),
                line: em.line,
            })?;
        let field_sym = table.get(field);
        if field_sym.visibility != Visibility::Public
            && table.enclosing_type(self.scope) != Some(ty.base)
        {
            return Err(SemanticError::PrivateMember {
                ty: ty.describe(table),
                member: name,
                line: em.line,
            }
            .into());
        }
        let offset = field_sym.offset;
        let field_ty = field_sym.ty.clone();
        self.model.take_into(em, Reg::Rax)?;
        if offset != 0 {
            em.op(Opcode::Add, Reg::Rax, offset as i64);
        }
        self.model.push_address(em, Reg::Rax, field_ty);
        Ok(())
    }

    fn call(&mut self, em: &mut Emitter, target: CallTarget, argc: usize) -> Result<(), CompileError> {
        if let CallTarget::Construct(ty) = target {
            return self.construct(em, ty, argc);
        }
        let table = em.table;
        let callee = match target {
            CallTarget::Function(id)
            | CallTarget::Method { id, .. }
            | CallTarget::Constructor(id)
            | CallTarget::Construct(id) => id,
        };
        let sym = table.get(callee);
        let params: Vec<FullType> = sym
            .function_info()
            .map(|info| info.params.iter().map(|p| table.get(*p).ty.clone()).collect())
            .unwrap_or_default();
        // constructors fill their own `this`, but its home slot is still position 0
        let shift = usize::from(matches!(
            target,
            CallTarget::Method { .. } | CallTarget::Constructor(_)
        ));

        self.model.spill_registers(em);
        let positions = argc + shift;
        if positions > 4 {
            self.model.note_outgoing(8 * (positions as u32 - 4));
        }

        for i in (0..argc).rev() {
            let natural = self.peek_ty(em, 0)?;
            let want = params.get(i).cloned().unwrap_or(natural);
            let float = want.is_float(table);
            let position = i + shift;
            if position < 4 {
                let reg = if float { FLOAT_ARGS[position] } else { INT_ARGS[position] };
                self.model.take_as(em, reg, &want)?;
            } else {
                let reg = if float { Reg::Xmm0 } else { Reg::Rax };
                self.model.take_as(em, reg, &want)?;
                let home = Operand::mem(Reg::Rsp, (SHADOW_SPACE + 8 * (position as u32 - 4)) as i32, Size::Qword);
                if float {
                    let (mov, size) = float_move(&want, table);
                    em.op(mov, home.with_size(Some(size)), reg);
                } else {
                    em.op(Opcode::Mov, home, reg);
                }
            }
        }

        if let CallTarget::Method { implicit_this, .. } = target {
            if implicit_this {
                let this = self.this(em)?;
                em.op(Opcode::Mov, Reg::Rcx, symbol_operand(table, this));
            } else {
                self.model.take_into(em, Reg::Rcx)?;
            }
        }

        call(em, &table.label(callee));

        let ret = call_result_type(&target, table);
        if !ret.is_void(table) {
            let reg = if ret.is_float(table) { Reg::Xmm0 } else { Reg::Rax };
            self.model.push_register(em, reg, ret);
        }
        Ok(())
    }

    /// Implicit construction: allocate the block and store each argument in its field.
    fn construct(&mut self, em: &mut Emitter, ty: SymbolId, argc: usize) -> Result<(), CompileError> {
        let table = em.table;
        let info = table.get(ty).type_info().cloned().unwrap_or_default();
        self.model.spill_registers(em);
        heap_handle(em);
        em.op(Opcode::Mov, Reg::R8, info.size.max(1) as i64);
        heap_alloc(em);
        em.op(Opcode::Mov, Reg::R10, Reg::Rax);
        for i in (0..argc).rev() {
            let Some(field) = info.fields.get(i) else {
                return Err(SemanticError::ArityMismatch {
                    name: table.get(ty).name.clone(),
                    expected: info.fields.len(),
                    found: argc,
                    line: em.line,
                }
                .into());
            };
            let field = table.get(*field);
            let reg = if field.ty.is_float(table) { Reg::Xmm1 } else { Reg::Rcx };
            self.model.take_as(em, reg, &field.ty)?;
            store(em, Operand::mem(Reg::R10, field.offset, Size::Qword), &field.ty, reg);
        }
        em.op(Opcode::Mov, Reg::Rax, Reg::R10);
        self.model.push_register(em, Reg::Rax, FullType::new(ty));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::expr::parse_expression;
    use crate::lang::symbols::{Symbol, SymbolTable};
    use crate::lang::tokenizer::tokenize;
    use crate::x64::builder::Line;
    use insta::assert_snapshot;

    fn local(table: &mut SymbolTable, name: &str, ty: FullType, offset: i32) -> SymbolId {
        let mut sym = Symbol::new(name, ty, SymbolKind::LocalVariable, None);
        sym.offset = offset;
        table.insert(sym).unwrap()
    }

    fn run(table: &SymbolTable, src: &str) -> Result<String, CompileError> {
        let mut asm = Assembly::new();
        let sub = asm.enter_subroutine("f");
        let mut model = StackModel::new();
        model.reserve_local(32);
        let mut tokens = tokenize(src).unwrap();
        tokens.pop();
        let items = parse_expression(&tokens, table, None)?;
        {
            let mut em = Emitter {
                asm: &mut asm,
                table,
                sub,
                line: 1,
            };
            evaluate(&items, &mut model, &mut em, None)?;
        }
        Ok(asm
            .subroutine(sub)
            .body
            .iter()
            .map(|l| match l {
                Line::Inst(i) => i.to_string(),
                Line::Label(l) => format!("{l}:"),
            })
            .collect::<Vec<_>>()
            .join("\n"))
    }

    fn table_with_locals() -> SymbolTable {
        let mut table = SymbolTable::new();
        let int = FullType::new(table.primitive("int"));
        let double = FullType::new(table.primitive("double"));
        let ptr = FullType::new(table.primitive("char")).pointer_to();
        local(&mut table, "a", int.clone(), -8);
        local(&mut table, "b", int, -16);
        local(&mut table, "d", double, -24);
        local(&mut table, "p", ptr, -32);
        table
    }

    #[test]
    fn integer_assignment_of_sum() {
        let table = table_with_locals();
        assert_snapshot!(run(&table, "a = b + 2").unwrap(), @r"
        mov rcx, 2
        movsxd rax, dword [rbp - 16]
        add rax, rcx
        mov dword [rbp - 8], eax
        ");
    }

    #[test]
    fn mixed_arithmetic_promotes_to_double() {
        let table = table_with_locals();
        assert_snapshot!(run(&table, "d * a").unwrap(), @r"
        movsxd rax, dword [rbp - 8]
        cvtsi2sd xmm1, rax
        movsd xmm0, qword [rbp - 24]
        mulsd xmm0, xmm1
        ");
    }

    #[test]
    fn signed_remainder_takes_rdx() {
        let table = table_with_locals();
        let text = run(&table, "a % b").unwrap();
        assert!(text.contains("cqo\nidiv rcx\nmov rax, rdx"));
    }

    #[test]
    fn comparison_produces_bool() {
        let table = table_with_locals();
        let text = run(&table, "a < b").unwrap();
        assert!(text.ends_with("cmp rax, rcx\nsetl al\nmovzx eax, al"));
    }

    #[test]
    fn subscript_scales_and_references() {
        let table = table_with_locals();
        assert_snapshot!(run(&table, "a = p[b]").unwrap(), @r"
        movsxd rcx, dword [rbp - 16]
        mov rax, qword [rbp - 32]
        add rax, rcx
        mov qword [rbp - 48], rax
        mov r11, qword [rbp - 48]
        movsx rax, byte [r11]
        mov dword [rbp - 8], eax
        ");
    }

    #[test]
    fn pointer_arithmetic_is_unimplemented() {
        let table = table_with_locals();
        let err = run(&table, "p + 1").unwrap_err();
        assert!(matches!(
            err,
            CompileError::Unimplemented(UnimplementedError::PointerArithmetic { .. })
        ));
    }

    #[test]
    fn float_remainder_is_rejected() {
        let table = table_with_locals();
        let err = run(&table, "d % a").unwrap_err();
        assert!(matches!(
            err,
            CompileError::Semantic(SemanticError::FloatRemainder { .. })
        ));
    }

    #[test]
    fn literal_is_not_assignable() {
        let table = table_with_locals();
        let err = run(&table, "3 = a").unwrap_err();
        assert!(matches!(
            err,
            CompileError::Semantic(SemanticError::NotAssignable { .. })
        ));
    }

    #[test]
    fn cast_double_to_char_truncates() {
        let table = table_with_locals();
        let text = run(&table, "d => char").unwrap();
        assert_eq!(
            text,
            "movsd xmm4, qword [rbp - 24]\ncvttsd2si rax, xmm4\nmovsx rax, al"
        );
    }

    #[test]
    fn address_of_and_deref() {
        let table = table_with_locals();
        let text = run(&table, "*(&a) = 1").unwrap();
        assert!(text.starts_with("lea rax, [rbp - 8]"));
        assert!(text.contains("mov dword [r10], eax"));
    }

    #[test]
    fn heap_helper_is_declared_once() {
        let mut asm = Assembly::new();
        ensure_heap(&mut asm);
        ensure_heap(&mut asm);
        assert_eq!(asm.externs().len(), 3);
        assert_eq!(asm.bss(), &["__sable_heap resq 1".to_string()]);
        assert_eq!(asm.subroutines().len(), 1);
    }
}
