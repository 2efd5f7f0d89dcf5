use crate::lang::expr::{OpKind, PostfixItem, target_symbol};
use crate::lang::symbols::{SymbolId, SymbolKind, SymbolTable};
use crate::lang::{CompileError, SemanticError};
use crate::x64::Assembly;

/// A value known at compile time.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstValue {
    Int(i64),
    /// Kept as text so literals reach the data section unchanged.
    Float(String),
    Str(String),
}

impl ConstValue {
    fn as_text(&self) -> String {
        match self {
            ConstValue::Int(v) => v.to_string(),
            ConstValue::Float(text) | ConstValue::Str(text) => text.clone(),
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            ConstValue::Int(v) => Some(*v as f64),
            ConstValue::Float(text) => text.parse().ok(),
            ConstValue::Str(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Slot {
    Value(ConstValue),
    Target(SymbolId),
}

/// Renders a float so the assembler reads it as floating point.
pub fn float_text(value: f64) -> String {
    let text = format!("{value}");
    if text.contains(['.', 'e', 'E', 'i', 'N']) {
        text
    } else {
        format!("{text}.0")
    }
}

/// NASM backquoted string with C-style escapes.
pub fn nasm_string(value: &str) -> String {
    let mut out = String::from("`");
    for ch in value.chars() {
        match ch {
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\0' => out.push_str("\\0"),
            '\\' => out.push_str("\\\\"),
            '`' => out.push_str("\\`"),
            other => out.push(other),
        }
    }
    out.push('`');
    out
}

/// Writes a string literal to `.data` and returns its label.
pub fn intern_string(asm: &mut Assembly, value: &str) -> String {
    let label = format!("__sable_s{}", asm.fresh());
    asm.write_data(format!("{label} db {}, 0", nasm_string(value)));
    label
}

pub fn add(lhs: ConstValue, rhs: ConstValue) -> ConstValue {
    match (lhs, rhs) {
        (ConstValue::Int(a), ConstValue::Int(b)) => ConstValue::Int(a.wrapping_add(b)),
        (ConstValue::Str(a), b) => ConstValue::Str(a + &b.as_text()),
        (a, ConstValue::Str(b)) => ConstValue::Str(a.as_text() + &b),
        (a, b) => {
            let sum = a.as_f64().unwrap_or_default() + b.as_f64().unwrap_or_default();
            ConstValue::Float(float_text(sum))
        }
    }
}

/// Folds a global initializer and writes the resulting data definition.
///
/// Only `+` and `=` are available; anything that would need code at run
/// time is rejected.
pub fn fold_global(
    items: &[PostfixItem],
    table: &SymbolTable,
    asm: &mut Assembly,
    line: usize,
) -> Result<Option<ConstValue>, CompileError> {
    let mut stack: Vec<Slot> = Vec::new();

    for item in items {
        match item {
            PostfixItem::Integer(v) => stack.push(Slot::Value(ConstValue::Int(*v))),
            PostfixItem::Float(text) => stack.push(Slot::Value(ConstValue::Float(text.clone()))),
            PostfixItem::Str(text) => stack.push(Slot::Value(ConstValue::Str(text.clone()))),
            PostfixItem::Symbol(id) => match table.get(*id).kind {
                SymbolKind::GlobalVariable => stack.push(Slot::Target(*id)),
                _ => {
                    return Err(SemanticError::NonConstant {
                        name: table.get(*id).name.clone(),
                        line,
                    }
                    .into());
                }
            },
            PostfixItem::Operator(OpKind::Add) => {
                let rhs = value(stack.pop(), table, line)?;
                let lhs = value(stack.pop(), table, line)?;
                stack.push(Slot::Value(add(lhs, rhs)));
            }
            PostfixItem::Operator(OpKind::Assign) => {
                let rhs = value(stack.pop(), table, line)?;
                let Some(Slot::Target(id)) = stack.pop() else {
                    return Err(SemanticError::NotAssignable {
                        what: "constant".into(),
                        line,
                    }
                    .into());
                };
                define(table, asm, id, &rhs, line)?;
                stack.push(Slot::Value(rhs));
            }
            PostfixItem::Operator(kind) => {
                return Err(SemanticError::NonConstantOperator {
                    op: kind.text().to_string(),
                    line,
                }
                .into());
            }
            PostfixItem::Call { target, .. } | PostfixItem::FunctionMarker(target) => {
                return Err(SemanticError::NonConstant {
                    name: table.get(target_symbol(target)).name.clone(),
                    line,
                }
                .into());
            }
            PostfixItem::Type(_) | PostfixItem::Name(_) | PostfixItem::CallEnd { .. } => {
                return Err(SemanticError::NonConstantOperator {
                    op: "=>".into(),
                    line,
                }
                .into());
            }
        }
    }

    match stack.pop() {
        Some(Slot::Value(v)) => Ok(Some(v)),
        Some(Slot::Target(id)) => Err(SemanticError::NonConstant {
            name: table.get(id).name.clone(),
            line,
        }
        .into()),
        None => Ok(None),
    }
}

fn value(slot: Option<Slot>, table: &SymbolTable, line: usize) -> Result<ConstValue, CompileError> {
    match slot {
        Some(Slot::Value(v)) => Ok(v),
        // globals are assignment targets only; reading one needs run-time code
        Some(Slot::Target(id)) => Err(SemanticError::NonConstant {
            name: table.get(id).name.clone(),
            line,
        }
        .into()),
        None => Err(crate::lang::SyntaxError::MissingOperand {
            op: "constant expression".into(),
            line,
        }
        .into()),
    }
}

fn define(
    table: &SymbolTable,
    asm: &mut Assembly,
    id: SymbolId,
    value: &ConstValue,
    line: usize,
) -> Result<(), CompileError> {
    let sym = table.get(id);
    let label = table.label(id);
    let size = sym.ty.size(table);
    let mismatch = || SemanticError::TypeMismatch {
        expected: sym.ty.describe(table),
        found: match value {
            ConstValue::Int(_) => "integer constant".to_string(),
            ConstValue::Float(_) => "floating constant".to_string(),
            ConstValue::Str(_) => "string constant".to_string(),
        },
        line,
    };

    let directive = width_directive(size);
    let line_text = if sym.ty.is_float(table) {
        let number = value.as_f64().ok_or_else(mismatch)?;
        format!("{label} {directive} {}", float_text(number))
    } else if sym.ty.is_integral(table) {
        let number = match value {
            ConstValue::Int(v) => *v,
            ConstValue::Float(_) => value.as_f64().map(|f| f as i64).ok_or_else(mismatch)?,
            ConstValue::Str(_) => return Err(mismatch().into()),
        };
        format!("{label} {directive} {number}")
    } else if sym.ty.is_pointer() {
        match value {
            ConstValue::Str(text) => {
                let data = intern_string(asm, text);
                format!("{label} dq {data}")
            }
            ConstValue::Int(v) => format!("{label} dq {v}"),
            ConstValue::Float(_) => return Err(mismatch().into()),
        }
    } else {
        return Err(mismatch().into());
    };
    asm.write_data(line_text);
    Ok(())
}

pub fn width_directive(size: u32) -> &'static str {
    match size {
        0 | 1 => "db",
        2 => "dw",
        3 | 4 => "dd",
        _ => "dq",
    }
}

pub fn reserve_directive(size: u32) -> &'static str {
    match size {
        0 | 1 => "resb",
        2 => "resw",
        3 | 4 => "resd",
        _ => "resq",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::expr::parse_expression;
    use crate::lang::symbols::Symbol;
    use crate::lang::tokenizer::tokenize;
    use crate::lang::types::FullType;

    fn global(table: &mut SymbolTable, name: &str, ty: &str, pointer: u32) -> SymbolId {
        let mut full = FullType::new(table.primitive(ty));
        full.pointer_level = pointer;
        table
            .insert(Symbol::new(name, full, SymbolKind::GlobalVariable, None))
            .unwrap()
    }

    fn fold(table: &SymbolTable, asm: &mut Assembly, src: &str) -> Result<Option<ConstValue>, CompileError> {
        let mut tokens = tokenize(src).unwrap();
        tokens.pop();
        let items = parse_expression(&tokens, table, None)?;
        fold_global(&items, table, asm, 1)
    }

    #[test]
    fn folds_integer_sum_into_data() {
        let mut table = SymbolTable::new();
        global(&mut table, "x", "int", 0);
        let mut asm = Assembly::new();
        let v = fold(&table, &mut asm, "x = 2 + 3").unwrap();
        assert_eq!(v, Some(ConstValue::Int(5)));
        assert_eq!(asm.data(), &["$x dd 5".to_string()]);
        assert!(asm.subroutines().is_empty());
    }

    #[test]
    fn promotes_and_concatenates() {
        assert_eq!(
            add(ConstValue::Int(1), ConstValue::Float("2.5".into())),
            ConstValue::Float("3.5".into())
        );
        assert_eq!(
            add(ConstValue::Float("1.5".into()), ConstValue::Float("0.5".into())),
            ConstValue::Float("2.0".into())
        );
        assert_eq!(
            add(ConstValue::Str("n=".into()), ConstValue::Int(4)),
            ConstValue::Str("n=4".into())
        );
        assert_eq!(
            add(ConstValue::Int(4), ConstValue::Str("!".into())),
            ConstValue::Str("4!".into())
        );
    }

    #[test]
    fn string_globals_point_at_interned_data() {
        let mut table = SymbolTable::new();
        global(&mut table, "greeting", "char", 1);
        let mut asm = Assembly::new();
        fold(&table, &mut asm, r#"greeting = "hi " + "there\n""#).unwrap();
        assert_eq!(
            asm.data(),
            &[
                "__sable_s0 db `hi there\\n`, 0".to_string(),
                "$greeting dq __sable_s0".to_string()
            ]
        );
    }

    #[test]
    fn double_global_uses_quadword() {
        let mut table = SymbolTable::new();
        global(&mut table, "ratio", "double", 0);
        let mut asm = Assembly::new();
        fold(&table, &mut asm, "ratio = 1 + 2").unwrap();
        assert_eq!(asm.data(), &["$ratio dq 3.0".to_string()]);
    }

    #[test]
    fn rejects_runtime_operators() {
        let mut table = SymbolTable::new();
        global(&mut table, "x", "int", 0);
        let mut asm = Assembly::new();
        let err = fold(&table, &mut asm, "x = 2 * 3").unwrap_err();
        assert!(matches!(
            err,
            CompileError::Semantic(SemanticError::NonConstantOperator { ref op, .. }) if op == "*"
        ));
    }

    #[test]
    fn rejects_reading_other_globals() {
        let mut table = SymbolTable::new();
        global(&mut table, "x", "int", 0);
        global(&mut table, "y", "int", 0);
        let mut asm = Assembly::new();
        let err = fold(&table, &mut asm, "x = y + 1").unwrap_err();
        assert!(matches!(
            err,
            CompileError::Semantic(SemanticError::NonConstant { ref name, .. }) if name == "y"
        ));
    }
}
