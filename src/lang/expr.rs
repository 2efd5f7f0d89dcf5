use crate::lang::symbols::{SymbolId, SymbolKind, SymbolTable, Visibility};
use crate::lang::tokenizer::{Token, TokenKind};
use crate::lang::types::{FullType, resolve_full_type};
use crate::lang::{CompileError, SemanticError, SyntaxError, UnimplementedError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Assign,
    HeapAssign,
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Cast,
    Negate,
    Not,
    AddressOf,
    Deref,
    Dot,
    Subscript,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Prefix,
    Suffix,
    Infix,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpInfo {
    pub kind: OpKind,
    pub text: &'static str,
    pub arity: Arity,
    pub precedence: u8,
    pub right_assoc: bool,
}

const fn op(kind: OpKind, text: &'static str, arity: Arity, precedence: u8, right_assoc: bool) -> OpInfo {
    OpInfo {
        kind,
        text,
        arity,
        precedence,
        right_assoc,
    }
}

pub const OPERATORS: &[OpInfo] = &[
    op(OpKind::Dot, ".", Arity::Infix, 15, false),
    op(OpKind::Negate, "-", Arity::Prefix, 13, true),
    op(OpKind::Not, "!", Arity::Prefix, 13, true),
    op(OpKind::AddressOf, "&", Arity::Prefix, 13, true),
    op(OpKind::Deref, "*", Arity::Prefix, 13, true),
    op(OpKind::Cast, "=>", Arity::Infix, 12, false),
    op(OpKind::Mul, "*", Arity::Infix, 11, false),
    op(OpKind::Div, "/", Arity::Infix, 11, false),
    op(OpKind::Mod, "%", Arity::Infix, 11, false),
    op(OpKind::Add, "+", Arity::Infix, 10, false),
    op(OpKind::Sub, "-", Arity::Infix, 10, false),
    op(OpKind::Lt, "<", Arity::Infix, 9, false),
    op(OpKind::Gt, ">", Arity::Infix, 9, false),
    op(OpKind::Le, "<=", Arity::Infix, 9, false),
    op(OpKind::Ge, ">=", Arity::Infix, 9, false),
    op(OpKind::Eq, "==", Arity::Infix, 8, false),
    op(OpKind::Ne, "!=", Arity::Infix, 8, false),
    op(OpKind::And, "&&", Arity::Infix, 7, false),
    op(OpKind::Or, "||", Arity::Infix, 6, false),
    op(OpKind::Assign, "=", Arity::Infix, 2, true),
    op(OpKind::HeapAssign, "~=", Arity::Infix, 2, true),
];

const SUBSCRIPT_PRECEDENCE: u8 = 14;

pub fn find_op(text: &str, arity: Arity) -> Option<&'static OpInfo> {
    OPERATORS.iter().find(|o| o.text == text && o.arity == arity)
}

fn is_operator_text(text: &str) -> bool {
    OPERATORS.iter().any(|o| o.text == text)
}

fn has_prefix_form(text: &str) -> bool {
    find_op(text, Arity::Prefix).is_some()
}

fn starts_operand(tok: &Token) -> bool {
    match tok.kind {
        TokenKind::Identifier | TokenKind::Constant | TokenKind::StringLiteral => true,
        TokenKind::Punctuator => tok.text == "(" || has_prefix_form(&tok.text),
        TokenKind::Keyword | TokenKind::End => false,
    }
}

impl OpKind {
    pub fn text(self) -> &'static str {
        match self {
            OpKind::Subscript => "[]",
            kind => OPERATORS
                .iter()
                .find(|o| o.kind == kind)
                .map(|o| o.text)
                .unwrap_or("?"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTarget {
    Function(SymbolId),
    /// `implicit_this` calls a sibling method through the current `this`.
    Method { id: SymbolId, implicit_this: bool },
    Constructor(SymbolId),
    /// Field-wise construction of a struct type.
    Construct(SymbolId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostfixItem {
    Integer(i64),
    Float(String),
    Str(String),
    Symbol(SymbolId),
    Type(FullType),
    Name(String),
    Operator(OpKind),
    /// Raw call boundary emitted where the call opens.
    FunctionMarker(CallTarget),
    CallEnd { argc: usize },
    Call { target: CallTarget, argc: usize },
}

#[derive(Debug)]
enum Pending {
    Operator(&'static OpInfo),
    Paren,
    Bracket,
    Call,
}

#[derive(Debug)]
struct CallFrame {
    args: usize,
    arg_start: usize,
}

/// Decides between the prefix, suffix and infix reading of an operator.
pub fn arity_at(tokens: &[Token], idx: usize, expect_operand: bool) -> Arity {
    if expect_operand {
        return Arity::Prefix;
    }
    match tokens.get(idx + 1) {
        None => Arity::Suffix,
        Some(next) if next.kind == TokenKind::End => Arity::Suffix,
        Some(next)
            if next.kind == TokenKind::Punctuator
                && (matches!(next.text.as_str(), ")" | "]" | "," | ";")
                    || (is_operator_text(&next.text) && !has_prefix_form(&next.text))) =>
        {
            Arity::Suffix
        }
        _ => Arity::Infix,
    }
}

/// Infix tokens to raw postfix order (shunting-yard).
pub fn to_postfix(
    tokens: &[Token],
    table: &SymbolTable,
    scope: Option<SymbolId>,
) -> Result<Vec<PostfixItem>, CompileError> {
    let mut output: Vec<PostfixItem> = Vec::new();
    let mut ops: Vec<Pending> = Vec::new();
    let mut calls: Vec<CallFrame> = Vec::new();
    let mut expect_operand = true;
    let mut after_dot = false;
    let mut idx = 0;
    let last_line = tokens.last().map(|t| t.line).unwrap_or_default();

    while idx < tokens.len() {
        let tok = &tokens[idx];
        let line = tok.line;
        if tok.kind == TokenKind::End {
            break;
        }

        if tok.kind == TokenKind::Punctuator {
            match tok.text.as_str() {
                "::" => return Err(UnimplementedError::ScopeResolution { line }.into()),
                "(" => {
                    if !expect_operand {
                        return Err(SyntaxError::Expected {
                            expected: "operator".into(),
                            found: "(".into(),
                            line,
                        }
                        .into());
                    }
                    ops.push(Pending::Paren);
                    idx += 1;
                    continue;
                }
                ")" => {
                    loop {
                        match ops.pop() {
                            Some(Pending::Operator(o)) => output.push(PostfixItem::Operator(o.kind)),
                            Some(Pending::Paren) => break,
                            Some(Pending::Call) => {
                                let frame = calls.pop().ok_or(SyntaxError::MalformedArguments { line })?;
                                let argc = if output.len() > frame.arg_start {
                                    frame.args + 1
                                } else if frame.args == 0 {
                                    0
                                } else {
                                    return Err(SyntaxError::MalformedArguments { line }.into());
                                };
                                output.push(PostfixItem::CallEnd { argc });
                                break;
                            }
                            Some(Pending::Bracket) | None => {
                                return Err(SyntaxError::Unbalanced {
                                    delimiter: ")".into(),
                                    line,
                                }
                                .into());
                            }
                        }
                    }
                    expect_operand = false;
                    idx += 1;
                    continue;
                }
                "[" => {
                    if expect_operand {
                        return Err(SyntaxError::MissingOperand {
                            op: "[]".into(),
                            line,
                        }
                        .into());
                    }
                    pop_while(&mut ops, &mut output, |top| top.precedence >= SUBSCRIPT_PRECEDENCE);
                    ops.push(Pending::Bracket);
                    expect_operand = true;
                    idx += 1;
                    continue;
                }
                "]" => {
                    loop {
                        match ops.pop() {
                            Some(Pending::Operator(o)) => output.push(PostfixItem::Operator(o.kind)),
                            Some(Pending::Bracket) => break,
                            _ => {
                                return Err(SyntaxError::Unbalanced {
                                    delimiter: "]".into(),
                                    line,
                                }
                                .into());
                            }
                        }
                    }
                    if expect_operand {
                        return Err(SyntaxError::MissingOperand {
                            op: "[]".into(),
                            line,
                        }
                        .into());
                    }
                    output.push(PostfixItem::Operator(OpKind::Subscript));
                    idx += 1;
                    continue;
                }
                "," => {
                    loop {
                        match ops.last() {
                            Some(Pending::Operator(o)) => {
                                output.push(PostfixItem::Operator(o.kind));
                                ops.pop();
                            }
                            Some(Pending::Call) => break,
                            _ => return Err(SyntaxError::MalformedArguments { line }.into()),
                        }
                    }
                    let frame = calls.last_mut().ok_or(SyntaxError::MalformedArguments { line })?;
                    if output.len() == frame.arg_start {
                        return Err(SyntaxError::MalformedArguments { line }.into());
                    }
                    frame.args += 1;
                    frame.arg_start = output.len();
                    expect_operand = true;
                    idx += 1;
                    continue;
                }
                text if is_operator_text(text) => {
                    let arity = arity_at(tokens, idx, expect_operand);
                    let info = find_op(text, arity).ok_or_else(|| SyntaxError::MissingOperand {
                        op: text.to_string(),
                        line,
                    })?;
                    if info.arity == Arity::Infix {
                        pop_while(&mut ops, &mut output, |top| {
                            top.precedence > info.precedence
                                || (top.precedence == info.precedence && !info.right_assoc)
                        });
                    }
                    ops.push(Pending::Operator(info));
                    after_dot = info.kind == OpKind::Dot;
                    expect_operand = true;
                    idx += 1;
                    continue;
                }
                other => {
                    return Err(SyntaxError::Expected {
                        expected: "expression".into(),
                        found: other.to_string(),
                        line,
                    }
                    .into());
                }
            }
        }

        if !expect_operand {
            return Err(SyntaxError::Expected {
                expected: "operator".into(),
                found: tok.text.clone(),
                line,
            }
            .into());
        }

        match tok.kind {
            TokenKind::Constant => {
                if tok.text.contains('.') {
                    output.push(PostfixItem::Float(tok.text.clone()));
                } else {
                    let value = tok.text.parse::<i64>().map_err(|_| SyntaxError::Expected {
                        expected: "integer".into(),
                        found: tok.text.clone(),
                        line,
                    })?;
                    output.push(PostfixItem::Integer(value));
                }
                idx += 1;
            }
            TokenKind::StringLiteral => {
                output.push(PostfixItem::Str(tok.text.clone()));
                idx += 1;
            }
            _ if tokens.get(idx + 1).is_some_and(|t| t.is_punct("(")) => {
                let target = if after_dot {
                    resolve_member_call(&tok.text, &mut output, &mut ops, table, scope, line)?
                } else {
                    resolve_call(&tok.text, table, scope, line)?
                };
                output.push(PostfixItem::FunctionMarker(target));
                ops.push(Pending::Call);
                calls.push(CallFrame {
                    args: 0,
                    arg_start: output.len(),
                });
                idx += 2;
                after_dot = false;
                continue;
            }
            _ if after_dot => {
                output.push(PostfixItem::Name(tok.text.clone()));
                idx += 1;
            }
            _ => {
                if let Some((mut ty, mut next)) = resolve_full_type(tokens, idx, table, scope)? {
                    // `x => int * y` multiplies; a `*` is only a pointer marker
                    // when no operand follows it
                    while ty.pointer_level > 0 && tokens.get(next).is_some_and(starts_operand) {
                        ty.pointer_level -= 1;
                        next -= 1;
                    }
                    output.push(PostfixItem::Type(ty));
                    idx = next;
                } else {
                    let id = table.lookup(&tok.text, scope).ok_or_else(|| SemanticError::Undefined {
                        name: tok.text.clone(),
                        line,
                    })?;
                    output.push(PostfixItem::Symbol(id));
                    idx += 1;
                }
            }
        }
        after_dot = false;
        expect_operand = false;
    }

    if expect_operand && !tokens.is_empty() {
        let op = ops
            .iter()
            .rev()
            .find_map(|p| match p {
                Pending::Operator(o) => Some(o.text),
                _ => None,
            })
            .unwrap_or("expression");
        return Err(SyntaxError::MissingOperand {
            op: op.to_string(),
            line: last_line,
        }
        .into());
    }

    while let Some(pending) = ops.pop() {
        match pending {
            Pending::Operator(o) => output.push(PostfixItem::Operator(o.kind)),
            Pending::Paren | Pending::Call => {
                return Err(SyntaxError::Unbalanced {
                    delimiter: "(".into(),
                    line: last_line,
                }
                .into());
            }
            Pending::Bracket => {
                return Err(SyntaxError::Unbalanced {
                    delimiter: "[".into(),
                    line: last_line,
                }
                .into());
            }
        }
    }

    Ok(output)
}

fn pop_while(
    ops: &mut Vec<Pending>,
    output: &mut Vec<PostfixItem>,
    should_pop: impl Fn(&OpInfo) -> bool,
) {
    while let Some(Pending::Operator(top)) = ops.last() {
        if !should_pop(top) {
            break;
        }
        output.push(PostfixItem::Operator(top.kind));
        ops.pop();
    }
}

fn resolve_call(
    name: &str,
    table: &SymbolTable,
    scope: Option<SymbolId>,
    line: usize,
) -> Result<CallTarget, CompileError> {
    let id = table.lookup(name, scope).ok_or_else(|| SemanticError::Undefined {
        name: name.to_string(),
        line,
    })?;
    match &table.get(id).kind {
        SymbolKind::Function(_) => Ok(CallTarget::Function(id)),
        SymbolKind::Method(_) => Ok(CallTarget::Method {
            id,
            implicit_this: true,
        }),
        SymbolKind::ObjectType(info) => match info.constructor {
            Some(ctor) => Ok(CallTarget::Constructor(ctor)),
            None => Ok(CallTarget::Construct(id)),
        },
        SymbolKind::StructType(_) => Ok(CallTarget::Construct(id)),
        _ => Err(SemanticError::NotCallable {
            name: name.to_string(),
            line,
        }
        .into()),
    }
}

/// `receiver.name(` : a method on the receiver's static type, or a member
/// function of a namespace receiver.
fn resolve_member_call(
    name: &str,
    output: &mut Vec<PostfixItem>,
    ops: &mut Vec<Pending>,
    table: &SymbolTable,
    scope: Option<SymbolId>,
    line: usize,
) -> Result<CallTarget, CompileError> {
    // the call consumes the `.`
    if matches!(ops.last(), Some(Pending::Operator(o)) if o.kind == OpKind::Dot) {
        ops.pop();
    }

    if let Some(PostfixItem::Symbol(ns)) = output.last()
        && table.get(*ns).kind == SymbolKind::Namespace
    {
        let ns = *ns;
        let id = table
            .lookup_immediate(name, Some(ns))
            .ok_or_else(|| SemanticError::UnknownMember {
                ty: table.get(ns).name.clone(),
                member: name.to_string(),
                line,
            })?;
        output.pop();
        return match &table.get(id).kind {
            SymbolKind::Function(_) => Ok(CallTarget::Function(id)),
            _ => resolve_call(name, table, Some(ns), line),
        };
    }

    let ty = static_type(output, table).ok_or_else(|| SemanticError::NotCallable {
        name: name.to_string(),
        line,
    })?;
    let type_name = table.get(ty.base).name.clone();
    if ty.pointer_level > 0 || table.get(ty.base).type_info().is_none() {
        return Err(SemanticError::UnknownMember {
            ty: ty.describe(table),
            member: name.to_string(),
            line,
        }
        .into());
    }
    let id = table
        .member(ty.base, name)
        .filter(|id| matches!(table.get(*id).kind, SymbolKind::Method(_)))
        .ok_or_else(|| SemanticError::UnknownMember {
            ty: type_name.clone(),
            member: name.to_string(),
            line,
        })?;
    if table.get(id).visibility != Visibility::Public && table.enclosing_type(scope) != Some(ty.base) {
        return Err(SemanticError::PrivateMember {
            ty: type_name,
            member: name.to_string(),
            line,
        }
        .into());
    }
    Ok(CallTarget::Method {
        id,
        implicit_this: false,
    })
}

/// Static type of the operand that ends `items`, as far as it can be known
/// before evaluation.
fn static_type(items: &[PostfixItem], table: &SymbolTable) -> Option<FullType> {
    match items.last()? {
        PostfixItem::Symbol(id) => Some(table.get(*id).ty.clone()),
        PostfixItem::Operator(OpKind::Dot) => {
            let rest = &items[..items.len() - 1];
            let PostfixItem::Name(field) = rest.last()? else {
                return None;
            };
            let owner = &rest[..rest.len() - 1];
            if let Some(PostfixItem::Symbol(ns)) = owner.last()
                && table.get(*ns).kind == SymbolKind::Namespace
            {
                let member = table.lookup_immediate(field, Some(*ns))?;
                return Some(table.get(member).ty.clone());
            }
            let base = static_type(owner, table)?;
            let member = table.member(base.base, field)?;
            Some(table.get(member).ty.clone())
        }
        PostfixItem::CallEnd { .. } => {
            let mut depth = 0;
            for item in items.iter().rev() {
                match item {
                    PostfixItem::CallEnd { .. } => depth += 1,
                    PostfixItem::FunctionMarker(target) => {
                        depth -= 1;
                        if depth == 0 {
                            return Some(call_result_type(target, table));
                        }
                    }
                    _ => {}
                }
            }
            None
        }
        PostfixItem::Call { target, .. } => Some(call_result_type(target, table)),
        _ => None,
    }
}

pub fn call_result_type(target: &CallTarget, table: &SymbolTable) -> FullType {
    match target {
        CallTarget::Function(id)
        | CallTarget::Method { id, .. }
        | CallTarget::Constructor(id) => table.get(*id).ty.clone(),
        CallTarget::Construct(ty) => FullType::new(*ty),
    }
}

pub fn target_symbol(target: &CallTarget) -> SymbolId {
    match target {
        CallTarget::Function(id)
        | CallTarget::Method { id, .. }
        | CallTarget::Constructor(id)
        | CallTarget::Construct(id) => *id,
    }
}

/// Moves every call marker behind its argument run and checks arity.
pub fn rewrite_calls(
    items: Vec<PostfixItem>,
    table: &SymbolTable,
    line: usize,
) -> Result<Vec<PostfixItem>, CompileError> {
    let mut out = Vec::with_capacity(items.len());
    let mut markers: Vec<CallTarget> = Vec::new();
    for item in items {
        match item {
            PostfixItem::FunctionMarker(target) => markers.push(target),
            PostfixItem::CallEnd { argc } => {
                let target = markers.pop().ok_or(SyntaxError::MalformedArguments { line })?;
                check_arity(&target, argc, table, line)?;
                out.push(PostfixItem::Call { target, argc });
            }
            other => out.push(other),
        }
    }
    if !markers.is_empty() {
        return Err(SyntaxError::MalformedArguments { line }.into());
    }
    Ok(out)
}

fn check_arity(
    target: &CallTarget,
    found: usize,
    table: &SymbolTable,
    line: usize,
) -> Result<(), CompileError> {
    let id = target_symbol(target);
    let sym = table.get(id);
    let expected = match target {
        CallTarget::Construct(_) => sym.type_info().map(|t| t.fields.len()).unwrap_or_default(),
        _ => match sym.function_info() {
            Some(info) if info.external => return Ok(()),
            Some(info) => info.params.len(),
            None => 0,
        },
    };
    if expected != found {
        return Err(SemanticError::ArityMismatch {
            name: sym.name.clone(),
            expected,
            found,
            line,
        }
        .into());
    }
    Ok(())
}

/// Postfix form of an expression, with calls in calling order.
pub fn parse_expression(
    tokens: &[Token],
    table: &SymbolTable,
    scope: Option<SymbolId>,
) -> Result<Vec<PostfixItem>, CompileError> {
    let line = tokens.first().map(|t| t.line).unwrap_or_default();
    let raw = to_postfix(tokens, table, scope)?;
    rewrite_calls(raw, table, line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::symbols::{FunctionInfo, Symbol};
    use crate::lang::tokenizer::tokenize;
    use insta::assert_debug_snapshot;

    struct Fixture {
        table: SymbolTable,
        f: SymbolId,
        a: SymbolId,
        b: SymbolId,
        ext: SymbolId,
    }

    fn fixture() -> Fixture {
        let mut table = SymbolTable::new();
        let int = FullType::new(table.primitive("int"));
        let f = table
            .insert(Symbol::new(
                "f",
                int.clone(),
                SymbolKind::Function(FunctionInfo::default()),
                None,
            ))
            .unwrap();
        let p0 = table
            .insert(Symbol::new("x", int.clone(), SymbolKind::Parameter, Some(f)))
            .unwrap();
        let p1 = table
            .insert(Symbol::new("y", int.clone(), SymbolKind::Parameter, Some(f)))
            .unwrap();
        table.get_mut(f).function_info_mut().unwrap().params = vec![p0, p1];
        table.prune_scope(f);

        let ext = table
            .insert(Symbol::new(
                "puts",
                int.clone(),
                SymbolKind::Function(FunctionInfo {
                    external: true,
                    ..FunctionInfo::default()
                }),
                None,
            ))
            .unwrap();
        let a = table
            .insert(Symbol::new("a", int.clone(), SymbolKind::GlobalVariable, None))
            .unwrap();
        let b = table
            .insert(Symbol::new("b", int, SymbolKind::GlobalVariable, None))
            .unwrap();
        Fixture { table, f, a, b, ext }
    }

    fn postfix(fx: &Fixture, src: &str) -> Result<Vec<PostfixItem>, CompileError> {
        let mut tokens = tokenize(src).unwrap();
        tokens.pop();
        parse_expression(&tokens, &fx.table, None)
    }

    #[test]
    fn call_arguments_precede_the_call_in_source_order() {
        let fx = fixture();
        let items = postfix(&fx, "f(a, b + 1)").unwrap();
        assert_eq!(
            items,
            vec![
                PostfixItem::Symbol(fx.a),
                PostfixItem::Symbol(fx.b),
                PostfixItem::Integer(1),
                PostfixItem::Operator(OpKind::Add),
                PostfixItem::Call {
                    target: CallTarget::Function(fx.f),
                    argc: 2
                },
            ]
        );
    }

    #[test]
    fn raw_form_keeps_marker_at_call_open() {
        let fx = fixture();
        let mut tokens = tokenize("f(a, b)").unwrap();
        tokens.pop();
        let raw = to_postfix(&tokens, &fx.table, None).unwrap();
        assert_eq!(raw[0], PostfixItem::FunctionMarker(CallTarget::Function(fx.f)));
        assert_eq!(raw[3], PostfixItem::CallEnd { argc: 2 });
    }

    #[test]
    fn arity_mismatch_names_both_counts() {
        let fx = fixture();
        let err = postfix(&fx, "f(a, b, 3)").unwrap_err();
        let CompileError::Semantic(SemanticError::ArityMismatch {
            name,
            expected,
            found,
            ..
        }) = err
        else {
            panic!("unexpected error {err:?}");
        };
        assert_eq!((name.as_str(), expected, found), ("f", 2, 3));
    }

    #[test]
    fn external_functions_skip_arity_checks() {
        let fx = fixture();
        let items = postfix(&fx, "puts(a, b, 1, 2, 3)").unwrap();
        assert_eq!(
            items.last(),
            Some(&PostfixItem::Call {
                target: CallTarget::Function(fx.ext),
                argc: 5
            })
        );
        let items = postfix(&fx, "puts()").unwrap();
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn precedence_and_associativity() {
        let fx = fixture();
        assert_debug_snapshot!(postfix(&fx, "a = b = 1 + 2 * -3").unwrap(), @r"
        [
            Symbol(
                SymbolId(
                    10,
                ),
            ),
            Symbol(
                SymbolId(
                    11,
                ),
            ),
            Integer(
                1,
            ),
            Integer(
                2,
            ),
            Integer(
                3,
            ),
            Operator(
                Negate,
            ),
            Operator(
                Mul,
            ),
            Operator(
                Add,
            ),
            Operator(
                Assign,
            ),
            Operator(
                Assign,
            ),
        ]
        ");
    }

    #[test]
    fn subtraction_is_left_associative() {
        let fx = fixture();
        let items = postfix(&fx, "a - b - 1").unwrap();
        assert_eq!(
            items,
            vec![
                PostfixItem::Symbol(fx.a),
                PostfixItem::Symbol(fx.b),
                PostfixItem::Operator(OpKind::Sub),
                PostfixItem::Integer(1),
                PostfixItem::Operator(OpKind::Sub),
            ]
        );
    }

    #[test]
    fn cast_target_is_a_type_operand() {
        let fx = fixture();
        let items = postfix(&fx, "a => double").unwrap();
        assert_eq!(
            items[1],
            PostfixItem::Type(FullType::new(fx.table.primitive("double")))
        );
        assert_eq!(items[2], PostfixItem::Operator(OpKind::Cast));
    }

    #[test]
    fn star_after_cast_type_multiplies_when_an_operand_follows() {
        let fx = fixture();
        let int = FullType::new(fx.table.primitive("int"));
        let items = postfix(&fx, "a => int * b").unwrap();
        assert_eq!(
            items,
            vec![
                PostfixItem::Symbol(fx.a),
                PostfixItem::Type(int.clone()),
                PostfixItem::Operator(OpKind::Cast),
                PostfixItem::Symbol(fx.b),
                PostfixItem::Operator(OpKind::Mul),
            ]
        );

        let items = postfix(&fx, "(a => int*) == (b => int*)").unwrap();
        assert_eq!(items[1], PostfixItem::Type(int.pointer_to()));
        assert_eq!(items[4], PostfixItem::Type(int.pointer_to()));
    }

    #[test]
    fn subscript_binds_tighter_than_prefix() {
        let fx = fixture();
        let items = postfix(&fx, "-a[b]").unwrap();
        assert_eq!(
            items,
            vec![
                PostfixItem::Symbol(fx.a),
                PostfixItem::Symbol(fx.b),
                PostfixItem::Operator(OpKind::Subscript),
                PostfixItem::Operator(OpKind::Negate),
            ]
        );
    }

    #[test]
    fn operator_arity_comes_from_context() {
        let tokens = tokenize("a * * b").unwrap();
        assert_eq!(arity_at(&tokens, 1, false), Arity::Infix);
        assert_eq!(arity_at(&tokens, 2, true), Arity::Prefix);
        let tokens = tokenize("a + )").unwrap();
        assert_eq!(arity_at(&tokens, 1, false), Arity::Suffix);
    }

    #[test]
    fn dangling_operator_is_missing_an_operand() {
        let fx = fixture();
        let err = postfix(&fx, "a +").unwrap_err();
        assert!(matches!(
            err,
            CompileError::Syntax(SyntaxError::MissingOperand { .. })
        ));
    }

    #[test]
    fn unbalanced_parens_are_rejected() {
        let fx = fixture();
        assert!(matches!(
            postfix(&fx, "(a + b").unwrap_err(),
            CompileError::Syntax(SyntaxError::Unbalanced { .. })
        ));
        assert!(matches!(
            postfix(&fx, "a + b)").unwrap_err(),
            CompileError::Syntax(SyntaxError::Unbalanced { .. })
        ));
    }

    #[test]
    fn empty_argument_is_malformed() {
        let fx = fixture();
        assert!(matches!(
            postfix(&fx, "f(a,,b)").unwrap_err(),
            CompileError::Syntax(SyntaxError::MalformedArguments { .. })
        ));
    }

    #[test]
    fn scope_resolution_is_unimplemented() {
        let fx = fixture();
        assert!(matches!(
            postfix(&fx, "a::b").unwrap_err(),
            CompileError::Unimplemented(UnimplementedError::ScopeResolution { .. })
        ));
    }

    #[test]
    fn undefined_names_are_reported() {
        let fx = fixture();
        let err = postfix(&fx, "nope + 1").unwrap_err();
        assert!(matches!(
            err,
            CompileError::Semantic(SemanticError::Undefined { ref name, .. }) if name == "nope"
        ));
    }
}
