use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};

use crate::lang::codegen::{self, allocate_this};
use crate::lang::constant::{fold_global, reserve_directive};
use crate::lang::expr::parse_expression;
use crate::lang::stack::{Emitter, StackModel, float_move};
use crate::lang::symbols::{
    BlockInfo, FunctionInfo, Symbol, SymbolId, SymbolKind, SymbolTable, TypeInfo, VOID, Visibility,
};
use crate::lang::tokenizer::{Token, TokenKind, tokenize};
use crate::lang::types::{FullType, resolve_full_type};
use crate::lang::{CompileError, Diagnostic, SemanticError, SyntaxError, UnimplementedError};
use crate::x64::instruction::{FLOAT_ARGS, INT_ARGS};
use crate::x64::{Assembly, Ending, Instruction, Opcode, Operand, Reg, Section, Size, SubroutineId};

/// State shared by every unit of one compilation.
///
/// Imported units declare into the same symbol table and emit into the same
/// assembly, so their declarations are visible to the importer once the
/// import statement returns.
#[derive(Debug, Default)]
pub struct Compilation {
    pub table: SymbolTable,
    pub asm: Assembly,
    pub diagnostics: Vec<Diagnostic>,
    imported: Vec<PathBuf>,
    import_stack: Vec<PathBuf>,
}

impl Compilation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compiles one source unit. `path` locates its imports and guards
    /// against importing it again.
    pub fn compile_unit(&mut self, source: &str, path: Option<&Path>) -> Result<(), CompileError> {
        let tokens = tokenize(source)?;
        let canonical = path.map(|p| p.canonicalize().unwrap_or_else(|_| p.to_path_buf()));
        let dir = canonical
            .as_deref()
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_default();
        if let Some(unit) = &canonical {
            self.imported.push(unit.clone());
            self.import_stack.push(unit.clone());
        }
        let result = Unit::new(self, tokens, dir).run();
        if canonical.is_some() {
            self.import_stack.pop();
        }
        result
    }

    /// The assembled NASM text.
    pub fn output(&self) -> String {
        self.asm.serialize()
    }

    fn info(&mut self, line: Option<usize>, message: String) {
        self.diagnostics.push(Diagnostic { line, message });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    NoMatch,
    Matched,
}

type Rule<'c> = fn(&mut Unit<'c>) -> Result<Step, CompileError>;

/// What kind of scope new declarations land in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Place {
    Global,
    Namespace,
    Struct(SymbolId),
    Object(SymbolId),
    Code,
}

/// Cursor over one unit's tokens.
struct Unit<'c> {
    comp: &'c mut Compilation,
    tokens: Vec<Token>,
    pos: usize,
    scope: Option<SymbolId>,
    function: Option<SymbolId>,
    /// Subroutine receiving code; the tail of the current branch chain.
    current: Option<SubroutineId>,
    model: StackModel,
    dir: PathBuf,
}

impl<'c> Unit<'c> {
    fn new(comp: &'c mut Compilation, tokens: Vec<Token>, dir: PathBuf) -> Self {
        Unit {
            comp,
            tokens,
            pos: 0,
            scope: None,
            function: None,
            current: None,
            model: StackModel::new(),
            dir,
        }
    }

    fn run(mut self) -> Result<(), CompileError> {
        let rules: [Rule<'c>; 11] = [
            Self::import,
            Self::function_header,
            Self::if_block,
            Self::while_block,
            Self::block_exit,
            Self::return_statement,
            Self::delete_statement,
            Self::variable,
            Self::struct_type,
            Self::object_type,
            Self::namespace,
        ];

        while self.peek().kind != TokenKind::End {
            let mut step = Step::NoMatch;
            for rule in rules {
                step = rule(&mut self)?;
                if step == Step::Matched {
                    break;
                }
            }
            if step == Step::NoMatch {
                self.expression_statement()?;
            }
        }

        match self.scope {
            Some(open) => Err(SyntaxError::UnclosedBlock {
                line: self.comp.table.get(open).line,
            }
            .into()),
            None => Ok(()),
        }
    }

    fn peek(&self) -> &Token {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> &Token {
        let last = self.tokens.len() - 1;
        &self.tokens[(self.pos + offset).min(last)]
    }

    fn line(&self) -> usize {
        self.peek().line
    }

    fn advance(&mut self) -> Token {
        let tok = self.peek().clone();
        if tok.kind != TokenKind::End {
            self.pos += 1;
        }
        tok
    }

    fn unexpected(&self, expected: &str) -> CompileError {
        let tok = self.peek();
        match tok.kind {
            TokenKind::End => SyntaxError::UnexpectedEof { line: tok.line }.into(),
            _ => SyntaxError::Expected {
                expected: expected.to_string(),
                found: tok.text.clone(),
                line: tok.line,
            }
            .into(),
        }
    }

    fn expect_punct(&mut self, text: &str) -> Result<(), CompileError> {
        if self.peek().is_punct(text) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.unexpected(&format!("'{text}'")))
        }
    }

    fn expect_identifier(&mut self, what: &str) -> Result<Token, CompileError> {
        if self.peek().kind == TokenKind::Identifier {
            Ok(self.advance())
        } else {
            Err(self.unexpected(what))
        }
    }

    /// Index of the `;` that ends the statement at the cursor.
    fn statement_end(&self) -> Result<usize, CompileError> {
        let mut depth = 0usize;
        for (idx, tok) in self.tokens.iter().enumerate().skip(self.pos) {
            if tok.kind == TokenKind::End {
                break;
            }
            if tok.kind != TokenKind::Punctuator {
                continue;
            }
            match tok.text.as_str() {
                "(" | "[" => depth += 1,
                ")" | "]" => depth = depth.saturating_sub(1),
                ";" if depth == 0 => return Ok(idx),
                "{" | "}" => {
                    return Err(SyntaxError::Expected {
                        expected: "';'".into(),
                        found: tok.text.clone(),
                        line: tok.line,
                    }
                    .into());
                }
                _ => {}
            }
        }
        let line = self.tokens.last().map(|t| t.line).unwrap_or_default();
        Err(SyntaxError::UnexpectedEof { line }.into())
    }

    /// Index of the `)` closing the parenthesis just before the cursor.
    fn closing_paren(&self) -> Result<usize, CompileError> {
        let mut depth = 1usize;
        for (idx, tok) in self.tokens.iter().enumerate().skip(self.pos) {
            if tok.kind == TokenKind::End {
                break;
            }
            if tok.is_punct("(") {
                depth += 1;
            } else if tok.is_punct(")") {
                depth -= 1;
                if depth == 0 {
                    return Ok(idx);
                }
            }
        }
        Err(SyntaxError::Unbalanced {
            delimiter: "(".into(),
            line: self.line(),
        }
        .into())
    }

    fn parse_type(&mut self) -> Result<Option<FullType>, CompileError> {
        self.parse_type_in(self.scope)
    }

    fn parse_type_in(&mut self, scope: Option<SymbolId>) -> Result<Option<FullType>, CompileError> {
        match resolve_full_type(&self.tokens, self.pos, &self.comp.table, scope)? {
            Some((ty, next)) => {
                self.pos = next;
                Ok(Some(ty))
            }
            None => Ok(None),
        }
    }

    fn visibility(&mut self) -> Option<Visibility> {
        let tok = self.peek();
        if tok.kind != TokenKind::Keyword {
            return None;
        }
        let visibility = match tok.text.as_str() {
            "public" => Visibility::Public,
            "private" => Visibility::Private,
            "protected" => Visibility::Protected,
            _ => return None,
        };
        self.pos += 1;
        Some(visibility)
    }

    fn place(&self) -> Place {
        let Some(scope) = self.scope else {
            return Place::Global;
        };
        match self.comp.table.get(scope).kind {
            SymbolKind::Namespace => Place::Namespace,
            SymbolKind::StructType(_) => Place::Struct(scope),
            SymbolKind::ObjectType(_) => Place::Object(scope),
            _ => Place::Code,
        }
    }

    fn insert(&mut self, symbol: Symbol) -> Result<SymbolId, CompileError> {
        Ok(self.comp.table.insert(symbol)?)
    }

    fn emitter(&mut self, line: usize) -> Result<(Emitter<'_>, &mut StackModel), CompileError> {
        let sub = self
            .current
            .ok_or(SemanticError::OutsideFunction { line })?;
        let em = Emitter {
            asm: &mut self.comp.asm,
            table: &self.comp.table,
            sub,
            line,
        };
        Ok((em, &mut self.model))
    }

    /// Evaluates `tokens[range]`, leaving its value on the model.
    fn evaluate(
        &mut self,
        range: Range<usize>,
        scope: Option<SymbolId>,
    ) -> Result<Option<FullType>, CompileError> {
        let line = match self.tokens.get(range.start) {
            Some(tok) => tok.line,
            None => self.line(),
        };
        let items = parse_expression(&self.tokens[range], &self.comp.table, scope)?;
        let (mut em, model) = self.emitter(line)?;
        codegen::evaluate(&items, model, &mut em, scope)
    }

    /// Evaluates a branch condition and leaves `rax` tested.
    fn condition(&mut self, range: Range<usize>, scope: Option<SymbolId>) -> Result<(), CompileError> {
        let line = match self.tokens.get(range.start) {
            Some(tok) => tok.line,
            None => self.line(),
        };
        let missing = SyntaxError::MissingOperand {
            op: "condition".into(),
            line,
        };
        if range.is_empty() {
            return Err(missing.into());
        }
        let ty = self.evaluate(range, scope)?.ok_or(missing)?;
        let table = &self.comp.table;
        if !(ty.is_integral(table) || ty.is_pointer() || ty.is_aggregate(table)) {
            return Err(SemanticError::TypeMismatch {
                expected: "integral or pointer condition".into(),
                found: ty.describe(table),
                line,
            }
            .into());
        }
        let (mut em, model) = self.emitter(line)?;
        model.take_into(&mut em, Reg::Rax)?;
        em.op(Opcode::Test, Reg::Rax, Reg::Rax);
        model.clear();
        Ok(())
    }

    /// `use name;`, `use "path.sb";` or `use native <header>;`
    fn import(&mut self) -> Result<Step, CompileError> {
        if !self.peek().is_keyword("use") {
            return Ok(Step::NoMatch);
        }
        let line = self.line();
        if self.scope.is_some() {
            return Err(SyntaxError::Expected {
                expected: "declaration".into(),
                found: "use".into(),
                line,
            }
            .into());
        }
        self.pos += 1;
        if self.peek().is_keyword("native") {
            self.pos += 1;
            return self.native(line);
        }

        let tok = self.advance();
        let file = match tok.kind {
            TokenKind::StringLiteral => tok.text,
            TokenKind::Identifier => format!("{}.sb", tok.text),
            TokenKind::End => return Err(SyntaxError::UnexpectedEof { line }.into()),
            _ => {
                return Err(SyntaxError::Expected {
                    expected: "import path".into(),
                    found: tok.text,
                    line,
                }
                .into());
            }
        };
        self.expect_punct(";")?;

        let path = self.dir.join(&file);
        let unit = path.canonicalize().map_err(|_| SemanticError::ImportNotFound {
            path: path.display().to_string(),
            line,
        })?;
        if let Some(start) = self.comp.import_stack.iter().position(|p| *p == unit) {
            let cycle = self.comp.import_stack[start..]
                .iter()
                .chain(std::iter::once(&unit))
                .map(|p| display_name(p))
                .collect::<Vec<_>>()
                .join(" -> ");
            return Err(SemanticError::CircularImport { cycle, line }.into());
        }
        if self.comp.imported.contains(&unit) {
            self.comp
                .info(Some(line), format!("'{file}' is already compiled, skipping"));
            return Ok(Step::Matched);
        }

        let source = fs::read_to_string(&unit).map_err(|source| CompileError::Io {
            path: unit.clone(),
            source,
        })?;
        self.comp
            .compile_unit(&source, Some(&unit))
            .map_err(|err| CompileError::Import {
                path: unit.clone(),
                line,
                source: Box::new(err),
            })?;
        Ok(Step::Matched)
    }

    /// `use native int puts(char* s);` declares a function resolved at link time.
    fn native(&mut self, line: usize) -> Result<Step, CompileError> {
        let Some(ty) = self.parse_type()? else {
            let tok = self.peek();
            return Err(SemanticError::MissingType {
                name: tok.text.clone(),
                line: tok.line,
            }
            .into());
        };
        let name = self.expect_identifier("function name")?;
        self.expect_punct("(")?;

        let table = &self.comp.table;
        if let Some(existing) = table.lookup_immediate(&name.text, None)
            && table
                .get(existing)
                .function_info()
                .is_some_and(|info| info.external)
        {
            // another unit already declared it
            self.pos = self.statement_end()? + 1;
            return Ok(Step::Matched);
        }

        let info = FunctionInfo {
            external: true,
            defined: true,
            ..FunctionInfo::default()
        };
        let mut sym = Symbol::new(&name.text, ty, SymbolKind::Function(info), None).with_line(line);
        sym.global_label = true;
        let id = self.insert(sym)?;
        let params = self.parameters(id, 0)?;
        self.comp.table.prune_scope(id);
        if let Some(info) = self.comp.table.get_mut(id).function_info_mut() {
            info.params = params;
        }
        self.expect_punct(";")?;
        let label = self.comp.table.label(id);
        self.comp.asm.declare_external(&label);
        Ok(Step::Matched)
    }

    /// Parameter list after `(`, through the closing `)`.
    ///
    /// Parameters live in the caller's home slots above the return address;
    /// `shift` leaves room for a hidden `this`.
    fn parameters(&mut self, function: SymbolId, shift: usize) -> Result<Vec<SymbolId>, CompileError> {
        let mut params = Vec::new();
        if self.peek().is_punct(")") {
            self.pos += 1;
            return Ok(params);
        }
        loop {
            let line = self.line();
            let Some(ty) = self.parse_type_in(Some(function))? else {
                let tok = self.peek();
                return Err(match tok.kind {
                    TokenKind::Identifier => SemanticError::MissingType {
                        name: tok.text.clone(),
                        line,
                    }
                    .into(),
                    TokenKind::End => SyntaxError::UnexpectedEof { line }.into(),
                    _ => SyntaxError::MalformedArguments { line }.into(),
                });
            };
            if ty.is_void(&self.comp.table) {
                return Err(SemanticError::TypeMismatch {
                    expected: "a parameter type".into(),
                    found: "void".into(),
                    line,
                }
                .into());
            }
            let name = self.expect_identifier("parameter name")?;
            let mut sym = Symbol::new(&name.text, ty, SymbolKind::Parameter, Some(function)).with_line(line);
            sym.offset = 16 + 8 * (params.len() + shift) as i32;
            params.push(self.insert(sym)?);

            let sep = self.advance();
            if sep.is_punct(",") {
                continue;
            }
            if sep.is_punct(")") {
                return Ok(params);
            }
            return Err(match sep.kind {
                TokenKind::End => SyntaxError::UnexpectedEof { line: sep.line }.into(),
                _ => SyntaxError::MalformedArguments { line: sep.line }.into(),
            });
        }
    }

    /// `[visibility] type name(params) { ... }` or `;`, methods and
    /// constructors included.
    fn function_header(&mut self) -> Result<Step, CompileError> {
        let start = self.pos;
        let visibility = self.visibility();
        let place = self.place();
        let line = self.line();

        let constructor = match place {
            Place::Object(obj)
                if self.peek().kind == TokenKind::Identifier
                    && self.peek().text == self.comp.table.get(obj).name
                    && self.peek_at(1).is_punct("(") =>
            {
                Some(obj)
            }
            _ => None,
        };
        let ret = match constructor {
            Some(obj) => FullType::new(obj),
            None => match self.parse_type()? {
                Some(ty)
                    if self.peek().kind == TokenKind::Identifier && self.peek_at(1).is_punct("(") =>
                {
                    ty
                }
                _ => {
                    self.pos = start;
                    return Ok(Step::NoMatch);
                }
            },
        };
        let name = self.advance();
        self.pos += 1;

        let (kind, shift) = match place {
            Place::Struct(ty) => {
                return Err(SemanticError::MethodInStruct {
                    ty: self.comp.table.get(ty).name.clone(),
                    line,
                }
                .into());
            }
            Place::Code => {
                return Err(SyntaxError::Expected {
                    expected: "statement".into(),
                    found: format!("definition of '{}'", name.text),
                    line,
                }
                .into());
            }
            Place::Object(_) if constructor.is_some() => {
                (SymbolKind::Constructor(FunctionInfo::default()), 1)
            }
            Place::Object(_) => (SymbolKind::Method(FunctionInfo::default()), 1),
            Place::Global | Place::Namespace => (SymbolKind::Function(FunctionInfo::default()), 0),
        };

        let existing = self.comp.table.lookup_immediate(&name.text, self.scope);
        let id = match existing {
            Some(id)
                if self
                    .comp
                    .table
                    .get(id)
                    .function_info()
                    .is_some_and(|info| !info.defined && !info.external) =>
            {
                id
            }
            Some(_) => {
                return Err(SemanticError::Redeclaration {
                    name: name.text,
                    line,
                }
                .into());
            }
            None => {
                let mut sym = Symbol::new(&name.text, ret.clone(), kind, self.scope).with_line(line);
                if let Some(visibility) = visibility {
                    sym.visibility = visibility;
                }
                let id = self.insert(sym)?;
                self.register_member(id, place);
                id
            }
        };

        if let Place::Object(obj) = place {
            let mut this = Symbol::new("this", FullType::new(obj), SymbolKind::Parameter, Some(id)).with_line(line);
            this.offset = 16;
            self.insert(this)?;
        }
        let params = self.parameters(id, shift)?;

        let definition = if self.peek().is_punct("{") {
            true
        } else if self.peek().is_punct(";") {
            false
        } else {
            return Err(self.unexpected("'{' or ';'"));
        };
        self.pos += 1;

        if existing.is_some() {
            if !definition {
                return Err(SemanticError::Redeclaration {
                    name: name.text,
                    line,
                }
                .into());
            }
            self.check_signature(id, &ret, &params, line)?;
        }
        if let Some(info) = self.comp.table.get_mut(id).function_info_mut() {
            info.params = params;
            info.defined = definition;
        }

        if definition {
            self.begin_function(id, place, line);
        } else {
            self.comp.table.prune_scope(id);
        }
        Ok(Step::Matched)
    }

    fn register_member(&mut self, id: SymbolId, place: Place) {
        let Place::Object(obj) = place else {
            return;
        };
        let constructor = matches!(self.comp.table.get(id).kind, SymbolKind::Constructor(_));
        if let Some(info) = self.comp.table.get_mut(obj).type_info_mut() {
            if constructor {
                info.constructor = Some(id);
            } else {
                info.methods.push(id);
            }
        }
    }

    /// A definition must agree with its forward declaration.
    fn check_signature(
        &self,
        id: SymbolId,
        ret: &FullType,
        params: &[SymbolId],
        line: usize,
    ) -> Result<(), CompileError> {
        let table = &self.comp.table;
        let sym = table.get(id);
        let declared = sym
            .function_info()
            .map(|info| info.params.as_slice())
            .unwrap_or_default();
        if declared.len() != params.len() {
            return Err(SemanticError::ArityMismatch {
                name: sym.name.clone(),
                expected: declared.len(),
                found: params.len(),
                line,
            }
            .into());
        }
        let pairs = declared
            .iter()
            .zip(params)
            .map(|(old, new)| (&table.get(*old).ty, &table.get(*new).ty))
            .chain(std::iter::once((&sym.ty, ret)));
        for (old, new) in pairs {
            if !old.same_as(new) {
                return Err(SemanticError::TypeMismatch {
                    expected: old.describe(table),
                    found: new.describe(table),
                    line,
                }
                .into());
            }
        }
        Ok(())
    }

    fn begin_function(&mut self, id: SymbolId, place: Place, line: usize) {
        let label = self.comp.table.label(id);
        let sub = self.comp.asm.enter_subroutine(&label);
        if place == Place::Global && self.comp.table.get(id).name == "main" {
            self.comp.asm.declare_global(&label);
        }
        self.scope = Some(id);
        self.function = Some(id);
        self.current = Some(sub);
        self.model.reset();

        let table = &self.comp.table;
        let sym = table.get(id);
        let owner = sym.scope;
        let shift = usize::from(matches!(place, Place::Object(_)));
        let mut homes: Vec<(usize, SymbolId)> = Vec::new();
        if matches!(sym.kind, SymbolKind::Method(_))
            && let Some(this) = table.lookup_immediate("this", Some(id))
        {
            homes.push((0, this));
        }
        let params = sym
            .function_info()
            .map(|info| info.params.as_slice())
            .unwrap_or_default();
        homes.extend(params.iter().enumerate().map(|(i, p)| (i + shift, *p)));
        let constructor = matches!(sym.kind, SymbolKind::Constructor(_));

        let mut em = Emitter {
            asm: &mut self.comp.asm,
            table,
            sub,
            line,
        };
        // register arguments go to their home slots before anything can clobber them
        for (position, param) in homes.into_iter().filter(|(p, _)| *p < INT_ARGS.len()) {
            let param = table.get(param);
            let home = Operand::mem(Reg::Rbp, param.offset, Size::Qword);
            if param.ty.is_float(table) {
                let (mov, size) = float_move(&param.ty, table);
                em.op(mov, home.with_size(Some(size)), FLOAT_ARGS[position]);
            } else {
                em.op(Opcode::Mov, home, INT_ARGS[position]);
            }
        }
        if constructor && let Some(obj) = owner {
            let size = Operand::Label(format!("{}.__size", table.label(obj)));
            allocate_this(&mut em, size);
        }
    }

    fn if_block(&mut self) -> Result<Step, CompileError> {
        if !self.peek().is_keyword("if") {
            return Ok(Step::NoMatch);
        }
        self.branch(false)
    }

    fn while_block(&mut self) -> Result<Step, CompileError> {
        if !self.peek().is_keyword("while") {
            return Ok(Step::NoMatch);
        }
        self.branch(true)
    }

    /// Splits the current subroutine into a body and the code after it.
    fn branch(&mut self, looping: bool) -> Result<Step, CompileError> {
        let line = self.line();
        let (Some(function), Some(current)) = (self.function, self.current) else {
            return Err(SemanticError::OutsideFunction { line }.into());
        };
        self.pos += 1;
        self.expect_punct("(")?;
        let start = self.pos;
        let end = self.closing_paren()?;
        self.pos = end + 1;
        self.condition(start..end, self.scope)?;

        let n = self.comp.asm.fresh();
        let label = self.comp.table.label(function);
        let keyword = if looping { "while" } else { "if" };
        let body_name = format!("{label}.{keyword}{n}");
        let after_name = format!("{label}.end{n}");
        let asm = &mut self.comp.asm;
        asm.emit(current, Instruction::unary(Opcode::Jnz, Operand::Label(body_name.clone())));
        asm.emit(current, Instruction::unary(Opcode::Jmp, Operand::Label(after_name.clone())));
        let (body, after) = asm.split(current, &body_name, &after_name);

        let info = BlockInfo {
            body,
            after,
            condition: looping.then_some(start..end),
        };
        let kind = if looping {
            SymbolKind::WhileBlock(info)
        } else {
            SymbolKind::IfBlock(info)
        };
        let block = Symbol::new(&format!("{keyword}#{n}"), FullType::new(VOID), kind, self.scope).with_line(line);
        let id = self.insert(block)?;
        self.scope = Some(id);
        self.current = Some(body);
        self.expect_punct("{")?;
        self.model.clear();
        Ok(Step::Matched)
    }

    fn block_exit(&mut self) -> Result<Step, CompileError> {
        if !self.peek().is_punct("}") {
            return Ok(Step::NoMatch);
        }
        let line = self.line();
        self.pos += 1;
        let Some(scope) = self.scope else {
            return Err(SemanticError::ScopeUnderflow { line }.into());
        };
        let sym = self.comp.table.get(scope);
        let parent = sym.scope;
        match sym.kind.clone() {
            SymbolKind::IfBlock(info) => {
                self.comp.table.prune_scope(scope);
                self.scope = parent;
                self.current = Some(info.after);
            }
            SymbolKind::WhileBlock(info) => {
                self.comp.table.prune_scope(scope);
                self.scope = parent;
                if let Some(range) = info.condition {
                    self.condition(range, parent)?;
                    let body = self.comp.asm.subroutine(info.body).name.clone();
                    if let Some(tail) = self.current {
                        self.comp
                            .asm
                            .emit(tail, Instruction::unary(Opcode::Jnz, Operand::Label(body)));
                    }
                }
                self.current = Some(info.after);
            }
            SymbolKind::Function(_) | SymbolKind::Method(_) | SymbolKind::Constructor(_) => {
                self.end_function(scope);
            }
            SymbolKind::ObjectType(info) => {
                let label = self.comp.table.label(scope);
                self.comp
                    .asm
                    .write_data(format!("{label}.__size equ {}", info.size));
                self.scope = parent;
            }
            _ => self.scope = parent,
        }
        self.model.clear();
        Ok(Step::Matched)
    }

    fn end_function(&mut self, id: SymbolId) {
        let sym = self.comp.table.get(id);
        let parent = sym.scope;
        let constructor = matches!(sym.kind, SymbolKind::Constructor(_));
        let label = self.comp.table.label(id);
        if constructor && let Some(tail) = self.current {
            let this = Operand::mem(Reg::Rbp, 16, Size::Qword);
            self.comp
                .asm
                .emit(tail, Instruction::binary(Opcode::Mov, Reg::Rax, this));
        }
        if let Some(root) = self.comp.asm.find(&label) {
            self.comp.asm.reserve(root, self.model.frame_bytes());
        }
        self.comp.table.prune_scope(id);
        self.scope = parent;
        self.function = None;
        self.current = None;
        self.model.reset();
    }

    fn return_statement(&mut self) -> Result<Step, CompileError> {
        if !self.peek().is_keyword("return") {
            return Ok(Step::NoMatch);
        }
        let line = self.line();
        let Some(function) = self.function else {
            return Err(SemanticError::OutsideFunction { line }.into());
        };
        self.pos += 1;
        let end = self.statement_end()?;
        let range = self.pos..end;
        self.pos = end + 1;

        let sym = self.comp.table.get(function);
        let ret = sym.ty.clone();
        let constructor = matches!(sym.kind, SymbolKind::Constructor(_));
        let scope = self.scope;
        let table = &self.comp.table;

        if constructor {
            if !range.is_empty() {
                return Err(SemanticError::TypeMismatch {
                    expected: "no value in a constructor".into(),
                    found: "a return value".into(),
                    line,
                }
                .into());
            }
            let (mut em, _) = self.emitter(line)?;
            em.op(Opcode::Mov, Reg::Rax, Operand::mem(Reg::Rbp, 16, Size::Qword));
        } else if range.is_empty() {
            if !ret.is_void(table) {
                return Err(SemanticError::TypeMismatch {
                    expected: ret.describe(table),
                    found: "nothing".into(),
                    line,
                }
                .into());
            }
        } else {
            if ret.is_void(table) {
                return Err(SemanticError::TypeMismatch {
                    expected: "void".into(),
                    found: "a return value".into(),
                    line,
                }
                .into());
            }
            let value = self.evaluate(range, scope)?.ok_or(SyntaxError::MissingOperand {
                op: "return".into(),
                line,
            })?;
            let table = &self.comp.table;
            if value.is_float(table) && !ret.is_float(table) && !ret.is_integral(table) {
                return Err(SemanticError::TypeMismatch {
                    expected: ret.describe(table),
                    found: value.describe(table),
                    line,
                }
                .into());
            }
            let reg = if ret.is_float(table) { Reg::Xmm0 } else { Reg::Rax };
            let (mut em, model) = self.emitter(line)?;
            model.take_as(&mut em, reg, &ret)?;
        }

        let (mut em, model) = self.emitter(line)?;
        em.asm.emit_epilogue(em.sub);
        em.emit(Instruction::bare(Opcode::Ret));
        // nothing after the `ret` is reachable
        em.asm.set_ending(em.sub, Ending::Nothing);
        model.clear();
        Ok(Step::Matched)
    }

    fn delete_statement(&mut self) -> Result<Step, CompileError> {
        if !self.peek().is_keyword("delete") {
            return Ok(Step::NoMatch);
        }
        let line = self.line();
        self.pos += 1;
        let end = self.statement_end()?;
        let range = self.pos..end;
        self.pos = end + 1;
        if range.is_empty() {
            return Err(SyntaxError::MissingOperand {
                op: "delete".into(),
                line,
            }
            .into());
        }
        let scope = self.scope;
        let items = parse_expression(&self.tokens[range], &self.comp.table, scope)?;
        let (mut em, model) = self.emitter(line)?;
        codegen::delete(&items, model, &mut em, scope)?;
        model.clear();
        Ok(Step::Matched)
    }

    /// `[visibility] type name [= expr];` as a global, field or local.
    fn variable(&mut self) -> Result<Step, CompileError> {
        let start = self.pos;
        let visibility = self.visibility();
        let line = self.line();
        let Some(ty) = self.parse_type()? else {
            self.pos = start;
            return Ok(Step::NoMatch);
        };
        if self.peek().kind != TokenKind::Identifier {
            self.pos = start;
            return Ok(Step::NoMatch);
        }
        let name_at = self.pos;
        let name = self.advance();
        if ty.is_void(&self.comp.table) {
            return Err(SemanticError::TypeMismatch {
                expected: "a value type".into(),
                found: "void".into(),
                line,
            }
            .into());
        }

        let mut sym = Symbol::new(&name.text, ty.clone(), SymbolKind::LocalVariable, self.scope).with_line(line);
        if let Some(visibility) = visibility {
            sym.visibility = visibility;
        }
        match self.place() {
            Place::Global | Place::Namespace => {
                sym.kind = SymbolKind::GlobalVariable;
                let id = self.insert(sym)?;
                if self.peek().is_punct("=") {
                    let end = self.statement_end()?;
                    let items = parse_expression(&self.tokens[name_at..end], &self.comp.table, self.scope)?;
                    self.pos = end + 1;
                    fold_global(&items, &self.comp.table, &mut self.comp.asm, line)?;
                } else {
                    self.expect_punct(";")?;
                    let label = self.comp.table.label(id);
                    let directive = reserve_directive(ty.size(&self.comp.table));
                    self.comp.asm.set_section(Section::Bss);
                    self.comp.asm.write(format!("{label} {directive} 1"));
                }
            }
            Place::Struct(owner) | Place::Object(owner) => {
                if !self.peek().is_punct(";") {
                    return Err(self.unexpected("';'"));
                }
                self.pos += 1;
                let table = &mut self.comp.table;
                let size = ty.size(table);
                sym.kind = SymbolKind::StructField;
                sym.offset = table
                    .get(owner)
                    .type_info()
                    .map(|info| info.size as i32)
                    .unwrap_or_default();
                let id = table.insert(sym)?;
                if let Some(info) = table.get_mut(owner).type_info_mut() {
                    info.size += size;
                    info.fields.push(id);
                }
            }
            Place::Code => {
                sym.offset = self.model.reserve_local(ty.size(&self.comp.table));
                self.insert(sym)?;
                if self.peek().is_punct("=") {
                    let end = self.statement_end()?;
                    let scope = self.scope;
                    self.evaluate(name_at..end, scope)?;
                    self.pos = end + 1;
                    self.model.clear();
                } else {
                    self.expect_punct(";")?;
                }
            }
        }
        Ok(Step::Matched)
    }

    fn struct_type(&mut self) -> Result<Step, CompileError> {
        self.aggregate("type", false)
    }

    fn object_type(&mut self) -> Result<Step, CompileError> {
        self.aggregate("object", true)
    }

    fn aggregate(&mut self, keyword: &str, object: bool) -> Result<Step, CompileError> {
        if !self.peek().is_keyword(keyword) {
            return Ok(Step::NoMatch);
        }
        let line = self.line();
        self.pos += 1;
        let name = self.expect_identifier("type name")?;
        if self.peek().is_keyword("extends") {
            return Err(UnimplementedError::Inheritance { line: self.line() }.into());
        }
        if !matches!(self.place(), Place::Global | Place::Namespace) {
            return Err(SyntaxError::Expected {
                expected: "statement".into(),
                found: format!("{keyword} {}", name.text),
                line,
            }
            .into());
        }
        self.expect_punct("{")?;

        let kind = if object {
            SymbolKind::ObjectType(TypeInfo::default())
        } else {
            SymbolKind::StructType(TypeInfo::default())
        };
        let id = self.insert(Symbol::new(&name.text, FullType::new(VOID), kind, self.scope).with_line(line))?;
        self.comp.table.get_mut(id).ty = FullType::new(id);
        self.scope = Some(id);
        Ok(Step::Matched)
    }

    /// `namespace name {`; reopening an existing namespace extends it.
    fn namespace(&mut self) -> Result<Step, CompileError> {
        if !self.peek().is_keyword("namespace") {
            return Ok(Step::NoMatch);
        }
        let line = self.line();
        self.pos += 1;
        let name = self.expect_identifier("namespace name")?;
        if !matches!(self.place(), Place::Global | Place::Namespace) {
            return Err(SyntaxError::Expected {
                expected: "statement".into(),
                found: format!("namespace {}", name.text),
                line,
            }
            .into());
        }
        self.expect_punct("{")?;

        let table = &self.comp.table;
        let existing = table
            .lookup_immediate(&name.text, self.scope)
            .filter(|id| table.get(*id).kind == SymbolKind::Namespace);
        let id = match existing {
            Some(id) => id,
            None => self.insert(
                Symbol::new(&name.text, FullType::new(VOID), SymbolKind::Namespace, self.scope).with_line(line),
            )?,
        };
        self.scope = Some(id);
        Ok(Step::Matched)
    }

    fn expression_statement(&mut self) -> Result<(), CompileError> {
        let line = self.line();
        if self.current.is_none() {
            return Err(SemanticError::OutsideFunction { line }.into());
        }
        let end = self.statement_end()?;
        let range = self.pos..end;
        self.pos = end + 1;
        if !range.is_empty() {
            let scope = self.scope;
            self.evaluate(range, scope)?;
        }
        self.model.clear();
        Ok(())
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
