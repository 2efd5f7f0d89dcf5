use std::collections::HashMap;
use std::ops::Range;

use crate::lang::SemanticError;
use crate::lang::types::FullType;
use crate::x64::SubroutineId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SymbolId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Public,
    Private,
    Protected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveClass {
    Void,
    Integral,
    UnsignedIntegral,
    Floating,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunctionInfo {
    pub params: Vec<SymbolId>,
    /// Declared with `use native`; has no body and skips arity checks.
    pub external: bool,
    pub defined: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    pub body: SubroutineId,
    pub after: SubroutineId,
    /// Token range of a `while` condition, re-evaluated at block exit.
    pub condition: Option<Range<usize>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypeInfo {
    pub fields: Vec<SymbolId>,
    pub methods: Vec<SymbolId>,
    pub constructor: Option<SymbolId>,
    pub size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymbolKind {
    Primitive(PrimitiveClass, u32),
    LocalVariable,
    GlobalVariable,
    Parameter,
    Function(FunctionInfo),
    Method(FunctionInfo),
    Constructor(FunctionInfo),
    IfBlock(BlockInfo),
    WhileBlock(BlockInfo),
    StructType(TypeInfo),
    ObjectType(TypeInfo),
    StructField,
    Namespace,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub ty: FullType,
    pub kind: SymbolKind,
    pub visibility: Visibility,
    pub namespace: Option<SymbolId>,
    /// Owning scope symbol; `None` is the global scope.
    pub scope: Option<SymbolId>,
    /// Frame offset from `rbp` for locals and parameters, byte offset for fields.
    pub offset: i32,
    /// The label is the bare name, without namespace or type qualification.
    pub global_label: bool,
    pub line: usize,
}

impl Symbol {
    pub fn new(name: &str, ty: FullType, kind: SymbolKind, scope: Option<SymbolId>) -> Self {
        Symbol {
            name: name.to_string(),
            ty,
            kind,
            visibility: Visibility::Public,
            namespace: None,
            scope,
            offset: 0,
            global_label: false,
            line: 0,
        }
    }

    pub fn with_line(mut self, line: usize) -> Self {
        self.line = line;
        self
    }

    pub fn is_type(&self) -> bool {
        matches!(
            self.kind,
            SymbolKind::Primitive(..) | SymbolKind::StructType(_) | SymbolKind::ObjectType(_)
        )
    }

    pub fn function_info(&self) -> Option<&FunctionInfo> {
        match &self.kind {
            SymbolKind::Function(info) | SymbolKind::Method(info) | SymbolKind::Constructor(info) => {
                Some(info)
            }
            _ => None,
        }
    }

    pub fn function_info_mut(&mut self) -> Option<&mut FunctionInfo> {
        match &mut self.kind {
            SymbolKind::Function(info) | SymbolKind::Method(info) | SymbolKind::Constructor(info) => {
                Some(info)
            }
            _ => None,
        }
    }

    pub fn type_info(&self) -> Option<&TypeInfo> {
        match &self.kind {
            SymbolKind::StructType(info) | SymbolKind::ObjectType(info) => Some(info),
            _ => None,
        }
    }

    pub fn type_info_mut(&mut self) -> Option<&mut TypeInfo> {
        match &mut self.kind {
            SymbolKind::StructType(info) | SymbolKind::ObjectType(info) => Some(info),
            _ => None,
        }
    }
}

/// Arena of every symbol ever declared plus a name index of the live ones.
///
/// Deleting a symbol only removes it from the name index so ids held by
/// function signatures and type layouts stay valid.
#[derive(Debug, Clone)]
pub struct SymbolTable {
    symbols: Vec<Symbol>,
    names: HashMap<String, Vec<SymbolId>>,
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

pub const VOID: SymbolId = SymbolId(0);

impl SymbolTable {
    pub fn new() -> Self {
        let mut table = SymbolTable {
            symbols: Vec::new(),
            names: HashMap::new(),
        };
        let primitives = [
            ("void", PrimitiveClass::Void, 0),
            ("bool", PrimitiveClass::UnsignedIntegral, 1),
            ("char", PrimitiveClass::Integral, 1),
            ("int", PrimitiveClass::Integral, 4),
            ("float", PrimitiveClass::Floating, 4),
            ("double", PrimitiveClass::Floating, 8),
        ];
        for (idx, (name, class, size)) in primitives.into_iter().enumerate() {
            let id = SymbolId(idx);
            table.symbols.push(Symbol::new(
                name,
                FullType::new(id),
                SymbolKind::Primitive(class, size),
                None,
            ));
            table.names.entry(name.to_string()).or_default().push(id);
        }
        table
    }

    pub fn primitive(&self, name: &str) -> SymbolId {
        self.lookup(name, None).unwrap_or(VOID)
    }

    pub fn get(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id.0]
    }

    pub fn get_mut(&mut self, id: SymbolId) -> &mut Symbol {
        &mut self.symbols[id.0]
    }

    /// Adds a symbol; fails if its name is already declared in the same scope.
    pub fn insert(&mut self, mut symbol: Symbol) -> Result<SymbolId, SemanticError> {
        if self.lookup_immediate(&symbol.name, symbol.scope).is_some() {
            return Err(SemanticError::Redeclaration {
                name: symbol.name,
                line: symbol.line,
            });
        }
        symbol.namespace = self
            .scope_chain(symbol.scope)
            .into_iter()
            .flatten()
            .find(|id| self.symbols[id.0].kind == SymbolKind::Namespace);
        let id = SymbolId(self.symbols.len());
        self.names.entry(symbol.name.clone()).or_default().push(id);
        self.symbols.push(symbol);
        Ok(id)
    }

    /// Nearest match walking outward from `from` to the global scope.
    pub fn lookup(&self, name: &str, from: Option<SymbolId>) -> Option<SymbolId> {
        let candidates = self.names.get(name)?;
        let chain = self.scope_chain(from);
        candidates
            .iter()
            .filter_map(|id| {
                let scope = self.symbols[id.0].scope;
                chain.iter().position(|s| *s == scope).map(|depth| (depth, *id))
            })
            .min_by_key(|(depth, _)| *depth)
            .map(|(_, id)| id)
    }

    pub fn lookup_immediate(&self, name: &str, scope: Option<SymbolId>) -> Option<SymbolId> {
        self.names
            .get(name)?
            .iter()
            .copied()
            .find(|id| self.symbols[id.0].scope == scope)
    }

    pub fn delete(&mut self, id: SymbolId) {
        let name = &self.symbols[id.0].name;
        if let Some(ids) = self.names.get_mut(name) {
            ids.retain(|other| *other != id);
            if ids.is_empty() {
                self.names.remove(name);
            }
        }
    }

    /// Deletes every live symbol owned by `scope`.
    pub fn prune_scope(&mut self, scope: SymbolId) {
        let owned: Vec<SymbolId> = self
            .names
            .values()
            .flatten()
            .copied()
            .filter(|id| self.symbols[id.0].scope == Some(scope))
            .collect();
        for id in owned {
            self.delete(id);
        }
    }

    /// `[from, parent(from), ..., None]`
    pub fn scope_chain(&self, from: Option<SymbolId>) -> Vec<Option<SymbolId>> {
        let mut chain = vec![from];
        let mut current = from;
        while let Some(id) = current {
            current = self.symbols[id.0].scope;
            chain.push(current);
        }
        chain
    }

    /// Nearest enclosing object or struct type.
    pub fn enclosing_type(&self, from: Option<SymbolId>) -> Option<SymbolId> {
        self.scope_chain(from)
            .into_iter()
            .flatten()
            .find(|id| self.symbols[id.0].type_info().is_some())
    }

    /// Member of a struct/object type by name, searching fields then methods.
    pub fn member(&self, ty: SymbolId, name: &str) -> Option<SymbolId> {
        let info = self.symbols[ty.0].type_info()?;
        info.fields
            .iter()
            .chain(info.methods.iter())
            .copied()
            .find(|id| self.symbols[id.0].name == name)
    }

    /// Assembly label: the name qualified by its owning type and namespaces.
    ///
    /// Labels carry NASM's `$` identifier prefix so a symbol named like a
    /// mnemonic or register (`add`, `test`, `rax`) still assembles as a label.
    pub fn label(&self, id: SymbolId) -> String {
        let sym = &self.symbols[id.0];
        if sym.global_label {
            return format!("${}", sym.name);
        }
        let mut parts = vec![sym.name.as_str()];
        if let Some(owner) = self.enclosing_type(sym.scope) {
            parts.push(&self.symbols[owner.0].name);
        }
        let mut namespace = sym.namespace;
        while let Some(ns) = namespace {
            parts.push(&self.symbols[ns.0].name);
            namespace = self.symbols[ns.0].namespace;
        }
        parts.reverse();
        format!("${}", parts.join("."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(table: &SymbolTable) -> FullType {
        FullType::new(table.primitive("int"))
    }

    fn block(table: &mut SymbolTable, name: &str, scope: Option<SymbolId>) -> SymbolId {
        let void = FullType::new(VOID);
        table
            .insert(Symbol::new(name, void, SymbolKind::Namespace, scope))
            .unwrap()
    }

    #[test]
    fn primitives_are_registered() {
        let table = SymbolTable::new();
        assert_eq!(table.primitive("void"), VOID);
        let double = table.get(table.primitive("double"));
        assert_eq!(double.kind, SymbolKind::Primitive(PrimitiveClass::Floating, 8));
    }

    #[test]
    fn shadowed_name_resolves_to_nearest_scope() {
        let mut table = SymbolTable::new();
        let ty = int(&table);
        let a = block(&mut table, "a", None);
        let b = block(&mut table, "b", Some(a));
        let c = block(&mut table, "c", Some(b));
        let sibling = block(&mut table, "sibling", Some(a));

        let outer = table
            .insert(Symbol::new("x", ty.clone(), SymbolKind::LocalVariable, Some(a)))
            .unwrap();
        let inner = table
            .insert(Symbol::new("x", ty, SymbolKind::LocalVariable, Some(b)))
            .unwrap();

        assert_eq!(table.lookup("x", Some(c)), Some(inner));
        assert_eq!(table.lookup("x", Some(b)), Some(inner));
        assert_eq!(table.lookup("x", Some(sibling)), Some(outer));
        assert_eq!(table.lookup("x", None), None);
    }

    #[test]
    fn redeclaration_in_same_scope_fails() {
        let mut table = SymbolTable::new();
        let ty = int(&table);
        let f = block(&mut table, "f", None);
        let g = block(&mut table, "g", None);
        table
            .insert(Symbol::new("x", ty.clone(), SymbolKind::LocalVariable, Some(f)))
            .unwrap();
        table
            .insert(Symbol::new("x", ty.clone(), SymbolKind::LocalVariable, Some(g)))
            .unwrap();
        let err = table
            .insert(Symbol::new("x", ty, SymbolKind::LocalVariable, Some(f)).with_line(7))
            .unwrap_err();
        assert_eq!(
            err,
            SemanticError::Redeclaration {
                name: "x".into(),
                line: 7
            }
        );
    }

    #[test]
    fn prune_removes_only_owned_symbols() {
        let mut table = SymbolTable::new();
        let ty = int(&table);
        let f = block(&mut table, "f", None);
        let local = table
            .insert(Symbol::new("x", ty.clone(), SymbolKind::LocalVariable, Some(f)))
            .unwrap();
        table
            .insert(Symbol::new("g", ty, SymbolKind::GlobalVariable, None))
            .unwrap();
        table.prune_scope(f);
        assert_eq!(table.lookup("x", Some(f)), None);
        assert!(table.lookup("g", Some(f)).is_some());
        // the arena keeps the record for signatures that reference it
        assert_eq!(table.get(local).name, "x");
    }

    #[test]
    fn labels_are_qualified_by_namespace() {
        let mut table = SymbolTable::new();
        let ty = int(&table);
        let ns = block(&mut table, "math", None);
        let f = table
            .insert(Symbol::new(
                "square",
                ty,
                SymbolKind::Function(FunctionInfo::default()),
                Some(ns),
            ))
            .unwrap();
        assert_eq!(table.label(f), "$math.square");
        assert_eq!(table.get(f).namespace, Some(ns));
    }
}
