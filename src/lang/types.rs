use std::collections::BTreeSet;

use crate::lang::symbols::{PrimitiveClass, SymbolId, SymbolKind, SymbolTable};
use crate::lang::tokenizer::{Token, TokenKind};
use crate::lang::{CompileError, SemanticError, UnimplementedError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Qualifier {
    Const,
    Volatile,
    Signed,
    Unsigned,
    Short,
    Long,
}

impl Qualifier {
    fn from_keyword(text: &str) -> Option<Self> {
        match text {
            "const" => Some(Qualifier::Const),
            "volatile" => Some(Qualifier::Volatile),
            "signed" => Some(Qualifier::Signed),
            "unsigned" => Some(Qualifier::Unsigned),
            "short" => Some(Qualifier::Short),
            "long" => Some(Qualifier::Long),
            _ => None,
        }
    }

    /// Modifiers that only make sense on an integral base.
    fn is_modifier(self) -> bool {
        matches!(
            self,
            Qualifier::Signed | Qualifier::Unsigned | Qualifier::Short | Qualifier::Long
        )
    }

    fn keyword(self) -> &'static str {
        match self {
            Qualifier::Const => "const",
            Qualifier::Volatile => "volatile",
            Qualifier::Signed => "signed",
            Qualifier::Unsigned => "unsigned",
            Qualifier::Short => "short",
            Qualifier::Long => "long",
        }
    }
}

/// A base type plus pointer depth and qualifiers. Identity is the base symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FullType {
    pub base: SymbolId,
    pub pointer_level: u32,
    pub qualifiers: BTreeSet<Qualifier>,
}

impl FullType {
    pub fn new(base: SymbolId) -> Self {
        FullType {
            base,
            pointer_level: 0,
            qualifiers: BTreeSet::new(),
        }
    }

    fn class(&self, table: &SymbolTable) -> Option<(PrimitiveClass, u32)> {
        match table.get(self.base).kind {
            SymbolKind::Primitive(class, size) => Some((class, size)),
            _ => None,
        }
    }

    /// Bytes a value of this type occupies in a variable or field.
    pub fn size(&self, table: &SymbolTable) -> u32 {
        if self.pointer_level > 0 {
            return 8;
        }
        match self.class(table) {
            Some((PrimitiveClass::Integral | PrimitiveClass::UnsignedIntegral, size)) => {
                if self.qualifiers.contains(&Qualifier::Long) {
                    8
                } else if self.qualifiers.contains(&Qualifier::Short) {
                    2
                } else {
                    size
                }
            }
            Some((_, size)) => size,
            // struct and object values are heap handles
            None => 8,
        }
    }

    pub fn is_void(&self, table: &SymbolTable) -> bool {
        self.pointer_level == 0 && matches!(self.class(table), Some((PrimitiveClass::Void, _)))
    }

    pub fn is_float(&self, table: &SymbolTable) -> bool {
        self.pointer_level == 0 && matches!(self.class(table), Some((PrimitiveClass::Floating, _)))
    }

    pub fn is_integral(&self, table: &SymbolTable) -> bool {
        self.pointer_level == 0
            && matches!(
                self.class(table),
                Some((PrimitiveClass::Integral | PrimitiveClass::UnsignedIntegral, _))
            )
    }

    pub fn is_unsigned(&self, table: &SymbolTable) -> bool {
        if self.pointer_level > 0 {
            return true;
        }
        match self.class(table) {
            Some((PrimitiveClass::UnsignedIntegral, _)) => true,
            Some((PrimitiveClass::Integral, _)) => self.qualifiers.contains(&Qualifier::Unsigned),
            _ => false,
        }
    }

    pub fn is_pointer(&self) -> bool {
        self.pointer_level > 0
    }

    /// A struct or object (not a pointer to one).
    pub fn is_aggregate(&self, table: &SymbolTable) -> bool {
        self.pointer_level == 0
            && matches!(
                table.get(self.base).kind,
                SymbolKind::StructType(_) | SymbolKind::ObjectType(_)
            )
    }

    pub fn deref(&self) -> Option<FullType> {
        (self.pointer_level > 0).then(|| FullType {
            base: self.base,
            pointer_level: self.pointer_level - 1,
            qualifiers: self.qualifiers.clone(),
        })
    }

    pub fn pointer_to(&self) -> FullType {
        FullType {
            base: self.base,
            pointer_level: self.pointer_level + 1,
            qualifiers: self.qualifiers.clone(),
        }
    }

    /// Same base and pointer depth; qualifiers are ignored.
    pub fn same_as(&self, other: &FullType) -> bool {
        self.base == other.base && self.pointer_level == other.pointer_level
    }

    pub fn describe(&self, table: &SymbolTable) -> String {
        let mut out = String::new();
        for q in &self.qualifiers {
            out.push_str(q.keyword());
            out.push(' ');
        }
        out.push_str(&table.get(self.base).name);
        for _ in 0..self.pointer_level {
            out.push('*');
        }
        out
    }
}

/// Parses `[modifiers] [qualifiers] base {*}` starting at `cursor`.
///
/// Returns the type and the cursor just past it, or `None` when no base type
/// name follows.
pub fn resolve_full_type(
    tokens: &[Token],
    cursor: usize,
    table: &SymbolTable,
    scope: Option<SymbolId>,
) -> Result<Option<(FullType, usize)>, CompileError> {
    let mut pos = cursor;
    let mut qualifiers = BTreeSet::new();
    while let Some(tok) = tokens.get(pos)
        && tok.kind == TokenKind::Keyword
        && let Some(q) = Qualifier::from_keyword(&tok.text)
    {
        qualifiers.insert(q);
        pos += 1;
    }

    let Some(tok) = tokens.get(pos) else {
        return Ok(None);
    };
    let base = match tok.kind {
        TokenKind::Keyword | TokenKind::Identifier => table.lookup(&tok.text, scope),
        _ => None,
    };
    let Some(base) = base.filter(|id| table.get(*id).is_type()) else {
        return Ok(None);
    };
    let line = tok.line;
    pos += 1;

    let mut ty = FullType {
        base,
        pointer_level: 0,
        qualifiers,
    };
    let integral = matches!(
        table.get(base).kind,
        SymbolKind::Primitive(PrimitiveClass::Integral | PrimitiveClass::UnsignedIntegral, _)
    );
    if !integral && let Some(q) = ty.qualifiers.iter().find(|q| q.is_modifier()) {
        return Err(SemanticError::InvalidModifier {
            modifier: q.keyword().to_string(),
            base: table.get(base).name.clone(),
            line,
        }
        .into());
    }

    while tokens.get(pos).is_some_and(|t| t.is_punct("*")) {
        ty.pointer_level += 1;
        pos += 1;
    }
    if let Some(t) = tokens.get(pos)
        && t.is_punct("[")
    {
        return Err(UnimplementedError::ArrayType { line: t.line }.into());
    }

    Ok(Some((ty, pos)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::tokenizer::tokenize;

    fn parse(src: &str) -> Result<Option<(FullType, usize)>, CompileError> {
        let table = SymbolTable::new();
        let tokens = tokenize(src).unwrap();
        resolve_full_type(&tokens, 0, &table, None)
    }

    #[test]
    fn resolves_pointer_depth() {
        let table = SymbolTable::new();
        let tokens = tokenize("char** name").unwrap();
        let (ty, next) = resolve_full_type(&tokens, 0, &table, None).unwrap().unwrap();
        assert_eq!(ty.pointer_level, 2);
        assert_eq!(next, 3);
        assert_eq!(ty.size(&table), 8);
        assert_eq!(ty.deref().unwrap().deref().unwrap().size(&table), 1);
        assert_eq!(ty.describe(&table), "char**");
    }

    #[test]
    fn modifiers_change_integral_width() {
        let table = SymbolTable::new();
        let tokens = tokenize("unsigned short int").unwrap();
        let (ty, _) = resolve_full_type(&tokens, 0, &table, None).unwrap().unwrap();
        assert_eq!(ty.size(&table), 2);
        assert!(ty.is_unsigned(&table));
        assert!(ty.is_integral(&table));
    }

    #[test]
    fn identifier_is_not_a_type() {
        assert!(parse("count = 3").unwrap().is_none());
    }

    #[test]
    fn signed_float_is_rejected() {
        let err = parse("signed float").unwrap_err();
        assert!(matches!(
            err,
            CompileError::Semantic(SemanticError::InvalidModifier { .. })
        ));
    }

    #[test]
    fn array_brackets_are_obsolete() {
        let err = parse("int[4] xs").unwrap_err();
        assert!(matches!(
            err,
            CompileError::Unimplemented(UnimplementedError::ArrayType { line: 1 })
        ));
    }
}
