pub mod codegen;
pub mod constant;
pub mod expr;
pub mod parser;
pub mod stack;
pub mod symbols;
pub mod tokenizer;
pub mod types;

use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub use parser::Compilation;
pub use tokenizer::{Token, TokenKind, TokenizeError};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyntaxError {
    #[error("unexpected end of input")]
    UnexpectedEof { line: usize },
    #[error("expected {expected}, found '{found}'")]
    Expected {
        expected: String,
        found: String,
        line: usize,
    },
    #[error("malformed argument list")]
    MalformedArguments { line: usize },
    #[error("unbalanced '{delimiter}'")]
    Unbalanced { delimiter: String, line: usize },
    #[error("operator '{op}' is missing an operand")]
    MissingOperand { op: String, line: usize },
    #[error("block opened here is never closed")]
    UnclosedBlock { line: usize },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SemanticError {
    #[error("undefined symbol '{name}'")]
    Undefined { name: String, line: usize },
    #[error("'{name}' is already declared in this scope")]
    Redeclaration { name: String, line: usize },
    #[error("type specifier missing for '{name}'")]
    MissingType { name: String, line: usize },
    #[error("'{name}' expects {expected} arguments, found {found}")]
    ArityMismatch {
        name: String,
        expected: usize,
        found: usize,
        line: usize,
    },
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: String,
        found: String,
        line: usize,
    },
    #[error("'{name}' is not a constant and cannot appear in a global initializer")]
    NonConstant { name: String, line: usize },
    #[error("operator '{op}' is not supported in a constant expression")]
    NonConstantOperator { op: String, line: usize },
    #[error("statements are only allowed inside a function")]
    OutsideFunction { line: usize },
    #[error("'}}' without an open scope")]
    ScopeUnderflow { line: usize },
    #[error("{what} is not assignable")]
    NotAssignable { what: String, line: usize },
    #[error("{what} is not a pointer")]
    NotPointer { what: String, line: usize },
    #[error("'{modifier}' cannot be applied to '{base}'")]
    InvalidModifier {
        modifier: String,
        base: String,
        line: usize,
    },
    #[error("'{ty}' has no member '{member}'")]
    UnknownMember {
        ty: String,
        member: String,
        line: usize,
    },
    #[error("member '{member}' of '{ty}' is private")]
    PrivateMember {
        ty: String,
        member: String,
        line: usize,
    },
    #[error("'{name}' cannot be called")]
    NotCallable { name: String, line: usize },
    #[error("'%' is not defined for floating-point operands")]
    FloatRemainder { line: usize },
    #[error("type '{ty}' cannot declare methods")]
    MethodInStruct { ty: String, line: usize },
    #[error("import '{path}' not found")]
    ImportNotFound { path: String, line: usize },
    #[error("circular import detected: {cycle}")]
    CircularImport { cycle: String, line: usize },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UnimplementedError {
    #[error("inheritance ('extends') is not implemented")]
    Inheritance { line: usize },
    #[error("pointer arithmetic is not implemented; index the pointer instead")]
    PointerArithmetic { line: usize },
    #[error("casting to object type '{ty}' is not implemented")]
    ObjectCast { ty: String, line: usize },
    #[error("the scope resolution operator '::' is not implemented")]
    ScopeResolution { line: usize },
    #[error("array types are obsolete; use a pointer")]
    ArrayType { line: usize },
}

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("{0}")]
    Tokenize(#[from] TokenizeError),
    #[error("{0}")]
    Syntax(#[from] SyntaxError),
    #[error("{0}")]
    Semantic(#[from] SemanticError),
    #[error("{0}")]
    Unimplemented(#[from] UnimplementedError),
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("in unit imported from {}: {source}", path.display())]
    Import {
        path: PathBuf,
        line: usize,
        source: Box<CompileError>,
    },
}

impl SyntaxError {
    pub fn line(&self) -> usize {
        match self {
            SyntaxError::UnexpectedEof { line }
            | SyntaxError::Expected { line, .. }
            | SyntaxError::MalformedArguments { line }
            | SyntaxError::Unbalanced { line, .. }
            | SyntaxError::MissingOperand { line, .. }
            | SyntaxError::UnclosedBlock { line } => *line,
        }
    }
}

impl SemanticError {
    pub fn line(&self) -> usize {
        match self {
            SemanticError::Undefined { line, .. }
            | SemanticError::Redeclaration { line, .. }
            | SemanticError::MissingType { line, .. }
            | SemanticError::ArityMismatch { line, .. }
            | SemanticError::TypeMismatch { line, .. }
            | SemanticError::NonConstant { line, .. }
            | SemanticError::NonConstantOperator { line, .. }
            | SemanticError::OutsideFunction { line }
            | SemanticError::ScopeUnderflow { line }
            | SemanticError::NotAssignable { line, .. }
            | SemanticError::NotPointer { line, .. }
            | SemanticError::InvalidModifier { line, .. }
            | SemanticError::UnknownMember { line, .. }
            | SemanticError::PrivateMember { line, .. }
            | SemanticError::NotCallable { line, .. }
            | SemanticError::FloatRemainder { line }
            | SemanticError::MethodInStruct { line, .. }
            | SemanticError::ImportNotFound { line, .. }
            | SemanticError::CircularImport { line, .. } => *line,
        }
    }
}

impl UnimplementedError {
    pub fn line(&self) -> usize {
        match self {
            UnimplementedError::Inheritance { line }
            | UnimplementedError::PointerArithmetic { line }
            | UnimplementedError::ObjectCast { line, .. }
            | UnimplementedError::ScopeResolution { line }
            | UnimplementedError::ArrayType { line } => *line,
        }
    }
}

impl CompileError {
    /// Source line of the offending token, when the error came from source text.
    pub fn line(&self) -> Option<usize> {
        match self {
            CompileError::Tokenize(e) => Some(e.line()),
            CompileError::Syntax(e) => Some(e.line()),
            CompileError::Semantic(e) => Some(e.line()),
            CompileError::Unimplemented(e) => Some(e.line()),
            CompileError::Io { .. } => None,
            CompileError::Import { line, .. } => Some(*line),
        }
    }
}

/// Non-fatal, purely advisory message produced while compiling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub line: Option<usize>,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "{line}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Compile a source string whose imports resolve relative to the working directory.
pub fn compile_source(source: &str) -> Result<Compilation, CompileError> {
    let mut comp = Compilation::new();
    comp.compile_unit(source, None)?;
    Ok(comp)
}

/// Read and compile a source file; imports resolve next to it.
pub fn compile_file(path: &Path) -> Result<Compilation, CompileError> {
    let source = std::fs::read_to_string(path).map_err(|source| CompileError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut comp = Compilation::new();
    comp.compile_unit(&source, Some(path))?;
    Ok(comp)
}

/// Render a human-friendly error with the offending source line.
pub fn format_error(source: &str, err: &CompileError) -> String {
    match err.line() {
        Some(line) => render_snippet(source, line, &err.to_string()),
        None => err.to_string(),
    }
}

fn render_snippet(source: &str, line_num: usize, message: &str) -> String {
    let line_text = source
        .lines()
        .nth(line_num.saturating_sub(1))
        .unwrap_or_default();
    let indent = line_text.len() - line_text.trim_start().len();
    let width = usize::max(1, line_text.trim().chars().count());
    let underline = format!("{}{}", " ".repeat(indent), "^".repeat(width));

    let gutter_width = format!("{}", line_num).len();

    let mut out = String::new();
    out.push_str(&format!("{line_num}: {message}\n"));
    out.push_str(&format!(
        "{:>width$} | {}\n",
        line_num,
        line_text,
        width = gutter_width
    ));
    out.push_str(&format!(
        "{:>width$} | {}",
        "",
        underline,
        width = gutter_width
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use insta::assert_snapshot;

    #[test]
    fn formats_error_with_source_line() {
        let source = "public int main() {\n    return y;\n}\n";
        let err = compile_source(source).unwrap_err();
        assert_snapshot!(format_error(source, &err), @r"
        2: undefined symbol 'y'
        2 |     return y;
          |     ^^^^^^^^^
        ");
    }

    #[test]
    fn tokenize_errors_carry_lines() {
        let err = compile_source("int x = 1;\nint y = $;").unwrap_err();
        assert!(matches!(err, CompileError::Tokenize(_)));
        assert_eq!(err.line(), Some(2));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = compile_file(Path::new("definitely/not/here.sb")).unwrap_err();
        assert!(matches!(err, CompileError::Io { .. }));
        assert_eq!(err.line(), None);
    }
}
