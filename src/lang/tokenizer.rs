use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub line: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Keyword,
    Identifier,
    Punctuator,
    Constant,
    StringLiteral,
    End,
}

impl Token {
    pub fn is(&self, kind: TokenKind, text: &str) -> bool {
        self.kind == kind && self.text == text
    }

    pub fn is_punct(&self, text: &str) -> bool {
        self.is(TokenKind::Punctuator, text)
    }

    pub fn is_keyword(&self, text: &str) -> bool {
        self.is(TokenKind::Keyword, text)
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TokenKind::Keyword => "keyword",
            TokenKind::Identifier => "identifier",
            TokenKind::Punctuator => "punctuator",
            TokenKind::Constant => "constant",
            TokenKind::StringLiteral => "string",
            TokenKind::End => "end",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenizeError {
    #[error("unexpected character '{ch}'")]
    UnexpectedChar { ch: char, line: usize },
    #[error("unterminated string literal")]
    UnterminatedString { line: usize },
    #[error("invalid numeric literal '{text}'")]
    InvalidNumber { text: String, line: usize },
    #[error("unknown escape sequence '\\{ch}'")]
    UnknownEscape { ch: char, line: usize },
}

impl TokenizeError {
    pub fn line(&self) -> usize {
        match self {
            TokenizeError::UnexpectedChar { line, .. }
            | TokenizeError::UnterminatedString { line }
            | TokenizeError::InvalidNumber { line, .. }
            | TokenizeError::UnknownEscape { line, .. } => *line,
        }
    }
}

pub const KEYWORDS: &[&str] = &[
    "use",
    "native",
    "public",
    "private",
    "protected",
    "signed",
    "unsigned",
    "short",
    "long",
    "const",
    "volatile",
    "return",
    "delete",
    "if",
    "while",
    "type",
    "object",
    "namespace",
    "extends",
    "void",
    "bool",
    "char",
    "int",
    "float",
    "double",
];

const LONG_PUNCTUATORS: &[&str] = &["~=", "=>", "==", "!=", "<=", ">=", "&&", "||", "::"];
const SHORT_PUNCTUATORS: &[u8] = b"+-*/%=<>!&()[]{},;.";

pub fn tokenize(input: &str) -> Result<Vec<Token>, TokenizeError> {
    let mut tokens = Vec::new();
    let bytes = input.as_bytes();
    let mut idx = 0;
    let mut line = 1;

    while idx < bytes.len() {
        let b = bytes[idx];
        if b == b'\n' {
            line += 1;
            idx += 1;
            continue;
        }
        if b.is_ascii_whitespace() {
            idx += 1;
            continue;
        }

        if input[idx..].starts_with("//") {
            while idx < bytes.len() && bytes[idx] != b'\n' {
                idx += 1;
            }
            continue;
        }

        if let Some(p) = LONG_PUNCTUATORS
            .iter()
            .find(|p| input[idx..].starts_with(**p))
        {
            tokens.push(Token {
                kind: TokenKind::Punctuator,
                text: p.to_string(),
                line,
            });
            idx += p.len();
            continue;
        }
        if SHORT_PUNCTUATORS.contains(&b) {
            tokens.push(Token {
                kind: TokenKind::Punctuator,
                text: (b as char).to_string(),
                line,
            });
            idx += 1;
            continue;
        }

        if b == b'"' {
            let start_line = line;
            idx += 1;
            let mut value = String::new();
            loop {
                let Some(ch) = input[idx..].chars().next() else {
                    return Err(TokenizeError::UnterminatedString { line: start_line });
                };
                idx += ch.len_utf8();
                match ch {
                    '"' => break,
                    '\n' => return Err(TokenizeError::UnterminatedString { line: start_line }),
                    '\\' => {
                        let Some(esc) = input[idx..].chars().next() else {
                            return Err(TokenizeError::UnterminatedString { line: start_line });
                        };
                        idx += esc.len_utf8();
                        value.push(match esc {
                            'n' => '\n',
                            't' => '\t',
                            '\\' => '\\',
                            '"' => '"',
                            '0' => '\0',
                            other => return Err(TokenizeError::UnknownEscape { ch: other, line }),
                        });
                    }
                    other => value.push(other),
                }
            }
            tokens.push(Token {
                kind: TokenKind::StringLiteral,
                text: value,
                line: start_line,
            });
            continue;
        }

        if b.is_ascii_digit() {
            let start = idx;
            while idx < bytes.len() && (bytes[idx].is_ascii_alphanumeric() || bytes[idx] == b'_') {
                idx += 1;
            }
            if idx + 1 < bytes.len() && bytes[idx] == b'.' && bytes[idx + 1].is_ascii_digit() {
                idx += 1;
                while idx < bytes.len() && bytes[idx].is_ascii_alphanumeric() {
                    idx += 1;
                }
            }
            let text = &input[start..idx];
            let valid = if text.contains('.') {
                text.parse::<f64>().is_ok()
            } else {
                text.parse::<i64>().is_ok()
            };
            if !valid {
                return Err(TokenizeError::InvalidNumber {
                    text: text.to_string(),
                    line,
                });
            }
            tokens.push(Token {
                kind: TokenKind::Constant,
                text: text.to_string(),
                line,
            });
            continue;
        }

        if b.is_ascii_alphabetic() || b == b'_' {
            let start = idx;
            while idx < bytes.len() && (bytes[idx].is_ascii_alphanumeric() || bytes[idx] == b'_') {
                idx += 1;
            }
            let text = &input[start..idx];
            let kind = if KEYWORDS.contains(&text) {
                TokenKind::Keyword
            } else {
                TokenKind::Identifier
            };
            tokens.push(Token {
                kind,
                text: text.to_string(),
                line,
            });
            continue;
        }

        let ch = input[idx..].chars().next().unwrap_or('?');
        return Err(TokenizeError::UnexpectedChar { ch, line });
    }

    tokens.push(Token {
        kind: TokenKind::End,
        text: String::new(),
        line,
    });

    Ok(tokens)
}

/// One token per line as `line kind text`, for `-tokenize`.
pub fn dump(tokens: &[Token]) -> String {
    tokens
        .iter()
        .map(|t| format!("{} {} {}", t.line, t.kind, t.text.escape_debug()))
        .map(|l| l.trim_end().to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use insta::assert_snapshot;

    #[test]
    fn tokenizes_a_function_header() {
        let tokens = tokenize("public int main() {\n  return 5; // done\n}").unwrap();
        assert_snapshot!(dump(&tokens), @r"
        1 keyword public
        1 keyword int
        1 identifier main
        1 punctuator (
        1 punctuator )
        1 punctuator {
        2 keyword return
        2 constant 5
        2 punctuator ;
        3 punctuator }
        3 end
        ");
    }

    #[test]
    fn longest_punctuator_wins() {
        let tokens = tokenize("p ~= 4 => float == b").unwrap();
        let puncts: Vec<_> = tokens
            .iter()
            .filter(|t| t.kind == TokenKind::Punctuator)
            .map(|t| t.text.as_str())
            .collect();
        assert_eq!(puncts, vec!["~=", "=>", "=="]);
    }

    #[test]
    fn unescapes_strings() {
        let tokens = tokenize(r#""a\tb\n""#).unwrap();
        assert_eq!(tokens[0].kind, TokenKind::StringLiteral);
        assert_eq!(tokens[0].text, "a\tb\n");
    }

    #[test]
    fn floats_keep_their_fraction() {
        let tokens = tokenize("1.5 + 2").unwrap();
        assert_eq!(tokens[0].text, "1.5");
        assert_eq!(tokens[2].text, "2");
    }

    #[test]
    fn errors_on_invalid_characters() {
        let err = tokenize("int x = 3 @ 4;").unwrap_err();
        assert_eq!(err, TokenizeError::UnexpectedChar { ch: '@', line: 1 });
    }

    #[test]
    fn errors_on_unterminated_string() {
        let err = tokenize("\n\"abc").unwrap_err();
        assert_eq!(err, TokenizeError::UnterminatedString { line: 2 });
    }

    #[test]
    fn rejects_malformed_numbers() {
        let err = tokenize("12ab").unwrap_err();
        assert!(matches!(err, TokenizeError::InvalidNumber { .. }));
    }
}
