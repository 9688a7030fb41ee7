//! SQL tokenizer.
//!
//! Tokens carry byte spans into the original statement so later stages can
//! re-emit unparsed stretches byte-for-byte. Comments and whitespace are
//! skipped; quoting styles: backticks and double quotes for identifiers,
//! single quotes (and double quotes in value position) for strings.

use std::fmt;
use std::iter::Peekable;
use std::str::CharIndices;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    Insert,
    Into,
    Values,
    Value,
    Update,
    Set,
    Where,
    Order,
    Limit,
    Null,
    Ignore,
    LowPriority,
    HighPriority,
    Delayed,
    As,
}

fn keyword(text: &str) -> Option<Keyword> {
    let upper = text.to_ascii_uppercase();
    let kw = match upper.as_str() {
        "INSERT" => Keyword::Insert,
        "INTO" => Keyword::Into,
        "VALUES" => Keyword::Values,
        "VALUE" => Keyword::Value,
        "UPDATE" => Keyword::Update,
        "SET" => Keyword::Set,
        "WHERE" => Keyword::Where,
        "ORDER" => Keyword::Order,
        "LIMIT" => Keyword::Limit,
        "NULL" => Keyword::Null,
        "IGNORE" => Keyword::Ignore,
        "LOW_PRIORITY" => Keyword::LowPriority,
        "HIGH_PRIORITY" => Keyword::HighPriority,
        "DELAYED" => Keyword::Delayed,
        "AS" => Keyword::As,
        _ => return None,
    };
    Some(kw)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Ident,
    /// Backtick-quoted identifier.
    QuotedIdent,
    /// Double-quoted: identifier in name position, string in value position.
    DoubleQuoted,
    /// Single-quoted string literal.
    StringLit,
    Number {
        float: bool,
    },
    Keyword(Keyword),
    LParen,
    RParen,
    Comma,
    Equal,
    Dot,
    Semicolon,
    Plus,
    Minus,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub start: usize,
    pub end: usize,
}

impl Token {
    pub fn text<'a>(&self, src: &'a str) -> &'a str {
        &src[self.start..self.end]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LexError {
    pub pos: usize,
    pub message: String,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at byte {}", self.message, self.pos)
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '$'
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

struct Lexer<'a> {
    src: &'a str,
    chars: Peekable<CharIndices<'a>>,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            chars: src.char_indices().peekable(),
        }
    }

    fn peek(&mut self) -> Option<(usize, char)> {
        self.chars.peek().copied()
    }

    fn bump(&mut self) -> Option<(usize, char)> {
        self.chars.next()
    }

    /// Offset one past the last consumed character.
    fn offset(&mut self) -> usize {
        self.peek().map(|(i, _)| i).unwrap_or(self.src.len())
    }

    fn skip_line_comment(&mut self) {
        while let Some((_, c)) = self.peek() {
            if c == '\n' {
                break;
            }
            self.bump();
        }
    }

    fn skip_block_comment(&mut self, start: usize) -> Result<(), LexError> {
        // Opening "/*" already consumed.
        loop {
            match self.bump() {
                Some((_, '*')) => {
                    if let Some((_, '/')) = self.peek() {
                        self.bump();
                        return Ok(());
                    }
                }
                Some(_) => {}
                None => {
                    return Err(LexError {
                        pos: start,
                        message: "unterminated block comment".to_string(),
                    })
                }
            }
        }
    }

    /// Consume a quoted region. The closing quote doubles to escape itself;
    /// backslash escapes are honoured in string position.
    fn read_quoted(
        &mut self,
        start: usize,
        quote: char,
        backslash_escapes: bool,
    ) -> Result<usize, LexError> {
        loop {
            match self.bump() {
                Some((_, c)) if c == quote => {
                    if let Some((_, next)) = self.peek() {
                        if next == quote {
                            self.bump();
                            continue;
                        }
                    }
                    return Ok(self.offset());
                }
                Some((_, '\\')) if backslash_escapes => {
                    self.bump();
                }
                Some(_) => {}
                None => {
                    return Err(LexError {
                        pos: start,
                        message: format!("unterminated {quote}-quoted region"),
                    })
                }
            }
        }
    }

    fn read_number(&mut self) -> (usize, bool) {
        let mut float = false;
        while let Some((_, c)) = self.peek() {
            if c.is_ascii_digit() {
                self.bump();
            } else {
                break;
            }
        }
        if let Some((i, '.')) = self.peek() {
            let after_dot = self.src[i + 1..].chars().next();
            if after_dot.is_some_and(|c| c.is_ascii_digit()) {
                float = true;
                self.bump();
                while let Some((_, c)) = self.peek() {
                    if c.is_ascii_digit() {
                        self.bump();
                    } else {
                        break;
                    }
                }
            }
        }
        if let Some((i, c)) = self.peek() {
            if c == 'e' || c == 'E' {
                let rest = &self.src[i + 1..];
                let mut lookahead = rest.chars();
                let exponent_ok = match lookahead.next() {
                    Some('+') | Some('-') => lookahead.next().is_some_and(|c| c.is_ascii_digit()),
                    Some(c) => c.is_ascii_digit(),
                    None => false,
                };
                if exponent_ok {
                    float = true;
                    self.bump();
                    if let Some((_, '+' | '-')) = self.peek() {
                        self.bump();
                    }
                    while let Some((_, c)) = self.peek() {
                        if c.is_ascii_digit() {
                            self.bump();
                        } else {
                            break;
                        }
                    }
                }
            }
        }
        (self.offset(), float)
    }
}

/// Tokenize a statement, skipping whitespace and comments.
pub fn tokenize(src: &str) -> Result<Vec<Token>, LexError> {
    let mut lexer = Lexer::new(src);
    let mut tokens = Vec::new();

    while let Some((start, c)) = lexer.peek() {
        if c.is_whitespace() {
            lexer.bump();
            continue;
        }
        if c == '#' {
            lexer.bump();
            lexer.skip_line_comment();
            continue;
        }
        if c == '-' && src[start..].starts_with("--") {
            lexer.bump();
            lexer.bump();
            lexer.skip_line_comment();
            continue;
        }
        if c == '/' && src[start..].starts_with("/*") {
            lexer.bump();
            lexer.bump();
            lexer.skip_block_comment(start)?;
            continue;
        }

        let kind = match c {
            '(' => {
                lexer.bump();
                TokenKind::LParen
            }
            ')' => {
                lexer.bump();
                TokenKind::RParen
            }
            ',' => {
                lexer.bump();
                TokenKind::Comma
            }
            '=' => {
                lexer.bump();
                TokenKind::Equal
            }
            ';' => {
                lexer.bump();
                TokenKind::Semicolon
            }
            '+' => {
                lexer.bump();
                TokenKind::Plus
            }
            '-' => {
                lexer.bump();
                TokenKind::Minus
            }
            '.' => {
                let after = src[start + 1..].chars().next();
                if after.is_some_and(|c| c.is_ascii_digit()) {
                    let (end, _) = {
                        lexer.bump();
                        lexer.read_number()
                    };
                    tokens.push(Token {
                        kind: TokenKind::Number { float: true },
                        start,
                        end,
                    });
                    continue;
                }
                lexer.bump();
                TokenKind::Dot
            }
            '`' => {
                lexer.bump();
                let end = lexer.read_quoted(start, '`', false)?;
                tokens.push(Token {
                    kind: TokenKind::QuotedIdent,
                    start,
                    end,
                });
                continue;
            }
            '"' => {
                lexer.bump();
                let end = lexer.read_quoted(start, '"', true)?;
                tokens.push(Token {
                    kind: TokenKind::DoubleQuoted,
                    start,
                    end,
                });
                continue;
            }
            '\'' => {
                lexer.bump();
                let end = lexer.read_quoted(start, '\'', true)?;
                tokens.push(Token {
                    kind: TokenKind::StringLit,
                    start,
                    end,
                });
                continue;
            }
            c if c.is_ascii_digit() => {
                let (end, float) = lexer.read_number();
                tokens.push(Token {
                    kind: TokenKind::Number { float },
                    start,
                    end,
                });
                continue;
            }
            c if is_ident_start(c) => {
                lexer.bump();
                while let Some((_, c)) = lexer.peek() {
                    if is_ident_char(c) {
                        lexer.bump();
                    } else {
                        break;
                    }
                }
                let end = lexer.offset();
                let kind = match keyword(&src[start..end]) {
                    Some(kw) => TokenKind::Keyword(kw),
                    None => TokenKind::Ident,
                };
                tokens.push(Token { kind, start, end });
                continue;
            }
            _ => {
                lexer.bump();
                TokenKind::Other
            }
        };

        tokens.push(Token {
            kind,
            start,
            end: lexer.offset(),
        });
    }

    Ok(tokens)
}

/// Unquoted identifier text for an identifier-position token.
pub fn identifier_text(src: &str, token: &Token) -> String {
    let raw = token.text(src);
    match token.kind {
        // Strip exactly one quote from each end; inner doubled quotes
        // unescape.
        TokenKind::QuotedIdent => raw[1..raw.len() - 1].replace("``", "`"),
        TokenKind::DoubleQuoted => raw[1..raw.len() - 1].replace("\"\"", "\""),
        _ => raw.to_string(),
    }
}
