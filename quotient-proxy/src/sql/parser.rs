//! Statement parsing for the rewrite pipeline.
//!
//! Only INSERT with an explicit column list + VALUES and single-table
//! UPDATE ... SET are modelled; everything else classifies as `Other`.
//! The parser records byte offsets for the splice points the rewriter
//! needs (column-list close, row-tuple closes, end of the SET list) so the
//! rest of the statement is reproduced byte-for-byte.

use std::fmt;

use super::lexer::{identifier_text, tokenize, Keyword, Token, TokenKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    Insert(InsertStatement),
    Update(UpdateStatement),
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertStatement {
    pub table: String,
    pub columns: Vec<ColumnRef>,
    /// Offset of the `)` closing the column list.
    pub columns_close: usize,
    pub rows: Vec<RowTuple>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateStatement {
    pub table: String,
    pub assignments: Vec<Assignment>,
    /// Offset one past the last assignment's value; the preserved tail
    /// (WHERE clause and beyond) starts here.
    pub set_end: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnRef {
    /// Unquoted column name.
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowTuple {
    pub values: Vec<ValueLiteral>,
    /// Offset of the `)` closing this tuple.
    pub close: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiteralKind {
    Integer,
    Float,
    String,
    Null,
    Expr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueLiteral {
    pub kind: LiteralKind,
    pub start: usize,
    pub end: usize,
}

impl ValueLiteral {
    pub fn text<'a>(&self, src: &'a str) -> &'a str {
        &src[self.start..self.end]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub column: ColumnRef,
    pub value: ValueLiteral,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub pos: usize,
    pub message: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at byte {}", self.message, self.pos)
    }
}

impl std::error::Error for ParseError {}

/// Parse a statement. `Other` means "forward untouched"; `Err` means the
/// lexer or grammar hit something malformed (also forwarded, with a WARN).
pub fn parse(src: &str) -> Result<Statement, ParseError> {
    let tokens = tokenize(src).map_err(|e| ParseError {
        pos: e.pos,
        message: e.message,
    })?;
    let mut cursor = Cursor {
        src,
        tokens: &tokens,
        pos: 0,
    };
    match cursor.peek_kind() {
        Some(TokenKind::Keyword(Keyword::Insert)) => cursor.parse_insert(),
        Some(TokenKind::Keyword(Keyword::Update)) => cursor.parse_update(),
        _ => Ok(Statement::Other),
    }
}

struct Cursor<'a> {
    src: &'a str,
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn peek_kind(&self) -> Option<TokenKind> {
        self.peek().map(|t| t.kind)
    }

    fn bump(&mut self) -> Option<&'a Token> {
        let token = self.tokens.get(self.pos);
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat_keyword(&mut self, kw: Keyword) -> bool {
        if self.peek_kind() == Some(TokenKind::Keyword(kw)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn is_name(kind: TokenKind) -> bool {
        matches!(
            kind,
            TokenKind::Ident | TokenKind::QuotedIdent | TokenKind::DoubleQuoted
        )
    }

    /// Parse `name` or `qualifier.name`, returning the unquoted last
    /// component.
    fn parse_qualified_name(&mut self) -> Option<String> {
        let first = self.peek().filter(|t| Self::is_name(t.kind))?;
        let mut name = identifier_text(self.src, first);
        self.pos += 1;
        while self.peek_kind() == Some(TokenKind::Dot) {
            self.pos += 1;
            let part = self.peek().filter(|t| Self::is_name(t.kind))?;
            name = identifier_text(self.src, part);
            self.pos += 1;
        }
        Some(name)
    }

    fn parse_insert(mut self) -> Result<Statement, ParseError> {
        self.pos += 1; // INSERT
        while matches!(
            self.peek_kind(),
            Some(TokenKind::Keyword(
                Keyword::LowPriority | Keyword::HighPriority | Keyword::Delayed | Keyword::Ignore
            ))
        ) {
            self.pos += 1;
        }
        self.eat_keyword(Keyword::Into);

        let table = match self.parse_qualified_name() {
            Some(table) => table,
            None => return Ok(Statement::Other),
        };

        // Positional mapping to the schema is not derivable without an
        // explicit column list; INSERT ... SET and INSERT ... SELECT also
        // land here and pass through.
        if self.peek_kind() != Some(TokenKind::LParen) {
            return Ok(Statement::Other);
        }
        self.pos += 1;

        let mut columns = Vec::new();
        let columns_close;
        loop {
            let token = match self.peek() {
                Some(token) if Self::is_name(token.kind) => *token,
                _ => return Ok(Statement::Other),
            };
            columns.push(ColumnRef {
                name: identifier_text(self.src, &token),
            });
            self.pos += 1;
            match self.peek_kind() {
                Some(TokenKind::Comma) => {
                    self.pos += 1;
                }
                Some(TokenKind::RParen) => {
                    columns_close = self.peek().map(|t| t.start).unwrap_or(self.src.len());
                    self.pos += 1;
                    break;
                }
                _ => return Ok(Statement::Other),
            }
        }

        if !self.eat_keyword(Keyword::Values) && !self.eat_keyword(Keyword::Value) {
            return Ok(Statement::Other);
        }

        let mut rows = Vec::new();
        loop {
            if self.peek_kind() != Some(TokenKind::LParen) {
                return Ok(Statement::Other);
            }
            self.pos += 1;
            let mut values = Vec::new();
            let close;
            loop {
                let value = self.parse_value()?;
                values.push(value);
                match self.peek_kind() {
                    Some(TokenKind::Comma) => {
                        self.pos += 1;
                    }
                    Some(TokenKind::RParen) => {
                        close = self.peek().map(|t| t.start).unwrap_or(self.src.len());
                        self.pos += 1;
                        break;
                    }
                    other => {
                        return Err(self.unexpected("value tuple", other));
                    }
                }
            }
            rows.push(RowTuple { values, close });
            if self.peek_kind() == Some(TokenKind::Comma) {
                self.pos += 1;
                continue;
            }
            break;
        }

        Ok(Statement::Insert(InsertStatement {
            table,
            columns,
            columns_close,
            rows,
        }))
    }

    fn parse_update(mut self) -> Result<Statement, ParseError> {
        self.pos += 1; // UPDATE
        while matches!(
            self.peek_kind(),
            Some(TokenKind::Keyword(Keyword::LowPriority | Keyword::Ignore))
        ) {
            self.pos += 1;
        }

        let table = match self.parse_qualified_name() {
            Some(table) => table,
            None => return Ok(Statement::Other),
        };

        // Table alias; joins and multi-table UPDATE pass through.
        if self.eat_keyword(Keyword::As) {
            if !self.peek().is_some_and(|t| Self::is_name(t.kind)) {
                return Ok(Statement::Other);
            }
            self.pos += 1;
        } else if self.peek().is_some_and(|t| Self::is_name(t.kind)) {
            self.pos += 1;
        }

        if !self.eat_keyword(Keyword::Set) {
            return Ok(Statement::Other);
        }

        let mut assignments = Vec::new();
        let set_end;
        loop {
            let column = match self.parse_qualified_name() {
                Some(name) => ColumnRef { name },
                None => return Ok(Statement::Other),
            };
            if self.peek_kind() != Some(TokenKind::Equal) {
                return Ok(Statement::Other);
            }
            self.pos += 1;
            let value = self.parse_value()?;
            assignments.push(Assignment { column, value });
            match self.peek_kind() {
                Some(TokenKind::Comma) => {
                    self.pos += 1;
                }
                _ => {
                    set_end = assignments
                        .last()
                        .map(|a| a.value.end)
                        .unwrap_or(self.src.len());
                    break;
                }
            }
        }

        Ok(Statement::Update(UpdateStatement {
            table,
            assignments,
            set_end,
        }))
    }

    /// Parse one value: a simple literal when it is immediately followed by
    /// a value-list delimiter, otherwise an opaque expression scanned to
    /// the next top-level delimiter.
    fn parse_value(&mut self) -> Result<ValueLiteral, ParseError> {
        let start_pos = self.pos;
        let start = match self.peek() {
            Some(token) => token.start,
            None => return Err(self.unexpected("value", None)),
        };

        if let Some(literal) = self.try_simple_literal() {
            return Ok(literal);
        }

        // Opaque expression: scan to the next delimiter at paren depth 0.
        self.pos = start_pos;
        let mut depth = 0u32;
        let mut end = start;
        while let Some(token) = self.peek() {
            match token.kind {
                TokenKind::LParen => depth += 1,
                TokenKind::RParen => {
                    if depth == 0 {
                        break;
                    }
                    depth -= 1;
                }
                TokenKind::Comma if depth == 0 => break,
                TokenKind::Semicolon if depth == 0 => break,
                TokenKind::Keyword(Keyword::Where | Keyword::Order | Keyword::Limit)
                    if depth == 0 =>
                {
                    break;
                }
                _ => {}
            }
            end = token.end;
            self.pos += 1;
        }
        if end == start && self.pos == start_pos {
            return Err(self.unexpected("expression", self.peek_kind()));
        }
        Ok(ValueLiteral {
            kind: LiteralKind::Expr,
            start,
            end,
        })
    }

    fn try_simple_literal(&mut self) -> Option<ValueLiteral> {
        let token = *self.peek()?;
        let (kind, start, end, consumed) = match token.kind {
            TokenKind::Number { float } => {
                let kind = if float {
                    LiteralKind::Float
                } else {
                    LiteralKind::Integer
                };
                (kind, token.start, token.end, 1)
            }
            TokenKind::Plus | TokenKind::Minus => {
                let next = self.tokens.get(self.pos + 1)?;
                match next.kind {
                    TokenKind::Number { float } => {
                        let kind = if float {
                            LiteralKind::Float
                        } else {
                            LiteralKind::Integer
                        };
                        (kind, token.start, next.end, 2)
                    }
                    _ => return None,
                }
            }
            TokenKind::StringLit | TokenKind::DoubleQuoted => {
                (LiteralKind::String, token.start, token.end, 1)
            }
            TokenKind::Keyword(Keyword::Null) => (LiteralKind::Null, token.start, token.end, 1),
            _ => return None,
        };

        // Only a delimiter may follow, otherwise this is part of a larger
        // expression.
        match self.tokens.get(self.pos + consumed).map(|t| t.kind) {
            None
            | Some(TokenKind::Comma)
            | Some(TokenKind::RParen)
            | Some(TokenKind::Semicolon)
            | Some(TokenKind::Keyword(Keyword::Where | Keyword::Order | Keyword::Limit)) => {
                self.pos += consumed;
                Some(ValueLiteral { kind, start, end })
            }
            _ => None,
        }
    }

    fn unexpected(&self, context: &str, kind: Option<TokenKind>) -> ParseError {
        let pos = self.peek().map(|t| t.start).unwrap_or(self.src.len());
        ParseError {
            pos,
            message: match kind {
                Some(kind) => format!("unexpected {kind:?} in {context}"),
                None => format!("unexpected end of statement in {context}"),
            },
        }
    }
}
