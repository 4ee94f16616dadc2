//! Formula parser
//!
//! Tokenizes formula text with logos and parses it into a [`FormulaTree`].
//! Operands are parsed recursively; infix operators are collected into a
//! flat operand/operator list and folded by precedence, leftmost first among
//! operators of the same level.
//!
//! Absolute/relative reference markers (`$`) are rejected.

use std::fmt;

use logos::Logos;

use crate::ast::{
    column_number, BinaryOp, CellRef, FormulaTree, Node, NodeKind, UnaryOp, MAX_COLUMN, MAX_ROW,
};
use crate::error::{FormulaParseError, ParseResult};

#[derive(Logos, Debug, Clone, Copy, PartialEq)]
#[logos(skip r"[ \t\r\n]+")]
enum Token<'src> {
    #[regex(r"[0-9]+(\.[0-9]*)?([eE][+-]?[0-9]+)?", |lex| lex.slice())]
    #[regex(r"\.[0-9]+([eE][+-]?[0-9]+)?", |lex| lex.slice())]
    Number(&'src str),

    #[regex(r"[A-Za-z_][A-Za-z0-9_.]*", |lex| lex.slice())]
    Word(&'src str),

    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token(",")]
    Comma,
    #[token(":")]
    Colon,

    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token("^")]
    Caret,
    #[token("=")]
    Eq,
    #[token("<>")]
    NotEq,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,
    #[token("<=")]
    Le,
    #[token(">=")]
    Ge,
}

impl Token<'_> {
    fn binary_op(&self) -> Option<BinaryOp> {
        let op = match self {
            Token::Plus => BinaryOp::Add,
            Token::Minus => BinaryOp::Subtract,
            Token::Star => BinaryOp::Multiply,
            Token::Slash => BinaryOp::Divide,
            Token::Percent => BinaryOp::Percent,
            Token::Caret => BinaryOp::Power,
            Token::Eq => BinaryOp::Equal,
            Token::NotEq => BinaryOp::NotEqual,
            Token::Lt => BinaryOp::Less,
            Token::Gt => BinaryOp::Greater,
            Token::Le => BinaryOp::LessEqual,
            Token::Ge => BinaryOp::GreaterEqual,
            _ => return None,
        };
        Some(op)
    }
}

impl fmt::Display for Token<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Number(s) | Token::Word(s) => f.write_str(s),
            Token::LParen => f.write_str("("),
            Token::RParen => f.write_str(")"),
            Token::Comma => f.write_str(","),
            Token::Colon => f.write_str(":"),
            other => match other.binary_op() {
                Some(op) => f.write_str(op.symbol()),
                None => Ok(()),
            },
        }
    }
}

fn tokenize(text: &str) -> ParseResult<Vec<Token<'_>>> {
    let mut tokens = Vec::new();
    let mut lex = Token::lexer(text);
    while let Some(result) = lex.next() {
        match result {
            Ok(token) => tokens.push(token),
            Err(()) => {
                let pos = lex.span().start;
                let ch = text[pos..].chars().next().unwrap_or('\u{fffd}');
                return Err(if ch == '$' {
                    FormulaParseError::AbsoluteReference { pos }
                } else {
                    FormulaParseError::UnsupportedCharacter { ch, pos }
                });
            }
        }
    }
    Ok(tokens)
}

/// Excel-style cell reference: up to 3 letters (≤ `XFD`), row in 1..=1048576
fn parse_cell_ref(word: &str) -> Option<CellRef> {
    let split = word.find(|c: char| c.is_ascii_digit())?;
    let (letters, digits) = word.split_at(split);
    if letters.is_empty()
        || letters.len() > 3
        || !letters.bytes().all(|b| b.is_ascii_alphabetic())
        || !digits.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    if column_number(letters) > MAX_COLUMN {
        return None;
    }
    let row: u32 = digits.parse().ok()?;
    if row == 0 || row > MAX_ROW {
        return None;
    }
    Some(CellRef::new(letters, row))
}

/// Names and function identifiers need at least two characters
fn is_name(word: &str) -> bool {
    word.len() >= 2
}

struct Parser<'src> {
    tokens: Vec<Token<'src>>,
    pos: usize,
}

impl<'src> Parser<'src> {
    fn peek(&self) -> Option<Token<'src>> {
        self.tokens.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<Token<'src>> {
        let token = self.peek();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_expr(&mut self) -> ParseResult<Node> {
        if self.peek().is_none() {
            return Err(FormulaParseError::Empty);
        }

        let mut operands = vec![self.parse_basic()?];
        let mut operators = Vec::new();
        loop {
            match self.peek() {
                None | Some(Token::Comma) | Some(Token::RParen) => break,
                Some(_) => {}
            }
            operators.push(self.parse_operator()?);
            operands.push(self.parse_basic()?);
        }

        // Fold the lowest level first; strict `<` keeps the leftmost of a tie
        while !operators.is_empty() {
            let mut min_i = 0;
            for (i, op) in operators.iter().enumerate() {
                if op.precedence() < operators[min_i].precedence() {
                    min_i = i;
                }
            }
            let op = operators.remove(min_i);
            let right = operands.remove(min_i + 1);
            let left = operands.remove(min_i);
            operands.insert(min_i, Node::binary(left, op, right));
        }

        operands.pop().ok_or(FormulaParseError::Empty)
    }

    fn parse_operator(&mut self) -> ParseResult<BinaryOp> {
        let token = self.bump().ok_or_else(|| FormulaParseError::UnexpectedEnd {
            context: String::from("while expecting an operator"),
        })?;
        token.binary_op().ok_or_else(|| FormulaParseError::UnknownOperator {
            operator: token.to_string(),
        })
    }

    fn parse_basic(&mut self) -> ParseResult<Node> {
        let token = self.peek().ok_or_else(|| FormulaParseError::UnexpectedEnd {
            context: String::from("in incomplete expression"),
        })?;

        match token {
            Token::Word(word) if word.eq_ignore_ascii_case("true") => {
                self.bump();
                Ok(Node::logical(true))
            }
            Token::Word(word) if word.eq_ignore_ascii_case("false") => {
                self.bump();
                Ok(Node::logical(false))
            }
            Token::Number(text) => {
                self.bump();
                let value: f64 = text
                    .parse()
                    .map_err(|_| FormulaParseError::ExpectedOperand {
                        found: String::from(text),
                    })?;
                Ok(Node::number(value))
            }
            Token::Word(word) => {
                if let Some(start) = parse_cell_ref(word) {
                    self.bump();
                    return self.parse_range_tail(start);
                }
                if !is_name(word) {
                    return Err(FormulaParseError::ExpectedOperand {
                        found: String::from(word),
                    });
                }
                self.bump();
                if self.peek() == Some(Token::LParen) {
                    self.bump();
                    self.parse_arguments(word)
                } else {
                    Ok(Node::name(word))
                }
            }
            Token::LParen => {
                self.bump();
                let expr = self.parse_expr()?;
                match self.bump() {
                    Some(Token::RParen) => Ok(expr),
                    _ => Err(FormulaParseError::UnmatchedParenthesis),
                }
            }
            Token::Plus | Token::Minus => {
                self.bump();
                let op = if token == Token::Plus {
                    UnaryOp::Plus
                } else {
                    UnaryOp::Minus
                };
                if self.peek().is_none() {
                    return Err(FormulaParseError::UnexpectedEnd {
                        context: format!("after unary operator {}", op.symbol()),
                    });
                }
                let operand = self.parse_basic()?;
                Ok(Node::unary(op, operand))
            }
            other => Err(FormulaParseError::ExpectedOperand {
                found: other.to_string(),
            }),
        }
    }

    fn parse_range_tail(&mut self, start: CellRef) -> ParseResult<Node> {
        if self.peek() != Some(Token::Colon) {
            return Ok(Node::new(NodeKind::Cell(start)));
        }
        self.bump();
        match self.bump() {
            None => Err(FormulaParseError::UnexpectedEnd {
                context: String::from("after colon"),
            }),
            Some(Token::Word(word)) => match parse_cell_ref(word) {
                Some(end) => Ok(Node::range(start, end)),
                None => Err(FormulaParseError::ExpectedCellAfterColon {
                    found: String::from(word),
                }),
            },
            Some(other) => Err(FormulaParseError::ExpectedCellAfterColon {
                found: other.to_string(),
            }),
        }
    }

    fn parse_arguments(&mut self, name: &str) -> ParseResult<Node> {
        let function = name.to_ascii_uppercase();
        let mut arguments = Vec::new();
        if self.peek() == Some(Token::RParen) {
            self.bump();
            return Ok(Node::function(&function, arguments));
        }
        loop {
            if self.peek().is_none() {
                return Err(FormulaParseError::UnexpectedEnd {
                    context: format!("while parsing arguments of {function}"),
                });
            }
            arguments.push(self.parse_expr()?);
            match self.bump() {
                Some(Token::RParen) => break,
                Some(Token::Comma) => continue,
                Some(other) => {
                    return Err(FormulaParseError::ExpectedArgumentSeparator {
                        function,
                        found: other.to_string(),
                    })
                }
                None => {
                    return Err(FormulaParseError::UnexpectedEnd {
                        context: format!("while parsing arguments of {function}"),
                    })
                }
            }
        }
        Ok(Node::function(&function, arguments))
    }
}

/// Parse formula text into a tree of freshly stamped nodes.
///
/// A leading `=` is accepted and ignored.
pub fn parse(text: &str) -> ParseResult<FormulaTree> {
    let trimmed = text.trim_start();
    let body = trimmed.strip_prefix('=').unwrap_or(trimmed);
    let tokens = tokenize(body)?;
    if tokens.is_empty() {
        return Err(FormulaParseError::Empty);
    }

    let mut parser = Parser { tokens, pos: 0 };
    let root = parser.parse_expr()?;
    match parser.peek() {
        None => Ok(FormulaTree::new(root)),
        Some(Token::RParen) => Err(FormulaParseError::UnmatchedParenthesis),
        Some(other) => Err(FormulaParseError::MultipleFormulas {
            found: other.to_string(),
        }),
    }
}
