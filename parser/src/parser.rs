//! FILENAME: parser/src/parser.rs
//! PURPOSE: Recursive descent parser that converts a stream of Tokens into an AST.
//! CONTEXT: This is the second stage of the parsing pipeline. It takes tokens
//! from the Lexer and builds an Expression tree that can be evaluated.
//!
//! GRAMMAR (complete with sheet references and absolute markers):
//!   expression     --> or_expr
//!   or_expr        --> and_expr ( "OR" and_expr )*
//!   and_expr       --> not_expr ( "AND" not_expr )*
//!   not_expr       --> "NOT" not_expr | comparison
//!   comparison     --> concatenation ( ("=" | "==" | "<>" | "!=" | "<" | ">" | "<=" | ">=") concatenation )*
//!   concatenation  --> additive ( "&" additive )*
//!   additive       --> multiplicative ( ("+" | "-") multiplicative )*
//!   multiplicative --> unary ( ("*" | "/") unary )*
//!   unary          --> ("-" | "+") unary | primary
//!   primary        --> NUMBER | STRING | BOOLEAN | ERROR_LITERAL
//!                    | reference | function_call | "(" expression ")"
//!   reference      --> [sheet_prefix] cell_ref
//!   sheet_prefix   --> (IDENTIFIER | QUOTED_IDENTIFIER) "!"
//!   cell_ref       --> "$"? COLUMN "$"? ROW
//!   function_call  --> IDENTIFIER "(" arguments? ")"
//!   arguments      --> expression ("," expression)*
//!
//! Number literals have no exponent form. Cell references allow one to four
//! column letters and one to four row digits; bounds beyond that are a
//! matter for the evaluator, not the grammar.

use rust_decimal::prelude::ToPrimitive;

use crate::ast::{BinaryOperator, Expression, UnaryOperator, Value};
use crate::lexer::Lexer;
use crate::token::Token;

/// Parser errors with descriptive messages.
#[derive(Debug, PartialEq, Clone)]
pub struct ParseError {
    pub message: String,
}

impl ParseError {
    pub fn new(message: impl Into<String>) -> Self {
        ParseError {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Parse error: {}", self.message)
    }
}

impl std::error::Error for ParseError {}

pub type ParseResult<T> = Result<T, ParseError>;

/// Parses a formula string (with or without the leading '=') into an AST.
pub fn parse_formula(input: &str) -> ParseResult<Expression> {
    Parser::new(input).parse()
}

/// The Parser struct holds the lexer and current token state.
pub struct Parser<'a> {
    lexer: Lexer<'a>,
    current_token: Token,
}

impl<'a> Parser<'a> {
    /// Creates a new parser from an input string.
    /// Automatically advances to the first token.
    pub fn new(input: &'a str) -> Self {
        let mut lexer = Lexer::new(input);
        let current_token = lexer.next_token();
        Parser {
            lexer,
            current_token,
        }
    }

    /// Parses the entire input and returns the AST.
    /// Handles the optional leading '=' that indicates a formula.
    pub fn parse(&mut self) -> ParseResult<Expression> {
        // Skip the leading '=' if present (formula indicator)
        if self.current_token == Token::Equals {
            self.advance();
        }

        // Handle empty formula
        if self.current_token == Token::EOF {
            return Err(ParseError::new("Empty expression"));
        }

        let expr = self.parse_expression()?;

        // Ensure we consumed all tokens
        if self.current_token != Token::EOF {
            return Err(ParseError::new(format!(
                "Unexpected token after expression: {:?}",
                self.current_token
            )));
        }

        Ok(expr)
    }

    /// Advances to the next token.
    fn advance(&mut self) {
        self.current_token = self.lexer.next_token();
    }

    /// Checks if the current token matches the expected token.
    /// If it matches, advances and returns Ok. Otherwise returns an error.
    fn expect(&mut self, expected: Token) -> ParseResult<()> {
        if self.current_token == expected {
            self.advance();
            Ok(())
        } else {
            Err(ParseError::new(format!(
                "Expected {:?}, found {:?}",
                expected, self.current_token
            )))
        }
    }

    /// Returns true if the current token is the given bare keyword (the
    /// lexer uppercases identifiers, so a direct compare suffices).
    fn at_keyword(&self, keyword: &str) -> bool {
        matches!(&self.current_token, Token::Identifier(name) if name == keyword)
    }

    /// Entry point for expression parsing.
    fn parse_expression(&mut self) -> ParseResult<Expression> {
        self.parse_or()
    }

    /// Parses logical OR expressions (lowest precedence).
    fn parse_or(&mut self) -> ParseResult<Expression> {
        let mut left = self.parse_and()?;

        while self.at_keyword("OR") {
            self.advance();
            let right = self.parse_and()?;

            left = Expression::BinaryOp {
                left: Box::new(left),
                op: BinaryOperator::Or,
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    /// Parses logical AND expressions.
    fn parse_and(&mut self) -> ParseResult<Expression> {
        let mut left = self.parse_not()?;

        while self.at_keyword("AND") {
            self.advance();
            let right = self.parse_not()?;

            left = Expression::BinaryOp {
                left: Box::new(left),
                op: BinaryOperator::And,
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    /// Parses prefix NOT. `NOT(...)` with a following paren is parsed as the
    /// NOT function call instead, which evaluates identically but keeps the
    /// arity checking of the function table.
    fn parse_not(&mut self) -> ParseResult<Expression> {
        if self.at_keyword("NOT") {
            self.advance();
            if self.current_token == Token::LParen {
                return self.parse_function_call("NOT".to_string());
            }
            let operand = self.parse_not()?;
            return Ok(Expression::UnaryOp {
                op: UnaryOperator::Not,
                operand: Box::new(operand),
            });
        }

        self.parse_comparison()
    }

    /// Parses comparison expressions (=, <>, <, >, <=, >=).
    fn parse_comparison(&mut self) -> ParseResult<Expression> {
        let mut left = self.parse_concatenation()?;

        loop {
            let op = match &self.current_token {
                Token::Equals => BinaryOperator::Equal,
                Token::NotEqual => BinaryOperator::NotEqual,
                Token::LessThan => BinaryOperator::LessThan,
                Token::GreaterThan => BinaryOperator::GreaterThan,
                Token::LessEqual => BinaryOperator::LessEqual,
                Token::GreaterEqual => BinaryOperator::GreaterEqual,
                _ => break,
            };

            self.advance();
            let right = self.parse_concatenation()?;

            left = Expression::BinaryOp {
                left: Box::new(left),
                op,
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    /// Parses concatenation expressions (&).
    fn parse_concatenation(&mut self) -> ParseResult<Expression> {
        let mut left = self.parse_additive()?;

        while self.current_token == Token::Ampersand {
            self.advance();
            let right = self.parse_additive()?;

            left = Expression::BinaryOp {
                left: Box::new(left),
                op: BinaryOperator::Concat,
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    /// Parses additive expressions (+ and -).
    fn parse_additive(&mut self) -> ParseResult<Expression> {
        let mut left = self.parse_multiplicative()?;

        loop {
            let op = match &self.current_token {
                Token::Plus => BinaryOperator::Add,
                Token::Minus => BinaryOperator::Subtract,
                _ => break,
            };

            self.advance();
            let right = self.parse_multiplicative()?;

            left = Expression::BinaryOp {
                left: Box::new(left),
                op,
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    /// Parses multiplicative expressions (* and /).
    fn parse_multiplicative(&mut self) -> ParseResult<Expression> {
        let mut left = self.parse_unary()?;

        loop {
            let op = match &self.current_token {
                Token::Asterisk => BinaryOperator::Multiply,
                Token::Slash => BinaryOperator::Divide,
                _ => break,
            };

            self.advance();
            let right = self.parse_unary()?;

            left = Expression::BinaryOp {
                left: Box::new(left),
                op,
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    /// Parses unary expressions (negation and numeric identity).
    fn parse_unary(&mut self) -> ParseResult<Expression> {
        let op = match &self.current_token {
            Token::Minus => Some(UnaryOperator::Negate),
            Token::Plus => Some(UnaryOperator::Plus),
            _ => None,
        };

        if let Some(op) = op {
            self.advance();
            let operand = self.parse_unary()?;
            return Ok(Expression::UnaryOp {
                op,
                operand: Box::new(operand),
            });
        }

        self.parse_primary()
    }

    /// Parses primary expressions (literals, cell refs, function calls, parentheses).
    fn parse_primary(&mut self) -> ParseResult<Expression> {
        match self.current_token.clone() {
            Token::Number(n) => {
                self.advance();
                Ok(Expression::Literal(Value::Number(n)))
            }
            Token::String(s) => {
                self.advance();
                Ok(Expression::Literal(Value::String(s)))
            }
            Token::Boolean(b) => {
                self.advance();
                Ok(Expression::Literal(Value::Boolean(b)))
            }
            Token::ErrorLiteral(kind) => {
                self.advance();
                Ok(Expression::ErrorLiteral(kind))
            }

            Token::LParen => {
                self.advance();
                let expr = self.parse_expression()?;
                self.expect(Token::RParen)?;
                Ok(expr)
            }

            // Dollar sign - start of an absolute reference like $A1 or $A$1
            Token::Dollar => self.parse_reference(None),

            Token::Identifier(name) => {
                self.advance();
                match &self.current_token {
                    // IDENTIFIER "(" --> function call
                    Token::LParen => self.parse_function_call(name),
                    // IDENTIFIER "!" --> sheet-qualified reference
                    Token::Exclamation => {
                        self.advance();
                        self.parse_reference(Some(name))
                    }
                    // Otherwise the identifier itself must be a cell reference
                    _ => self.finish_address(None, name, false),
                }
            }

            // 'Quoted Sheet' must be followed by "!" and a reference
            Token::QuotedIdentifier(sheet) => {
                self.advance();
                self.expect(Token::Exclamation)?;
                self.parse_reference(Some(sheet))
            }

            other => Err(ParseError::new(format!(
                "Unexpected token in expression: {:?}",
                other
            ))),
        }
    }

    /// Parses the address part of a reference, after any sheet prefix has
    /// been consumed. The current token is '$' or the column identifier.
    fn parse_reference(&mut self, sheet: Option<String>) -> ParseResult<Expression> {
        let col_absolute = if self.current_token == Token::Dollar {
            self.advance();
            true
        } else {
            false
        };
        match self.current_token.clone() {
            Token::Identifier(text) => {
                self.advance();
                self.finish_address(sheet, text, col_absolute)
            }
            other => Err(ParseError::new(format!(
                "Expected cell reference, found {:?}",
                other
            ))),
        }
    }

    /// Completes an address from an already-consumed identifier. The
    /// identifier is either a full "A1" form, or the column letters alone
    /// with a '$' row marker still pending (as in A$1 or $A$1).
    fn finish_address(
        &mut self,
        sheet: Option<String>,
        text: String,
        col_absolute: bool,
    ) -> ParseResult<Expression> {
        if text.chars().all(|c| c.is_ascii_alphabetic()) {
            if text.is_empty() || text.len() > 4 {
                return Err(ParseError::new(format!("Invalid column: {:?}", text)));
            }
            // Column letters alone: the row must follow as $ROW.
            self.expect(Token::Dollar)?;
            let row = self.expect_row_number()?;
            Ok(Expression::CellRef {
                sheet,
                col: text,
                row,
                col_absolute,
                row_absolute: true,
            })
        } else {
            let (col, row) = split_cell_ref(&text)?;
            Ok(Expression::CellRef {
                sheet,
                col,
                row,
                col_absolute,
                row_absolute: false,
            })
        }
    }

    /// Consumes the row component of a reference like A$1. The lexer hands
    /// us the digits as a number token; it must be a whole number in range.
    fn expect_row_number(&mut self) -> ParseResult<u32> {
        match self.current_token.clone() {
            Token::Number(n) => {
                self.advance();
                match n.to_u32() {
                    Some(row) if row >= 1 && row <= 9999 && n.fract().is_zero() => Ok(row),
                    _ => Err(ParseError::new(format!("Invalid row number: {}", n))),
                }
            }
            other => Err(ParseError::new(format!(
                "Expected row number, found {:?}",
                other
            ))),
        }
    }

    /// Parses a function call; the name has been consumed and the current
    /// token is the opening parenthesis.
    fn parse_function_call(&mut self, name: String) -> ParseResult<Expression> {
        self.expect(Token::LParen)?;

        let mut args = Vec::new();
        if self.current_token == Token::RParen {
            self.advance();
            return Ok(Expression::FunctionCall { name, args });
        }

        loop {
            args.push(self.parse_expression()?);
            match &self.current_token {
                Token::Comma => self.advance(),
                Token::RParen => {
                    self.advance();
                    break;
                }
                other => {
                    return Err(ParseError::new(format!(
                        "Expected ',' or ')' in argument list, found {:?}",
                        other
                    )));
                }
            }
        }

        Ok(Expression::FunctionCall { name, args })
    }
}

/// Splits a combined cell token like "AA100" into its column letters and
/// row number, validating the reference shape: one to four letters, one to
/// four digits, no leading zero on the row.
pub fn split_cell_ref(text: &str) -> ParseResult<(String, u32)> {
    let letters: String = text.chars().take_while(|c| c.is_ascii_alphabetic()).collect();
    let digits = &text[letters.len()..];

    if letters.is_empty() || letters.len() > 4 {
        return Err(ParseError::new(format!("Invalid cell reference: {:?}", text)));
    }
    if digits.is_empty() || digits.len() > 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(ParseError::new(format!("Invalid cell reference: {:?}", text)));
    }
    if digits.starts_with('0') {
        return Err(ParseError::new(format!("Invalid cell reference: {:?}", text)));
    }

    let row: u32 = digits
        .parse()
        .map_err(|_| ParseError::new(format!("Invalid cell reference: {:?}", text)))?;
    Ok((letters, row))
}
