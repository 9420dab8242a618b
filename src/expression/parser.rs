//! Expression parser for step conditions, results and templates

use super::value::Value;
use super::ExpressionError;
use std::fmt;

type Result<T> = std::result::Result<T, ExpressionError>;

/// Expression syntax tree
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    /// Literal value
    Literal(Value),
    /// Bare name, resolved through machines (step refs, `passed`, `env.NAME`)
    Identifier(String),
    /// Negation
    Not(Box<Expression>),
    /// Comparison operation
    Comparison {
        left: Box<Expression>,
        op: ComparisonOp,
        right: Box<Expression>,
    },
    /// Logical operation
    Logical {
        left: Box<Expression>,
        op: LogicalOp,
        right: Box<Expression>,
    },
    /// Function call, e.g. `bool(step1)`
    Call { name: String, args: Vec<Expression> },
}

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOp {
    Equal,
    NotEqual,
    GreaterThan,
    LessThan,
    GreaterThanOrEqual,
    LessThanOrEqual,
}

impl ComparisonOp {
    pub fn symbol(self) -> &'static str {
        match self {
            ComparisonOp::Equal => "==",
            ComparisonOp::NotEqual => "!=",
            ComparisonOp::GreaterThan => ">",
            ComparisonOp::LessThan => "<",
            ComparisonOp::GreaterThanOrEqual => ">=",
            ComparisonOp::LessThanOrEqual => "<=",
        }
    }
}

/// Logical operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

impl LogicalOp {
    pub fn symbol(self) -> &'static str {
        match self {
            LogicalOp::And => "&&",
            LogicalOp::Or => "||",
        }
    }
}

/// Token types
#[derive(Debug, Clone, PartialEq)]
enum Token {
    Identifier(String),
    String(String),
    Number(f64),
    Bool(bool),
    Null,
    ComparisonOp(ComparisonOp),
    LogicalOp(LogicalOp),
    Not,
    LeftParen,
    RightParen,
    Comma,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Identifier(name) => f.write_str(name),
            Token::String(s) => write!(f, "{}", Value::String(s.clone())),
            Token::Number(n) => write!(f, "{n}"),
            Token::Bool(b) => write!(f, "{b}"),
            Token::Null => f.write_str("null"),
            Token::ComparisonOp(op) => f.write_str(op.symbol()),
            Token::LogicalOp(op) => f.write_str(op.symbol()),
            Token::Not => f.write_str("!"),
            Token::LeftParen => f.write_str("("),
            Token::RightParen => f.write_str(")"),
            Token::Comma => f.write_str(","),
        }
    }
}

/// Parse an expression string
pub fn parse_expression(input: &str) -> Result<Expression> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_logical_or()?;
    match parser.next() {
        None => Ok(expr),
        Some(token) => Err(ExpressionError::UnexpectedToken(token.to_string())),
    }
}

/// Tokenize the input string
fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&ch) = chars.peek() {
        match ch {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '\'' | '"' => {
                chars.next();
                tokens.push(Token::String(consume_string(&mut chars, ch)?));
            }
            '(' => {
                chars.next();
                tokens.push(Token::LeftParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RightParen);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::ComparisonOp(ComparisonOp::NotEqual));
                } else {
                    tokens.push(Token::Not);
                }
            }
            '=' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::ComparisonOp(ComparisonOp::Equal));
                } else {
                    return Err(ExpressionError::UnexpectedCharacter('='));
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::ComparisonOp(ComparisonOp::GreaterThanOrEqual));
                } else {
                    tokens.push(Token::ComparisonOp(ComparisonOp::GreaterThan));
                }
            }
            '<' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::ComparisonOp(ComparisonOp::LessThanOrEqual));
                } else {
                    tokens.push(Token::ComparisonOp(ComparisonOp::LessThan));
                }
            }
            '&' => {
                chars.next();
                if chars.next() != Some('&') {
                    return Err(ExpressionError::UnexpectedCharacter('&'));
                }
                tokens.push(Token::LogicalOp(LogicalOp::And));
            }
            '|' => {
                chars.next();
                if chars.next() != Some('|') {
                    return Err(ExpressionError::UnexpectedCharacter('|'));
                }
                tokens.push(Token::LogicalOp(LogicalOp::Or));
            }
            _ if ch.is_ascii_digit() || ch == '-' => {
                let num_str = consume_number(&mut chars);
                let num = num_str
                    .parse::<f64>()
                    .map_err(|_| ExpressionError::InvalidNumber(num_str.clone()))?;
                tokens.push(Token::Number(num));
            }
            _ if ch.is_ascii_alphabetic() || ch == '_' => {
                let word = consume_word(&mut chars);
                match word.as_str() {
                    "true" => tokens.push(Token::Bool(true)),
                    "false" => tokens.push(Token::Bool(false)),
                    "null" => tokens.push(Token::Null),
                    _ => tokens.push(Token::Identifier(word)),
                }
            }
            _ => return Err(ExpressionError::UnexpectedCharacter(ch)),
        }
    }

    Ok(tokens)
}

/// Consume a quoted string, the opening quote already taken
fn consume_string(chars: &mut std::iter::Peekable<std::str::Chars>, quote: char) -> Result<String> {
    let mut result = String::new();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => match chars.next() {
                Some('n') => result.push('\n'),
                Some('t') => result.push('\t'),
                Some('r') => result.push('\r'),
                Some(other) => result.push(other),
                None => break,
            },
            _ if ch == quote => return Ok(result),
            _ => result.push(ch),
        }
    }
    Err(ExpressionError::UnterminatedString)
}

/// Consume a number, with an optional leading minus
fn consume_number(chars: &mut std::iter::Peekable<std::str::Chars>) -> String {
    let mut result = String::new();
    if let Some(&'-') = chars.peek() {
        result.push('-');
        chars.next();
    }

    let mut has_dot = false;
    while let Some(&ch) = chars.peek() {
        if ch.is_ascii_digit() || (ch == '.' && !has_dot) {
            has_dot |= ch == '.';
            result.push(ch);
            chars.next();
        } else {
            break;
        }
    }
    result
}

/// Consume an identifier or keyword
fn consume_word(chars: &mut std::iter::Peekable<std::str::Chars>) -> String {
    let mut result = String::new();
    while let Some(&ch) = chars.peek() {
        if ch.is_ascii_alphanumeric() || ch == '_' || ch == '.' {
            result.push(ch);
            chars.next();
        } else {
            break;
        }
    }
    result
}

/// Recursive descent over the token stream
struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(ExpressionError::UnexpectedToken(token.to_string())),
            None => Err(ExpressionError::UnexpectedEnd),
        }
    }

    /// Parse logical OR expressions (lowest precedence)
    fn parse_logical_or(&mut self) -> Result<Expression> {
        let mut left = self.parse_logical_and()?;
        while let Some(Token::LogicalOp(LogicalOp::Or)) = self.peek() {
            self.pos += 1;
            let right = self.parse_logical_and()?;
            left = Expression::Logical {
                left: Box::new(left),
                op: LogicalOp::Or,
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    /// Parse logical AND expressions
    fn parse_logical_and(&mut self) -> Result<Expression> {
        let mut left = self.parse_comparison()?;
        while let Some(Token::LogicalOp(LogicalOp::And)) = self.peek() {
            self.pos += 1;
            let right = self.parse_comparison()?;
            left = Expression::Logical {
                left: Box::new(left),
                op: LogicalOp::And,
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    /// Parse comparison expressions
    fn parse_comparison(&mut self) -> Result<Expression> {
        let left = self.parse_unary()?;
        if let Some(Token::ComparisonOp(op)) = self.peek() {
            let op = *op;
            self.pos += 1;
            let right = self.parse_unary()?;
            return Ok(Expression::Comparison {
                left: Box::new(left),
                op,
                right: Box::new(right),
            });
        }
        Ok(left)
    }

    /// Parse unary expressions (NOT, parentheses, literals, calls)
    fn parse_unary(&mut self) -> Result<Expression> {
        match self.next() {
            None => Err(ExpressionError::UnexpectedEnd),
            Some(Token::Not) => Ok(Expression::Not(Box::new(self.parse_unary()?))),
            Some(Token::LeftParen) => {
                let inner = self.parse_logical_or()?;
                self.expect(Token::RightParen)?;
                Ok(inner)
            }
            Some(Token::Identifier(name)) => {
                if self.peek() == Some(&Token::LeftParen) {
                    self.pos += 1;
                    let args = self.parse_arguments()?;
                    Ok(Expression::Call { name, args })
                } else {
                    Ok(Expression::Identifier(name))
                }
            }
            Some(Token::String(s)) => Ok(Expression::Literal(Value::String(s))),
            Some(Token::Number(n)) => Ok(Expression::Literal(Value::Number(n))),
            Some(Token::Bool(b)) => Ok(Expression::Literal(Value::Bool(b))),
            Some(Token::Null) => Ok(Expression::Literal(Value::Null)),
            Some(token) => Err(ExpressionError::UnexpectedToken(token.to_string())),
        }
    }

    /// Parse call arguments, the opening parenthesis already taken
    fn parse_arguments(&mut self) -> Result<Vec<Expression>> {
        let mut args = Vec::new();
        if self.peek() == Some(&Token::RightParen) {
            self.pos += 1;
            return Ok(args);
        }
        loop {
            args.push(self.parse_logical_or()?);
            match self.next() {
                Some(Token::Comma) => continue,
                Some(Token::RightParen) => return Ok(args),
                Some(token) => return Err(ExpressionError::UnexpectedToken(token.to_string())),
                None => return Err(ExpressionError::UnexpectedEnd),
            }
        }
    }
}
