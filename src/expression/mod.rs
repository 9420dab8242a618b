//! Expression engine for step conditions, results and container templates
//!
//! Expressions are parsed into an [`Expression`] tree and partially evaluated
//! against a set of [`Machine`]s. Whatever the machines cannot resolve stays
//! symbolic, so a condition such as `passed && step1` can be folded as far as
//! the compiler knows and handed to the runtime in canonical text form.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

mod machine;
mod parser;
mod template;
mod value;

pub use machine::{Machine, MapMachine};
pub use parser::{parse_expression, ComparisonOp, Expression, LogicalOp};
pub use template::{is_template, resolve_template};
pub use value::Value;

/// How many nested machine substitutions a single identifier may go through
const MAX_RESOLVE_DEPTH: usize = 32;

/// Errors raised while parsing or folding expressions
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExpressionError {
    #[error("Unexpected character '{0}'")]
    UnexpectedCharacter(char),

    #[error("Unexpected token '{0}'")]
    UnexpectedToken(String),

    #[error("Unexpected end of expression")]
    UnexpectedEnd,

    #[error("Unterminated string literal")]
    UnterminatedString,

    #[error("Invalid number: {0}")]
    InvalidNumber(String),

    #[error("Unterminated template expression in '{0}'")]
    UnterminatedTemplate(String),

    #[error("Function '{name}' expects {expected} argument(s), got {actual}")]
    Arity {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("Function '{name}' cannot convert {value}")]
    InvalidArgument { name: String, value: String },

    #[error("Cannot compare {left} and {right} with {op}")]
    Incomparable {
        left: String,
        op: &'static str,
        right: String,
    },

    #[error("Resolving '{0}' exceeded the maximum substitution depth")]
    RecursionLimit(String),
}

type Result<T> = std::result::Result<T, ExpressionError>;

impl Expression {
    /// Parse an expression string
    pub fn parse(input: &str) -> Result<Self> {
        parse_expression(input)
    }

    pub fn literal(value: impl Into<Value>) -> Self {
        Expression::Literal(value.into())
    }

    pub fn identifier(name: impl Into<String>) -> Self {
        Expression::Identifier(name.into())
    }

    pub fn and(left: Expression, right: Expression) -> Self {
        Expression::Logical {
            left: Box::new(left),
            op: LogicalOp::And,
            right: Box::new(right),
        }
    }

    pub fn or(left: Expression, right: Expression) -> Self {
        Expression::Logical {
            left: Box::new(left),
            op: LogicalOp::Or,
            right: Box::new(right),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(inner: Expression) -> Self {
        Expression::Not(Box::new(inner))
    }

    /// Explicit boolean cast, `bool(inner)`
    pub fn cast_bool(inner: Expression) -> Self {
        Expression::Call {
            name: "bool".to_string(),
            args: vec![inner],
        }
    }

    /// The folded value, if nothing symbolic is left
    pub fn static_value(&self) -> Option<&Value> {
        match self {
            Expression::Literal(value) => Some(value),
            _ => None,
        }
    }

    /// Whether the expression always yields a boolean
    pub fn is_boolean(&self) -> bool {
        match self {
            Expression::Literal(Value::Bool(_)) => true,
            Expression::Not(_) | Expression::Comparison { .. } => true,
            Expression::Call { name, .. } => name == "bool",
            Expression::Logical { left, right, .. } => left.is_boolean() && right.is_boolean(),
            _ => false,
        }
    }

    /// Partially evaluate the expression.
    ///
    /// Identifiers are looked up in each machine in order; a hit is itself
    /// resolved, so machines may answer with further symbolic expressions.
    /// Constant sub-trees are folded, the rest is kept as-is.
    ///
    /// ```
    /// use testflow::expression::{Expression, MapMachine};
    ///
    /// let machine = MapMachine::new().register("init", true);
    /// let expr = Expression::parse("step1 && init").unwrap();
    /// let resolved = expr.resolve(&[&machine]).unwrap();
    /// assert_eq!(resolved.to_string(), "step1&&true");
    /// ```
    pub fn resolve(&self, machines: &[&dyn Machine]) -> Result<Expression> {
        self.resolve_at(machines, 0)
    }

    fn resolve_at(&self, machines: &[&dyn Machine], depth: usize) -> Result<Expression> {
        match self {
            Expression::Literal(_) => Ok(self.clone()),
            Expression::Identifier(name) => {
                for machine in machines {
                    if let Some(found) = machine.get(name) {
                        if depth >= MAX_RESOLVE_DEPTH {
                            return Err(ExpressionError::RecursionLimit(name.clone()));
                        }
                        return found.resolve_at(machines, depth + 1);
                    }
                }
                Ok(self.clone())
            }
            Expression::Not(inner) => Ok(fold_not(inner.resolve_at(machines, depth)?)),
            Expression::Logical { left, op, right } => Ok(fold_logical(
                left.resolve_at(machines, depth)?,
                *op,
                right.resolve_at(machines, depth)?,
            )),
            Expression::Comparison { left, op, right } => fold_comparison(
                left.resolve_at(machines, depth)?,
                *op,
                right.resolve_at(machines, depth)?,
            ),
            Expression::Call { name, args } => {
                let args = args
                    .iter()
                    .map(|arg| arg.resolve_at(machines, depth))
                    .collect::<Result<Vec<_>>>()?;
                fold_call(name, args)
            }
        }
    }

    /// Rebuild the tree top-down. When `f` returns a replacement for a node,
    /// the replacement is used as-is and its children are not visited.
    pub fn transform<F>(&self, f: &F) -> Expression
    where
        F: Fn(&Expression) -> Option<Expression>,
    {
        if let Some(replaced) = f(self) {
            return replaced;
        }
        match self {
            Expression::Literal(_) | Expression::Identifier(_) => self.clone(),
            Expression::Not(inner) => Expression::Not(Box::new(inner.transform(f))),
            Expression::Logical { left, op, right } => Expression::Logical {
                left: Box::new(left.transform(f)),
                op: *op,
                right: Box::new(right.transform(f)),
            },
            Expression::Comparison { left, op, right } => Expression::Comparison {
                left: Box::new(left.transform(f)),
                op: *op,
                right: Box::new(right.transform(f)),
            },
            Expression::Call { name, args } => Expression::Call {
                name: name.clone(),
                args: args.iter().map(|arg| arg.transform(f)).collect(),
            },
        }
    }

    fn precedence(&self) -> u8 {
        match self {
            Expression::Logical {
                op: LogicalOp::Or, ..
            } => 1,
            Expression::Logical {
                op: LogicalOp::And,
                ..
            } => 2,
            Expression::Comparison { .. } => 3,
            Expression::Not(_) => 4,
            Expression::Literal(Value::Number(n)) if *n < 0.0 => 4,
            _ => 5,
        }
    }

    fn fmt_operand(&self, f: &mut fmt::Formatter<'_>, min_precedence: u8) -> fmt::Result {
        if self.precedence() < min_precedence {
            write!(f, "({self})")
        } else {
            write!(f, "{self}")
        }
    }
}

/// Canonical compact form: no whitespace around operators and parentheses
/// only where precedence needs them.
impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Literal(value) => write!(f, "{value}"),
            Expression::Identifier(name) => f.write_str(name),
            Expression::Not(inner) => {
                f.write_str("!")?;
                inner.fmt_operand(f, 4)
            }
            Expression::Logical { left, op, right } => {
                let precedence = self.precedence();
                left.fmt_operand(f, precedence)?;
                f.write_str(op.symbol())?;
                right.fmt_operand(f, precedence)
            }
            Expression::Comparison { left, op, right } => {
                left.fmt_operand(f, 4)?;
                f.write_str(op.symbol())?;
                right.fmt_operand(f, 4)
            }
            Expression::Call { name, args } => {
                write!(f, "{name}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{arg}")?;
                }
                f.write_str(")")
            }
        }
    }
}

impl FromStr for Expression {
    type Err = ExpressionError;

    fn from_str(s: &str) -> Result<Self> {
        parse_expression(s)
    }
}

/// Parse, fold against the machines and print back in canonical form
pub fn simplify(input: &str, machines: &[&dyn Machine]) -> Result<String> {
    Ok(Expression::parse(input)?.resolve(machines)?.to_string())
}

fn fold_not(inner: Expression) -> Expression {
    match inner {
        Expression::Literal(value) => Expression::Literal(Value::Bool(!value.is_truthy())),
        Expression::Not(double) if double.is_boolean() => *double,
        Expression::Not(double) => Expression::cast_bool(*double),
        other => Expression::not(other),
    }
}

fn fold_logical(left: Expression, op: LogicalOp, right: Expression) -> Expression {
    if let Some(value) = left.static_value() {
        let short_circuits = match op {
            LogicalOp::And => !value.is_truthy(),
            LogicalOp::Or => value.is_truthy(),
        };
        return if short_circuits { left } else { right };
    }

    if let (Expression::Literal(Value::Bool(b)), true) = (&right, left.is_boolean()) {
        return match (op, *b) {
            (LogicalOp::And, true) | (LogicalOp::Or, false) => left,
            (LogicalOp::And, false) => Expression::literal(false),
            (LogicalOp::Or, true) => Expression::literal(true),
        };
    }

    Expression::Logical {
        left: Box::new(left),
        op,
        right: Box::new(right),
    }
}

fn fold_comparison(left: Expression, op: ComparisonOp, right: Expression) -> Result<Expression> {
    let (Some(l), Some(r)) = (left.static_value(), right.static_value()) else {
        return Ok(Expression::Comparison {
            left: Box::new(left),
            op,
            right: Box::new(right),
        });
    };

    let (l, r) = coerce_for_comparison(l.clone(), r.clone());
    let result = match op {
        ComparisonOp::Equal => l == r,
        ComparisonOp::NotEqual => l != r,
        _ => {
            let ordering = match (&l, &r) {
                (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => None,
            };
            let Some(ordering) = ordering else {
                return Err(ExpressionError::Incomparable {
                    left: l.to_string(),
                    op: op.symbol(),
                    right: r.to_string(),
                });
            };
            match op {
                ComparisonOp::GreaterThan => ordering.is_gt(),
                ComparisonOp::LessThan => ordering.is_lt(),
                ComparisonOp::GreaterThanOrEqual => ordering.is_ge(),
                _ => ordering.is_le(),
            }
        }
    };
    Ok(Expression::literal(result))
}

/// Numeric strings compare as numbers against numbers
fn coerce_for_comparison(left: Value, right: Value) -> (Value, Value) {
    match (&left, &right) {
        (Value::String(s), Value::Number(_)) => match s.parse::<f64>() {
            Ok(n) => (Value::Number(n), right),
            Err(_) => (left, right),
        },
        (Value::Number(_), Value::String(s)) => match s.parse::<f64>() {
            Ok(n) => (left, Value::Number(n)),
            Err(_) => (left, right),
        },
        _ => (left, right),
    }
}

fn fold_call(name: &str, mut args: Vec<Expression>) -> Result<Expression> {
    let builtin = matches!(name, "bool" | "string" | "int");
    if !builtin {
        return Ok(Expression::Call {
            name: name.to_string(),
            args,
        });
    }
    if args.len() != 1 {
        return Err(ExpressionError::Arity {
            name: name.to_string(),
            expected: 1,
            actual: args.len(),
        });
    }

    let arg = args.remove(0);
    let folded = match (name, arg.static_value()) {
        ("bool", Some(value)) => Expression::literal(value.is_truthy()),
        ("bool", None) if arg.is_boolean() => arg,
        ("string", Some(value)) => Expression::literal(value.as_string()),
        ("int", Some(value)) => match value.as_number() {
            Some(n) => Expression::literal(n.trunc()),
            None => {
                return Err(ExpressionError::InvalidArgument {
                    name: name.to_string(),
                    value: value.to_string(),
                })
            }
        },
        _ => Expression::Call {
            name: name.to_string(),
            args: vec![arg],
        },
    };
    Ok(folded)
}
