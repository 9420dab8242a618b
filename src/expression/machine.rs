//! Pluggable name resolution for partial evaluation

use super::{Expression, Value};
use std::collections::HashMap;

/// Resolves identifiers while folding an expression.
///
/// Returning `None` leaves the identifier symbolic. The returned expression
/// may itself contain identifiers; they are resolved again through the same
/// machine list.
pub trait Machine {
    fn get(&self, name: &str) -> Option<Expression>;
}

impl<F> Machine for F
where
    F: Fn(&str) -> Option<Expression>,
{
    fn get(&self, name: &str) -> Option<Expression> {
        self(name)
    }
}

/// Fixed table of names
#[derive(Debug, Clone, Default)]
pub struct MapMachine {
    entries: HashMap<String, Expression>,
}

impl MapMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a static value
    pub fn register(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.entries
            .insert(name.into(), Expression::Literal(value.into()));
        self
    }

    /// Register a symbolic expression
    pub fn register_expression(mut self, name: impl Into<String>, expr: Expression) -> Self {
        self.entries.insert(name.into(), expr);
        self
    }
}

impl Machine for MapMachine {
    fn get(&self, name: &str) -> Option<Expression> {
        self.entries.get(name).cloned()
    }
}
