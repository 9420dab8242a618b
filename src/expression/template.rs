//! `{{expression}}` substitution inside plain strings

use super::{Expression, ExpressionError, Machine};
use regex::Regex;
use std::sync::LazyLock;

static TEMPLATE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{(.*?)\}\}").expect("Invalid regex pattern"));

/// Whether the text still carries template expressions
pub fn is_template(text: &str) -> bool {
    text.contains("{{")
}

/// Resolve every `{{expr}}` segment of the text.
///
/// Segments folding to a static value are replaced by its string form;
/// the rest are written back as `{{<canonical expression>}}`.
///
/// # Errors
///
/// Returns an error for a malformed inner expression or an unterminated `{{`.
pub fn resolve_template(text: &str, machines: &[&dyn Machine]) -> Result<String, ExpressionError> {
    if !is_template(text) {
        return Ok(text.to_string());
    }

    let mut result = String::with_capacity(text.len());
    let mut last = 0;
    for captures in TEMPLATE_PATTERN.captures_iter(text) {
        let (Some(whole), Some(inner)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        let literal = &text[last..whole.start()];
        if is_template(literal) {
            return Err(ExpressionError::UnterminatedTemplate(text.to_string()));
        }
        result.push_str(literal);

        let resolved = Expression::parse(inner.as_str())?.resolve(machines)?;
        match resolved.static_value() {
            Some(value) => result.push_str(&value.as_string()),
            None => {
                result.push_str("{{");
                result.push_str(&resolved.to_string());
                result.push_str("}}");
            }
        }
        last = whole.end();
    }

    let tail = &text[last..];
    if is_template(tail) {
        return Err(ExpressionError::UnterminatedTemplate(text.to_string()));
    }
    result.push_str(tail);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::MapMachine;

    #[test]
    fn test_plain_text_is_untouched() {
        assert_eq!(resolve_template("image:1.2.3", &[]).unwrap(), "image:1.2.3");
    }

    #[test]
    fn test_static_segments_are_substituted() {
        let machine = MapMachine::new().register("env.ZERO", "foo");
        assert_eq!(
            resolve_template("{{env.ZERO}}bar-{{1 == 1}}", &[&machine]).unwrap(),
            "foobar-true"
        );
    }

    #[test]
    fn test_unresolved_segments_are_canonicalised() {
        assert_eq!(
            resolve_template("foo{{ call( abc ) }}xxx", &[]).unwrap(),
            "foo{{call(abc)}}xxx"
        );
    }

    #[test]
    fn test_malformed_templates_fail() {
        assert_eq!(
            resolve_template("foo{{bar", &[]),
            Err(ExpressionError::UnterminatedTemplate("foo{{bar".to_string()))
        );
        assert!(resolve_template("{{a &&}}", &[]).is_err());
    }
}
