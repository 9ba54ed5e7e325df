//! Leaf predicates answering "is it currently safe to run?".
//!
//! Two kinds of condition back the two watchdog kinds:
//!
//! - [`TopupWindow`] judges a ring-countdown value against the configured
//!   cooloff/warmup buffers around a periodic interruption.
//! - [`ExprCondition`] compiles a user-supplied boolean expression over live
//!   scannable readings with the Rhai scripting engine and re-evaluates it as
//!   readings change.
//!
//! Conditions are plain synchronous objects; the concurrency lives in the
//! watchdogs that consult them.

use crate::error::{GuardError, GuardResult};
use crate::scannable::PositionValue;
use once_cell::sync::Lazy;
use regex::Regex;
use rhai::{Engine, Scope, AST};
use std::collections::HashMap;

/// Validity window around a periodic machine interruption.
///
/// A countdown value `t` (milliseconds until the next interruption) is
/// acceptable when the last interruption has settled (`t > cooloff`) and the
/// next one is still far enough away (`t < period - topup_time - warmup`).
#[derive(Clone, Copy, Debug)]
pub struct TopupWindow {
    /// Minimum buffer after an interruption ends before resuming (ms)
    pub cooloff_ms: i64,
    /// Minimum buffer before the next interruption begins (ms)
    pub warmup_ms: i64,
    /// Recurrence interval of the interruption (ms)
    pub period_ms: i64,
    /// Maximum duration of the interruption itself (ms)
    pub topup_time_ms: i64,
}

impl TopupWindow {
    /// The upper bound of the validity window.
    pub fn latest_safe_ms(&self) -> i64 {
        (self.period_ms - self.topup_time_ms) - self.warmup_ms
    }

    /// Is it safe to run at `countdown_ms` milliseconds before the next
    /// interruption? Negative countdowns (no countdown available) are never
    /// safe.
    pub fn permits(&self, countdown_ms: i64) -> bool {
        countdown_ms > self.cooloff_ms && countdown_ms < self.latest_safe_ms()
    }

    /// Reject configurations whose window is empty.
    pub fn validate(&self) -> GuardResult<()> {
        if self.latest_safe_ms() <= self.cooloff_ms {
            return Err(GuardError::Configuration(format!(
                "empty topup window: period {} - topup {} - warmup {} leaves nothing above cooloff {}",
                self.period_ms, self.topup_time_ms, self.warmup_ms, self.cooloff_ms
            )));
        }
        Ok(())
    }
}

/// Identifier pattern for free-variable discovery.
static IDENTIFIER: Lazy<Regex> = Lazy::new(|| {
    // The pattern is a literal; compilation cannot fail.
    #[allow(clippy::unwrap_used)]
    let pattern = Regex::new(r"\b[A-Za-z_][A-Za-z0-9_]*\b").unwrap();
    pattern
});

/// Rhai words that must not be mistaken for scannable names.
const RHAI_KEYWORDS: &[&str] = &[
    "true", "false", "let", "const", "if", "else", "switch", "while", "loop",
    "for", "in", "do", "until", "break", "continue", "return", "throw", "try",
    "catch", "fn", "private", "import", "export", "as", "global", "this",
    "type_of", "print", "debug", "eval",
];

/// Maximum Rhai operations per evaluation, to bound runaway expressions.
const MAX_EXPRESSION_OPS: u64 = 10_000;

/// A compiled boolean expression over named scannable readings.
///
/// Free variables are discovered from the expression text and must each
/// correspond to a registered, subscribable scannable. Evaluation takes a map
/// of the latest readings and returns the truth value.
pub struct ExprCondition {
    engine: Engine,
    ast: AST,
    text: String,
    variables: Vec<String>,
}

impl ExprCondition {
    /// Compile an expression and discover its free variables.
    pub fn parse(text: &str) -> GuardResult<Self> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(GuardError::Expression("empty expression".to_string()));
        }

        let mut engine = Engine::new();
        engine.on_progress(|count| {
            if count > MAX_EXPRESSION_OPS {
                Some(
                    format!("expression exceeded {} operations", MAX_EXPRESSION_OPS).into(),
                )
            } else {
                None
            }
        });

        let ast = engine
            .compile_expression(trimmed)
            .map_err(|e| GuardError::Expression(format!("cannot parse '{}': {}", trimmed, e)))?;

        let variables = free_variables(trimmed);
        if variables.is_empty() {
            return Err(GuardError::Expression(format!(
                "expression '{}' references no scannables",
                trimmed
            )));
        }

        Ok(Self {
            engine,
            ast,
            text: trimmed.to_string(),
            variables,
        })
    }

    /// The original expression text.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Free variables in first-occurrence order.
    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    /// Evaluate against the latest readings.
    ///
    /// Every free variable must have a reading; the watchdog seeds the map
    /// with initial positions at scan start, so a missing entry indicates a
    /// logic error and is reported rather than defaulted.
    pub fn evaluate(&self, readings: &HashMap<String, PositionValue>) -> GuardResult<bool> {
        let mut scope = Scope::new();
        for var in &self.variables {
            let value = readings.get(var).ok_or_else(|| {
                GuardError::Expression(format!("no reading for scannable '{}'", var))
            })?;
            match value {
                PositionValue::Float(v) => scope.push(var.as_str(), *v),
                PositionValue::Flag(b) => scope.push(var.as_str(), *b),
                PositionValue::Text(s) => scope.push(var.as_str(), s.clone()),
            };
        }

        self.engine
            .eval_ast_with_scope::<bool>(&mut scope, &self.ast)
            .map_err(|e| {
                GuardError::Expression(format!("evaluating '{}': {}", self.text, e))
            })
    }
}

impl std::fmt::Debug for ExprCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExprCondition")
            .field("text", &self.text)
            .field("variables", &self.variables)
            .finish()
    }
}

/// Extract the free variables of an expression.
///
/// String literals are blanked first so their contents are not mistaken for
/// identifiers, then keywords and function-call names are filtered out.
fn free_variables(text: &str) -> Vec<String> {
    let blanked = blank_string_literals(text);
    let bytes = blanked.as_bytes();

    let mut seen = Vec::new();
    for m in IDENTIFIER.find_iter(&blanked) {
        let name = m.as_str();
        if RHAI_KEYWORDS.contains(&name) {
            continue;
        }
        // An identifier directly followed by '(' is a function call.
        let mut i = m.end();
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i < bytes.len() && bytes[i] == b'(' {
            continue;
        }
        if !seen.iter().any(|s| s == name) {
            seen.push(name.to_string());
        }
    }
    seen
}

/// Replace quoted spans with spaces, preserving offsets.
fn blank_string_literals(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut quote: Option<char> = None;
    for c in text.chars() {
        match quote {
            Some(q) if c == q => {
                quote = None;
                out.push(' ');
            }
            Some(_) => out.push(' '),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                out.push(' ');
            }
            None => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference_window() -> TopupWindow {
        TopupWindow {
            cooloff_ms: 4000,
            warmup_ms: 5000,
            period_ms: 600_000,
            topup_time_ms: 15_000,
        }
    }

    #[test]
    fn test_window_bounds() {
        let w = reference_window();
        assert_eq!(w.latest_safe_ms(), 580_000);

        assert!(w.permits(100_000));
        assert!(!w.permits(590_000)); // too close to the next interruption
        assert!(!w.permits(4000)); // still cooling off
        assert!(!w.permits(-1)); // countdown lost
    }

    #[test]
    fn test_window_validation() {
        let mut w = reference_window();
        assert!(w.validate().is_ok());

        w.period_ms = 20_000; // 20000 - 15000 - 5000 = 0 <= cooloff
        assert!(w.validate().is_err());
    }

    #[test]
    fn test_free_variable_discovery() {
        let cond = ExprCondition::parse("beam_current > 190.0 && shutter_open").unwrap();
        assert_eq!(cond.variables(), &["beam_current", "shutter_open"]);
    }

    #[test]
    fn test_string_literals_are_not_variables() {
        let cond = ExprCondition::parse(r#"machine_mode == "Normal""#).unwrap();
        assert_eq!(cond.variables(), &["machine_mode"]);
    }

    #[test]
    fn test_function_calls_are_not_variables() {
        let cond = ExprCondition::parse("abs(offset) < 0.5").unwrap();
        assert_eq!(cond.variables(), &["offset"]);
    }

    #[test]
    fn test_duplicate_variables_collapse() {
        let cond = ExprCondition::parse("beam > 10.0 && beam < 400.0").unwrap();
        assert_eq!(cond.variables(), &["beam"]);
    }

    #[test]
    fn test_evaluation() {
        let cond = ExprCondition::parse("beam_current > 190.0 && shutter_open").unwrap();

        let mut readings = HashMap::new();
        readings.insert("beam_current".to_string(), PositionValue::Float(200.0));
        readings.insert("shutter_open".to_string(), PositionValue::Flag(true));
        assert!(cond.evaluate(&readings).unwrap());

        readings.insert("beam_current".to_string(), PositionValue::Float(12.0));
        assert!(!cond.evaluate(&readings).unwrap());
    }

    #[test]
    fn test_text_comparison() {
        let cond = ExprCondition::parse(r#"machine_mode == "Normal""#).unwrap();

        let mut readings = HashMap::new();
        readings.insert("machine_mode".to_string(), PositionValue::Text("Normal".into()));
        assert!(cond.evaluate(&readings).unwrap());

        readings.insert("machine_mode".to_string(), PositionValue::Text("Shutdown".into()));
        assert!(!cond.evaluate(&readings).unwrap());
    }

    #[test]
    fn test_missing_reading_is_an_error() {
        let cond = ExprCondition::parse("beam_current > 190.0").unwrap();
        let readings = HashMap::new();
        assert!(matches!(
            cond.evaluate(&readings),
            Err(GuardError::Expression(_))
        ));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(ExprCondition::parse("").is_err());
        assert!(ExprCondition::parse("beam >").is_err());
        assert!(ExprCondition::parse("42").is_err()); // no scannables referenced
    }

    #[test]
    fn test_non_boolean_result_is_an_error() {
        let cond = ExprCondition::parse("beam_current + 1.0").unwrap();
        let mut readings = HashMap::new();
        readings.insert("beam_current".to_string(), PositionValue::Float(1.0));
        assert!(cond.evaluate(&readings).is_err());
    }
}
