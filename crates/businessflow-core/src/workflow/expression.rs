//! JEXL expression evaluator for step conditions, trigger `when` clauses and
//! the `transform` connector.
//!
//! Wraps `jexl_eval::Evaluator` with pre-registered standard transforms.
//! Data is always passed as the evaluation context, never interpolated into
//! expression strings.
//!
//! The evaluator holds boxed closures that are not `Send`, so callers build it
//! inside synchronous code and drop it before the next `.await`.

use std::collections::BTreeSet;

use serde_json::{json, Value};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during expression evaluation.
#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("invalid context: {0}")]
    InvalidContext(String),
}

// ---------------------------------------------------------------------------
// ExpressionEvaluator
// ---------------------------------------------------------------------------

/// JEXL expression evaluator with standard transforms pre-registered.
pub struct ExpressionEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl ExpressionEvaluator {
    /// Create a new evaluator with all standard transforms registered.
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            // String transforms
            .with_transform("lower", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_uppercase()))
            })
            .with_transform("trim", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.trim()))
            })
            .with_transform("split", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let delimiter = args.get(1).and_then(|v| v.as_str()).unwrap_or(",");
                let parts: Vec<&str> = s.split(delimiter).collect();
                Ok(json!(parts))
            })
            .with_transform("contains", |args: &[Value]| {
                let found = match (args.first(), args.get(1)) {
                    (Some(Value::String(s)), Some(Value::String(needle))) => s.contains(needle.as_str()),
                    (Some(Value::Array(items)), Some(needle)) => items.contains(needle),
                    _ => false,
                };
                Ok(json!(found))
            })
            .with_transform("startsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let prefix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.starts_with(prefix)))
            })
            .with_transform("endsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let suffix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.ends_with(suffix)))
            })
            // Boolean transforms
            .with_transform("not", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(!value_to_bool(&val)))
            })
            // Length transform (works on strings, arrays, and objects)
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.chars().count(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            })
            // Numeric transforms
            .with_transform("sum", |args: &[Value]| {
                let total: f64 = args
                    .first()
                    .and_then(|v| v.as_array())
                    .map(|items| items.iter().filter_map(|v| v.as_f64()).sum())
                    .unwrap_or(0.0);
                Ok(json!(total))
            })
            .with_transform("keys", |args: &[Value]| {
                let keys: Vec<&String> = args
                    .first()
                    .and_then(|v| v.as_object())
                    .map(|o| o.keys().collect())
                    .unwrap_or_default();
                Ok(json!(keys))
            });

        Self { evaluator }
    }

    /// Evaluate an expression to a boolean result.
    ///
    /// The `context` must be a JSON object. Results are coerced to boolean
    /// using JavaScript-like truthiness rules.
    pub fn evaluate_bool(&self, expression: &str, context: &Value) -> Result<bool, ExpressionError> {
        self.evaluate_value(expression, context)
            .map(|v| value_to_bool(&v))
    }

    /// Evaluate an expression and return the raw JSON value.
    pub fn evaluate_value(&self, expression: &str, context: &Value) -> Result<Value, ExpressionError> {
        if !context.is_object() {
            return Err(ExpressionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }

        self.evaluator
            .eval_in_context(expression, context)
            .map_err(|e| ExpressionError::EvalFailed(e.to_string()))
    }
}

impl Default for ExpressionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

/// Evaluate a boolean expression with a throwaway evaluator.
pub fn evaluate_condition(expression: &str, context: &Value) -> Result<bool, ExpressionError> {
    ExpressionEvaluator::new().evaluate_bool(expression, context)
}

/// Check that an expression parses, using an empty context.
pub fn check_syntax(expression: &str) -> Result<(), ExpressionError> {
    match ExpressionEvaluator::new().evaluate_value(expression, &json!({})) {
        Ok(_) => Ok(()),
        Err(ExpressionError::EvalFailed(msg)) if is_runtime_only_failure(&msg) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Errors that an empty context can produce for a well-formed expression.
fn is_runtime_only_failure(msg: &str) -> bool {
    let msg = msg.to_ascii_lowercase();
    !(msg.contains("pars") || msg.contains("unrecognized") || msg.contains("expected") || msg.contains("token"))
}

/// Coerce a JSON value to boolean using JavaScript-like truthiness.
pub fn value_to_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// ---------------------------------------------------------------------------
// Reference scanning
// ---------------------------------------------------------------------------

/// Step IDs referenced as `steps.<id>` or `steps['<id>']` in an expression.
///
/// Text inside string literals is ignored.
pub fn referenced_steps(expression: &str) -> BTreeSet<String> {
    let code = strip_string_literals(expression);
    let mut found = BTreeSet::new();
    let bytes = code.as_bytes();
    let mut search_from = 0;

    while let Some(offset) = code[search_from..].find("steps") {
        let start = search_from + offset;
        let end = start + "steps".len();
        search_from = end;

        let preceded_by_ident = start > 0 && is_ident_byte(bytes[start - 1]);
        if preceded_by_ident {
            continue;
        }
        let rest = &code[end..];
        if let Some(after_dot) = rest.strip_prefix('.') {
            let id: String = after_dot
                .chars()
                .take_while(|c| c.is_alphanumeric() || *c == '_')
                .collect();
            if !id.is_empty() {
                found.insert(id);
            }
        } else if let Some(after_bracket) = rest.strip_prefix('[') {
            let after_bracket = after_bracket.trim_start();
            if let Some(quote) = after_bracket.chars().next().filter(|c| *c == '\'' || *c == '"') {
                let inner = &after_bracket[1..];
                if let Some(close) = inner.find(quote) {
                    found.insert(inner[..close].to_string());
                }
            }
        }
    }

    found
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'.'
}

/// Replace the contents of string literals with spaces, keeping byte offsets.
///
/// Literals opened directly after `[` are kept so `steps['id']` stays visible.
fn strip_string_literals(expression: &str) -> String {
    let mut out = String::with_capacity(expression.len());
    // (quote char, keep contents)
    let mut literal: Option<(char, bool)> = None;
    let mut prev = '\0';
    for c in expression.chars() {
        match literal {
            Some((q, _)) if c == q && prev != '\\' => {
                literal = None;
                out.push(c);
            }
            Some((_, true)) => out.push(c),
            Some((_, false)) => out.extend(std::iter::repeat_n(' ', c.len_utf8())),
            None if c == '\'' || c == '"' => {
                let keep = out.trim_end().ends_with('[');
                literal = Some((c, keep));
                out.push(c);
            }
            None => out.push(c),
        }
        prev = c;
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn evaluator() -> ExpressionEvaluator {
        ExpressionEvaluator::new()
    }

    fn run_scope() -> Value {
        json!({
            "context": { "customer": { "tier": "Gold", "region": "eu" }, "amount": 1200 },
            "steps": {
                "fetch": { "output": { "status": 200, "tags": ["vip", "late"] } },
                "score": { "output": 0.82 }
            }
        })
    }

    // -------------------------------------------------------------------
    // Property access and operators
    // -------------------------------------------------------------------

    #[test]
    fn test_step_output_access() {
        let eval = evaluator();
        assert!(eval.evaluate_bool("steps.fetch.output.status == 200", &run_scope()).unwrap());
        assert!(eval.evaluate_bool("steps.score.output > 0.8", &run_scope()).unwrap());
        assert_eq!(
            eval.evaluate_value("steps.fetch.output.tags[1]", &run_scope()).unwrap(),
            json!("late")
        );
    }

    #[test]
    fn test_boolean_operators() {
        let eval = evaluator();
        assert!(eval
            .evaluate_bool("context.amount > 1000 && context.customer.region == 'eu'", &run_scope())
            .unwrap());
        assert!(!eval
            .evaluate_bool("context.amount > 5000 || context.customer.region == 'us'", &run_scope())
            .unwrap());
    }

    #[test]
    fn test_in_operator_array() {
        let eval = evaluator();
        assert!(eval.evaluate_bool("'vip' in steps.fetch.output.tags", &run_scope()).unwrap());
        assert!(!eval.evaluate_bool("'new' in steps.fetch.output.tags", &run_scope()).unwrap());
    }

    #[test]
    fn test_ternary_expression() {
        let eval = evaluator();
        assert_eq!(
            eval.evaluate_value("(context.amount > 1000) ? 'review' : 'auto'", &run_scope())
                .unwrap(),
            json!("review")
        );
    }

    #[test]
    fn test_missing_property_is_falsy() {
        let eval = evaluator();
        assert_eq!(
            eval.evaluate_value("context.nonexistent", &run_scope()).unwrap(),
            Value::Null
        );
        assert!(!eval.evaluate_bool("context.nonexistent", &run_scope()).unwrap());
    }

    // -------------------------------------------------------------------
    // Transforms
    // -------------------------------------------------------------------

    #[test]
    fn test_string_transforms() {
        let eval = evaluator();
        let scope = run_scope();
        assert_eq!(
            eval.evaluate_value("context.customer.tier|lower", &scope).unwrap(),
            json!("gold")
        );
        assert_eq!(
            eval.evaluate_value("context.customer.tier|upper", &scope).unwrap(),
            json!("GOLD")
        );
        assert!(eval
            .evaluate_bool("context.customer.tier|startsWith('Go')", &scope)
            .unwrap());
        assert!(eval
            .evaluate_bool("context.customer.tier|endsWith('ld')", &scope)
            .unwrap());
    }

    #[test]
    fn test_contains_on_strings_and_arrays() {
        let eval = evaluator();
        let scope = run_scope();
        assert!(eval
            .evaluate_bool("context.customer.tier|contains('ol')", &scope)
            .unwrap());
        assert!(eval
            .evaluate_bool("steps.fetch.output.tags|contains('late')", &scope)
            .unwrap());
    }

    #[test]
    fn test_length_sum_and_keys() {
        let eval = evaluator();
        let ctx = json!({ "items": [1, 2, 3.5], "obj": { "a": 1, "b": 2 } });
        assert_eq!(eval.evaluate_value("items|length", &ctx).unwrap(), json!(3.0));
        assert_eq!(eval.evaluate_value("items|sum", &ctx).unwrap(), json!(6.5));
        assert_eq!(eval.evaluate_value("obj|keys", &ctx).unwrap(), json!(["a", "b"]));
    }

    #[test]
    fn test_not_transform() {
        let eval = evaluator();
        assert!(eval.evaluate_bool("(flag)|not", &json!({ "flag": false })).unwrap());
        assert!(!eval.evaluate_bool("(flag)|not", &json!({ "flag": "yes" })).unwrap());
    }

    // -------------------------------------------------------------------
    // Errors and truthiness
    // -------------------------------------------------------------------

    #[test]
    fn test_invalid_context_not_object() {
        let eval = evaluator();
        assert!(matches!(
            eval.evaluate_bool("true", &json!("string")),
            Err(ExpressionError::InvalidContext(_))
        ));
    }

    #[test]
    fn test_syntax_check() {
        assert!(check_syntax("steps.fetch.output.status == 200").is_ok());
        assert!(check_syntax("steps.fetch.output.status ==").is_err());
    }

    #[test]
    fn test_value_truthiness() {
        assert!(!value_to_bool(&json!(0)));
        assert!(!value_to_bool(&json!("")));
        assert!(!value_to_bool(&Value::Null));
        assert!(value_to_bool(&json!([])));
        assert!(value_to_bool(&json!("no")));
    }

    // -------------------------------------------------------------------
    // Reference scanning
    // -------------------------------------------------------------------

    #[test]
    fn test_referenced_steps() {
        let refs = referenced_steps(
            "steps.fetch.output.status == 200 && steps['score'].output > 0.5 && mysteps.x",
        );
        assert_eq!(
            refs.into_iter().collect::<Vec<_>>(),
            vec!["fetch".to_string(), "score".to_string()]
        );
    }

    #[test]
    fn test_referenced_steps_ignores_string_literals() {
        let refs = referenced_steps("context.note == 'see steps.ghost' && steps.real.output");
        assert_eq!(refs.into_iter().collect::<Vec<_>>(), vec!["real".to_string()]);
    }
}
