//! The pure policy evaluator.
//!
//! Interprets the tagged rule tree against a typed context. Evaluation is
//! side-effect free and deterministic; an evaluator error is logged,
//! counted, and reported as a non-match so the resulting decision stays
//! conservative.

use sentinel_telemetry::policy_metrics;
use sentinel_types::error::PolicyError;
use sentinel_types::policy::{Decision, EvaluationContext, Policy, RuleNode};
use serde_json::Value;

/// Evaluates one policy against one context.
pub fn evaluate(policy: &Policy, ctx: &EvaluationContext) -> Decision {
    match eval_node(&policy.rule, ctx) {
        Ok(v) => {
            let matched = truthy(&v);
            Decision {
                matched,
                effect: policy.effect(),
                explanation: if matched {
                    format!("policy '{}' v{} matched", policy.name, policy.version)
                } else {
                    format!("policy '{}' v{} did not match", policy.name, policy.version)
                },
            }
        }
        Err(e) => {
            policy_metrics().inc_evaluation_errors();
            tracing::warn!(
                target: "sentinel",
                policy = %policy.name,
                version = policy.version,
                error = %e,
                "evaluator error treated as non-match"
            );
            Decision::non_match(format!("evaluator error: {}", e))
        }
    }
}

fn eval_node(node: &RuleNode, ctx: &EvaluationContext) -> Result<Value, PolicyError> {
    Ok(match node {
        RuleNode::Literal(v) => v.clone(),
        RuleNode::Var(path) => ctx.lookup(path),
        RuleNode::Eq(a, b) => {
            Value::Bool(json_eq(&eval_node(a, ctx)?, &eval_node(b, ctx)?))
        }
        RuleNode::Ne(a, b) => {
            Value::Bool(!json_eq(&eval_node(a, ctx)?, &eval_node(b, ctx)?))
        }
        RuleNode::Lt(a, b) => Value::Bool(compare(&eval_node(a, ctx)?, &eval_node(b, ctx)?)?.is_lt()),
        RuleNode::Le(a, b) => Value::Bool(compare(&eval_node(a, ctx)?, &eval_node(b, ctx)?)?.is_le()),
        RuleNode::Gt(a, b) => Value::Bool(compare(&eval_node(a, ctx)?, &eval_node(b, ctx)?)?.is_gt()),
        RuleNode::Ge(a, b) => Value::Bool(compare(&eval_node(a, ctx)?, &eval_node(b, ctx)?)?.is_ge()),
        RuleNode::And(nodes) => {
            for n in nodes {
                if !truthy(&eval_node(n, ctx)?) {
                    return Ok(Value::Bool(false));
                }
            }
            Value::Bool(true)
        }
        RuleNode::Or(nodes) => {
            for n in nodes {
                if truthy(&eval_node(n, ctx)?) {
                    return Ok(Value::Bool(true));
                }
            }
            Value::Bool(false)
        }
        RuleNode::Not(inner) => Value::Bool(!truthy(&eval_node(inner, ctx)?)),
        RuleNode::In(needle, haystack) => {
            let needle = eval_node(needle, ctx)?;
            match eval_node(haystack, ctx)? {
                Value::Array(items) => Value::Bool(items.iter().any(|i| json_eq(i, &needle))),
                Value::String(s) => match needle {
                    Value::String(sub) => Value::Bool(s.contains(&sub)),
                    other => {
                        return Err(PolicyError::Evaluation(format!(
                            "'in' needle for string haystack must be a string, got {}",
                            type_name(&other)
                        )))
                    }
                },
                other => {
                    return Err(PolicyError::Evaluation(format!(
                        "'in' haystack must be an array or string, got {}",
                        type_name(&other)
                    )))
                }
            }
        }
        RuleNode::Regex(subject, pattern) => {
            let subject = eval_node(subject, ctx)?;
            let Value::String(s) = subject else {
                return Err(PolicyError::Evaluation(format!(
                    "'regex' subject must be a string, got {}",
                    type_name(&subject)
                )));
            };
            // Patterns were validated at rule-parse time; a failure here
            // means the stored rule was tampered with.
            let re = regex::Regex::new(pattern)
                .map_err(|e| PolicyError::Evaluation(format!("bad pattern: {}", e)))?;
            Value::Bool(re.is_match(&s))
        }
    })
}

/// Equality with numeric coercion: `1` and `1.0` are equal.
fn json_eq(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Result<std::cmp::Ordering, PolicyError> {
    use std::cmp::Ordering;
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x.partial_cmp(&y).ok_or_else(|| {
            PolicyError::Evaluation("NaN is not comparable".into())
        });
    }
    if let (Value::String(x), Value::String(y)) = (a, b) {
        return Ok(x.cmp(y));
    }
    Err(PolicyError::Evaluation(format!(
        "values of type {} and {} are not ordered",
        type_name(a),
        type_name(b)
    )))
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
