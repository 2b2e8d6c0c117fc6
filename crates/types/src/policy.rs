//! Policy records, the rule predicate language, and evaluation contexts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PolicyError;

/// Policy severity. The derived ordering (LOW first) is load-bearing: the
/// check path iterates candidate policies in ascending severity, then
/// name, then version.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Lifecycle state of a policy version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyState {
    Draft,
    Simulating,
    Canary,
    Active,
    Deprecated,
}

impl PolicyState {
    /// Transitions are monotonic along `draft → simulating → canary →
    /// active → deprecated`, except that a canary may be deprecated
    /// directly (rollback) and an active version is deprecated when it is
    /// superseded.
    pub fn can_transition_to(self, next: PolicyState) -> bool {
        use PolicyState::*;
        matches!(
            (self, next),
            (Draft, Simulating)
                | (Simulating, Canary)
                | (Canary, Active)
                | (Canary, Deprecated)
                | (Active, Deprecated)
        )
    }

    /// States whose policies participate in enforcement decisions.
    pub fn is_enforceable(self) -> bool {
        matches!(self, PolicyState::Active | PolicyState::Canary)
    }
}

/// The effect a matching policy imposes on the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    Allow,
    Deny,
}

/// Free-form policy metadata. `effect` is required before a policy may be
/// activated; a matching rule with no effect evaluates as deny.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PolicyMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effect: Option<Effect>,
    /// Fraction of traffic (1..=100) a canary policy is enforced on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canary_percent: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// A versioned policy. `(name, version)` is unique; at most one version
/// per name is `active` at any time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Policy {
    pub id: String,
    pub name: String,
    pub version: u32,
    pub severity: Severity,
    pub rule: RuleNode,
    #[serde(default)]
    pub metadata: PolicyMetadata,
    pub state: PolicyState,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Policy {
    /// Deterministic evaluation order: ascending severity, then name, then version.
    pub fn ordering_key(&self) -> (Severity, &str, u32) {
        (self.severity, self.name.as_str(), self.version)
    }

    /// The effect applied when this policy's rule matches. Deny unless the
    /// metadata says otherwise.
    pub fn effect(&self) -> Effect {
        self.metadata.effect.unwrap_or(Effect::Deny)
    }

    /// Canary sampling percentage, clamped to (0, 100].
    pub fn canary_percent(&self) -> u8 {
        self.metadata.canary_percent.unwrap_or(100).clamp(1, 100)
    }
}

/// One row of the policy edit history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyHistoryEntry {
    pub policy_id: String,
    pub version: u32,
    /// Structured description of what changed.
    pub changes: Value,
    pub edited_by: String,
    pub edited_at: DateTime<Utc>,
}

// --- Rule language -------------------------------------------------------

/// A node of the predicate tree. The wire format is JSON-logic-like:
/// `{"==": [{"var": "action"}, "kernel.async.event"]}`. The tree is
/// interpreted recursively by the evaluator; there is no embedding of the
/// host language.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleNode {
    Eq(Box<RuleNode>, Box<RuleNode>),
    Ne(Box<RuleNode>, Box<RuleNode>),
    Lt(Box<RuleNode>, Box<RuleNode>),
    Le(Box<RuleNode>, Box<RuleNode>),
    Gt(Box<RuleNode>, Box<RuleNode>),
    Ge(Box<RuleNode>, Box<RuleNode>),
    And(Vec<RuleNode>),
    Or(Vec<RuleNode>),
    Not(Box<RuleNode>),
    /// Membership: `{"in": [needle, haystack]}` where haystack is an array
    /// or a string (substring test).
    In(Box<RuleNode>, Box<RuleNode>),
    /// Context variable reference by dotted path, e.g. `principal.id`.
    Var(String),
    /// Regex match: `{"regex": [subject, "pattern"]}`.
    Regex(Box<RuleNode>, String),
    /// A literal JSON value.
    Literal(Value),
}

impl RuleNode {
    /// Parses the JSON-logic wire form. Unknown operators and malformed
    /// arity are rejected so bad rules fail at write time, not at
    /// evaluation time.
    pub fn from_value(v: &Value) -> Result<RuleNode, PolicyError> {
        let obj = match v {
            Value::Object(m) if m.len() == 1 => m,
            // Anything that is not a single-operator object is a literal.
            other => return Ok(RuleNode::Literal(other.clone())),
        };
        let (op, args) = obj.iter().next().ok_or_else(|| {
            PolicyError::InvalidRule("empty rule object".into())
        })?;

        let binary = |args: &Value| -> Result<(Box<RuleNode>, Box<RuleNode>), PolicyError> {
            let arr = args.as_array().filter(|a| a.len() == 2).ok_or_else(|| {
                PolicyError::InvalidRule(format!("operator '{}' expects exactly 2 operands", op))
            })?;
            Ok((
                Box::new(RuleNode::from_value(&arr[0])?),
                Box::new(RuleNode::from_value(&arr[1])?),
            ))
        };

        match op.as_str() {
            "==" => binary(args).map(|(a, b)| RuleNode::Eq(a, b)),
            "!=" => binary(args).map(|(a, b)| RuleNode::Ne(a, b)),
            "<" => binary(args).map(|(a, b)| RuleNode::Lt(a, b)),
            "<=" => binary(args).map(|(a, b)| RuleNode::Le(a, b)),
            ">" => binary(args).map(|(a, b)| RuleNode::Gt(a, b)),
            ">=" => binary(args).map(|(a, b)| RuleNode::Ge(a, b)),
            "in" => binary(args).map(|(a, b)| RuleNode::In(a, b)),
            "and" | "or" => {
                let arr = args.as_array().filter(|a| !a.is_empty()).ok_or_else(|| {
                    PolicyError::InvalidRule(format!(
                        "operator '{}' expects a non-empty operand array",
                        op
                    ))
                })?;
                let nodes = arr
                    .iter()
                    .map(RuleNode::from_value)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(if op == "and" {
                    RuleNode::And(nodes)
                } else {
                    RuleNode::Or(nodes)
                })
            }
            "not" => {
                // Accept both `{"not": X}` and `{"not": [X]}`.
                let inner = match args {
                    Value::Array(a) if a.len() == 1 => &a[0],
                    other => other,
                };
                Ok(RuleNode::Not(Box::new(RuleNode::from_value(inner)?)))
            }
            "var" => {
                let path = match args {
                    Value::String(s) => s.clone(),
                    Value::Array(a) if a.len() == 1 => a[0]
                        .as_str()
                        .ok_or_else(|| {
                            PolicyError::InvalidRule("'var' path must be a string".into())
                        })?
                        .to_string(),
                    _ => {
                        return Err(PolicyError::InvalidRule(
                            "'var' expects a path string".into(),
                        ))
                    }
                };
                Ok(RuleNode::Var(path))
            }
            "regex" => {
                let arr = args.as_array().filter(|a| a.len() == 2).ok_or_else(|| {
                    PolicyError::InvalidRule("'regex' expects [subject, pattern]".into())
                })?;
                let pattern = arr[1]
                    .as_str()
                    .ok_or_else(|| PolicyError::InvalidRule("'regex' pattern must be a string".into()))?;
                // Compile once at parse time to reject bad patterns early.
                regex::Regex::new(pattern)
                    .map_err(|e| PolicyError::InvalidRule(format!("bad regex '{}': {}", pattern, e)))?;
                Ok(RuleNode::Regex(
                    Box::new(RuleNode::from_value(&arr[0])?),
                    pattern.to_string(),
                ))
            }
            other => Err(PolicyError::InvalidRule(format!(
                "unknown operator '{}'",
                other
            ))),
        }
    }

    /// Renders the node back to the JSON-logic wire form.
    pub fn to_value(&self) -> Value {
        use serde_json::json;
        match self {
            RuleNode::Eq(a, b) => json!({"==": [a.to_value(), b.to_value()]}),
            RuleNode::Ne(a, b) => json!({"!=": [a.to_value(), b.to_value()]}),
            RuleNode::Lt(a, b) => json!({"<": [a.to_value(), b.to_value()]}),
            RuleNode::Le(a, b) => json!({"<=": [a.to_value(), b.to_value()]}),
            RuleNode::Gt(a, b) => json!({">": [a.to_value(), b.to_value()]}),
            RuleNode::Ge(a, b) => json!({">=": [a.to_value(), b.to_value()]}),
            RuleNode::And(xs) => {
                json!({"and": xs.iter().map(RuleNode::to_value).collect::<Vec<_>>()})
            }
            RuleNode::Or(xs) => {
                json!({"or": xs.iter().map(RuleNode::to_value).collect::<Vec<_>>()})
            }
            RuleNode::Not(x) => json!({"not": x.to_value()}),
            RuleNode::In(a, b) => json!({"in": [a.to_value(), b.to_value()]}),
            RuleNode::Var(p) => json!({"var": p}),
            RuleNode::Regex(a, p) => json!({"regex": [a.to_value(), p]}),
            RuleNode::Literal(v) => v.clone(),
        }
    }
}

impl Serialize for RuleNode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RuleNode {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let v = Value::deserialize(deserializer)?;
        RuleNode::from_value(&v).map_err(serde::de::Error::custom)
    }
}

// --- Evaluation context --------------------------------------------------

/// The typed context a rule evaluates against, built from the triggering
/// request or audit event.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EvaluationContext {
    pub action: String,
    #[serde(default)]
    pub actor: Value,
    #[serde(default)]
    pub resource: Value,
    #[serde(default)]
    pub context: Value,
    /// Correlates repeated evaluations of the same request; also the
    /// canary sampling key.
    #[serde(default)]
    pub request_id: String,
}

impl EvaluationContext {
    /// Builds a context from an audit event. The payload's `actor`,
    /// `resource`, and `context` fields map directly; `action` is the
    /// payload's `action` field falling back to the event type.
    pub fn from_audit_event(event: &crate::audit::AuditEvent) -> Self {
        let field = |name: &str| event.payload.get(name).cloned().unwrap_or(Value::Null);
        let action = event
            .payload
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or(&event.event_type)
            .to_string();
        Self {
            action,
            actor: field("actor"),
            resource: field("resource"),
            context: field("context"),
            request_id: event.id.clone(),
        }
    }

    /// Resolves a dotted variable path against the context. The first
    /// segment selects a root (`action`, `actor`, `resource`, `context`,
    /// `request_id`); the remainder indexes into that value.
    pub fn lookup(&self, path: &str) -> Value {
        let mut parts = path.split('.');
        let root = match parts.next() {
            Some("action") => return Value::String(self.action.clone()),
            Some("request_id") => return Value::String(self.request_id.clone()),
            Some("actor") | Some("principal") => &self.actor,
            Some("resource") => &self.resource,
            Some("context") => &self.context,
            _ => return Value::Null,
        };
        let mut cur = root;
        for seg in parts {
            match cur.get(seg) {
                Some(next) => cur = next,
                None => return Value::Null,
            }
        }
        cur.clone()
    }
}

/// The outcome of evaluating one rule against one context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Decision {
    pub matched: bool,
    pub effect: Effect,
    pub explanation: String,
}

impl Decision {
    pub fn non_match(explanation: impl Into<String>) -> Self {
        Self {
            matched: false,
            effect: Effect::Allow,
            explanation: explanation.into(),
        }
    }
}

/// One observation in a canary policy's rolling window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CanarySample {
    pub enforced: bool,
    pub allowed: bool,
    pub effect: Effect,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn severity_orders_low_first() {
        let mut v = vec![Severity::Critical, Severity::Low, Severity::High, Severity::Medium];
        v.sort();
        assert_eq!(
            v,
            vec![Severity::Low, Severity::Medium, Severity::High, Severity::Critical]
        );
    }

    #[test]
    fn state_machine_is_monotonic() {
        use PolicyState::*;
        assert!(Draft.can_transition_to(Simulating));
        assert!(Simulating.can_transition_to(Canary));
        assert!(Canary.can_transition_to(Active));
        assert!(Canary.can_transition_to(Deprecated));
        assert!(Active.can_transition_to(Deprecated));
        assert!(!Active.can_transition_to(Canary));
        assert!(!Deprecated.can_transition_to(Active));
        assert!(!Draft.can_transition_to(Active));
    }

    #[test]
    fn rule_round_trips_through_wire_form() {
        let wire = json!({"and": [
            {"==": [{"var": "action"}, "kernel.async.event"]},
            {"regex": [{"var": "actor.id"}, "^svc-"]},
            {"in": [{"var": "resource.pool"}, ["gpu-a", "gpu-b"]]}
        ]});
        let node = RuleNode::from_value(&wire).unwrap();
        assert_eq!(node.to_value(), wire);
    }

    #[test]
    fn unknown_operator_is_rejected() {
        let wire = json!({"xor": [true, false]});
        assert!(RuleNode::from_value(&wire).is_err());
    }

    #[test]
    fn bad_regex_fails_at_parse_time() {
        let wire = json!({"regex": [{"var": "actor.id"}, "("]});
        assert!(RuleNode::from_value(&wire).is_err());
    }

    #[test]
    fn var_accepts_string_and_array_forms() {
        assert_eq!(
            RuleNode::from_value(&json!({"var": "actor.id"})).unwrap(),
            RuleNode::Var("actor.id".into())
        );
        assert_eq!(
            RuleNode::from_value(&json!({"var": ["actor.id"]})).unwrap(),
            RuleNode::Var("actor.id".into())
        );
    }

    #[test]
    fn context_lookup_resolves_nested_paths() {
        let ctx = EvaluationContext {
            action: "artifact.promote".into(),
            actor: json!({"id": "svc-eval", "roles": ["promoter"]}),
            resource: json!({"pool": "gpu-a", "limits": {"delta": 4}}),
            context: Value::Null,
            request_id: "r-1".into(),
        };
        assert_eq!(ctx.lookup("action"), json!("artifact.promote"));
        assert_eq!(ctx.lookup("actor.id"), json!("svc-eval"));
        assert_eq!(ctx.lookup("principal.id"), json!("svc-eval"));
        assert_eq!(ctx.lookup("resource.limits.delta"), json!(4));
        assert_eq!(ctx.lookup("resource.missing"), Value::Null);
        assert_eq!(ctx.lookup("nonsense.path"), Value::Null);
    }

    #[test]
    fn effect_defaults_to_deny() {
        let p = Policy {
            id: "p1".into(),
            name: "no-async".into(),
            version: 1,
            severity: Severity::Medium,
            rule: RuleNode::Literal(json!(true)),
            metadata: PolicyMetadata::default(),
            state: PolicyState::Draft,
            created_by: "tester".into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(p.effect(), Effect::Deny);
    }
}
