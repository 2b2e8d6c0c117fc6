//! Per-event-type retention sampling.
//!
//! The chain consults this policy before every append: events the policy
//! drops return a sentinel receipt without touching storage, kept events
//! get a physical retention horizon stamped onto the row.

use chrono::{DateTime, Duration, Utc};
use sentinel_types::config::{RetentionConfig, RetentionRule};

/// The decision for one event type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetentionDecision {
    pub keep: bool,
    /// Physical retention horizon; `None` keeps forever.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Compiled retention rules. Exact event-type rules win over the `*`
/// default; with no matching rule everything is kept forever.
#[derive(Debug, Clone, Default)]
pub struct RetentionPolicy {
    rules: Vec<RetentionRule>,
}

impl RetentionPolicy {
    pub fn new(config: RetentionConfig) -> Self {
        Self {
            rules: config.rules,
        }
    }

    pub fn decide(&self, event_type: &str, now: DateTime<Utc>) -> RetentionDecision {
        let rule = self
            .rules
            .iter()
            .find(|r| r.event_type == event_type)
            .or_else(|| self.rules.iter().find(|r| r.event_type == "*"));

        match rule {
            None => RetentionDecision {
                keep: true,
                expires_at: None,
            },
            Some(rule) => RetentionDecision {
                keep: rule.keep,
                expires_at: rule
                    .retention_days
                    .map(|days| now + Duration::days(i64::from(days))),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(rules: Vec<RetentionRule>) -> RetentionPolicy {
        RetentionPolicy::new(RetentionConfig { rules })
    }

    #[test]
    fn no_rules_keeps_everything() {
        let p = policy(vec![]);
        let d = p.decide("policy.decision", Utc::now());
        assert!(d.keep);
        assert!(d.expires_at.is_none());
    }

    #[test]
    fn exact_rule_wins_over_wildcard() {
        let p = policy(vec![
            RetentionRule {
                event_type: "*".into(),
                keep: true,
                retention_days: Some(30),
            },
            RetentionRule {
                event_type: "debug.trace".into(),
                keep: false,
                retention_days: None,
            },
        ]);
        let now = Utc::now();
        assert!(!p.decide("debug.trace", now).keep);

        let d = p.decide("policy.decision", now);
        assert!(d.keep);
        assert_eq!(d.expires_at, Some(now + Duration::days(30)));
    }
}
