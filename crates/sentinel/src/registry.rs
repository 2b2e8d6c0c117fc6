//! The versioned policy registry.
//!
//! Policies are stored in the shared redb database with `(name, version)`
//! uniqueness, a full edit history, and a role-authorized state machine.
//! The enforceable set (`active` + `canary`) is read on every check and
//! every consumed event, so it is served from a TTL cache invalidated by
//! `policy.updated` events.

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use redb::{Database, ReadableTable, TableDefinition};
use sentinel_telemetry::policy_metrics;
use sentinel_types::error::PolicyError;
use sentinel_types::policy::{
    Policy, PolicyHistoryEntry, PolicyMetadata, PolicyState, RuleNode, Severity,
};
use serde_json::json;

const POLICIES: TableDefinition<&str, &[u8]> = TableDefinition::new("POLICIES");
const NAME_VERSION: TableDefinition<&str, &str> = TableDefinition::new("POLICY_NAME_VERSION");
const HISTORY: TableDefinition<&str, &[u8]> = TableDefinition::new("POLICY_HISTORY");

const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5);

fn be(e: impl std::fmt::Display) -> PolicyError {
    PolicyError::Backend(e.to_string())
}

fn nv_key(name: &str, version: u32) -> String {
    format!("{}@{}", name, version)
}

/// A draft submission.
#[derive(Debug, Clone)]
pub struct NewPolicy {
    pub name: String,
    pub version: u32,
    pub severity: Severity,
    pub rule: RuleNode,
    pub metadata: PolicyMetadata,
}

struct CacheState {
    fetched_at: Option<Instant>,
    enforceable: Arc<Vec<Policy>>,
}

pub struct PolicyRegistry {
    db: Arc<Database>,
    cache: RwLock<CacheState>,
    cache_ttl: Duration,
}

impl PolicyRegistry {
    pub fn new(db: Arc<Database>) -> Result<Self, PolicyError> {
        let txn = db.begin_write().map_err(be)?;
        {
            txn.open_table(POLICIES).map_err(be)?;
            txn.open_table(NAME_VERSION).map_err(be)?;
            txn.open_table(HISTORY).map_err(be)?;
        }
        txn.commit().map_err(be)?;
        Ok(Self {
            db,
            cache: RwLock::new(CacheState {
                fetched_at: None,
                enforceable: Arc::new(Vec::new()),
            }),
            cache_ttl: DEFAULT_CACHE_TTL,
        })
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Inserts a new policy version in `draft` state.
    pub fn create(&self, new: NewPolicy, created_by: &str) -> Result<Policy, PolicyError> {
        let now = Utc::now();
        let policy = Policy {
            id: uuid::Uuid::new_v4().to_string(),
            name: new.name,
            version: new.version,
            severity: new.severity,
            rule: new.rule,
            metadata: new.metadata,
            state: PolicyState::Draft,
            created_by: created_by.to_string(),
            created_at: now,
            updated_at: now,
        };

        let row = serde_json::to_vec(&policy)?;
        let key = nv_key(&policy.name, policy.version);

        let txn = self.db.begin_write().map_err(be)?;
        {
            let mut by_nv = txn.open_table(NAME_VERSION).map_err(be)?;
            if by_nv.get(key.as_str()).map_err(be)?.is_some() {
                return Err(PolicyError::DuplicateVersion {
                    name: policy.name,
                    version: policy.version,
                });
            }
            by_nv.insert(key.as_str(), policy.id.as_str()).map_err(be)?;

            let mut table = txn.open_table(POLICIES).map_err(be)?;
            table.insert(policy.id.as_str(), row.as_slice()).map_err(be)?;

            Self::push_history(
                &txn,
                &policy.id,
                policy.version,
                json!({"op": "created", "state": policy.state}),
                created_by,
            )?;
        }
        txn.commit().map_err(be)?;
        self.invalidate_cache();
        tracing::info!(target: "sentinel", policy = %policy.name, version = policy.version, "policy created");
        Ok(policy)
    }

    /// Updates the mutable fields of a draft or simulating policy.
    pub fn update(
        &self,
        id: &str,
        severity: Option<Severity>,
        rule: Option<RuleNode>,
        metadata: Option<PolicyMetadata>,
        edited_by: &str,
    ) -> Result<Policy, PolicyError> {
        let mut policy = self.get(id)?;
        if !matches!(policy.state, PolicyState::Draft | PolicyState::Simulating) {
            return Err(PolicyError::InvalidTransition {
                from: policy.state,
                to: policy.state,
            });
        }

        let mut changes = serde_json::Map::new();
        if let Some(s) = severity {
            changes.insert("severity".into(), json!(s));
            policy.severity = s;
        }
        if let Some(r) = rule {
            changes.insert("rule".into(), r.to_value());
            policy.rule = r;
        }
        if let Some(m) = metadata {
            changes.insert("metadata".into(), json!(m));
            policy.metadata = m;
        }
        if changes.is_empty() {
            return Ok(policy);
        }
        policy.updated_at = Utc::now();

        let row = serde_json::to_vec(&policy)?;
        let txn = self.db.begin_write().map_err(be)?;
        {
            let mut table = txn.open_table(POLICIES).map_err(be)?;
            table.insert(id, row.as_slice()).map_err(be)?;
            Self::push_history(
                &txn,
                id,
                policy.version,
                json!({"op": "updated", "fields": changes}),
                edited_by,
            )?;
        }
        txn.commit().map_err(be)?;
        self.invalidate_cache();
        Ok(policy)
    }

    /// Drives a policy through its state machine. Activation requires an
    /// explicit effect and deprecates any previously active version of the
    /// same name; the returned vector lists those superseded policies.
    pub fn transition(
        &self,
        id: &str,
        to: PolicyState,
        edited_by: &str,
    ) -> Result<(Policy, Vec<Policy>), PolicyError> {
        let mut policy = self.get(id)?;
        if !policy.state.can_transition_to(to) {
            return Err(PolicyError::InvalidTransition {
                from: policy.state,
                to,
            });
        }
        if to == PolicyState::Active && policy.metadata.effect.is_none() {
            return Err(PolicyError::EffectRequired(policy.name));
        }

        let mut superseded = Vec::new();
        if to == PolicyState::Active {
            for other in self.list(None)? {
                if other.name == policy.name
                    && other.id != policy.id
                    && other.state == PolicyState::Active
                {
                    superseded.push(other);
                }
            }
        }

        let from = policy.state;
        policy.state = to;
        policy.updated_at = Utc::now();
        let row = serde_json::to_vec(&policy)?;

        let txn = self.db.begin_write().map_err(be)?;
        {
            let mut table = txn.open_table(POLICIES).map_err(be)?;
            table.insert(id, row.as_slice()).map_err(be)?;
            Self::push_history(
                &txn,
                id,
                policy.version,
                json!({"op": "transition", "from": from, "to": to}),
                edited_by,
            )?;

            for old in &mut superseded {
                old.state = PolicyState::Deprecated;
                old.updated_at = policy.updated_at;
                let old_row = serde_json::to_vec(&old)?;
                table.insert(old.id.as_str(), old_row.as_slice()).map_err(be)?;
                Self::push_history(
                    &txn,
                    &old.id,
                    old.version,
                    json!({"op": "transition", "from": PolicyState::Active, "to": PolicyState::Deprecated, "superseded_by": policy.id}),
                    edited_by,
                )?;
            }
        }
        txn.commit().map_err(be)?;
        self.invalidate_cache();
        tracing::info!(
            target: "sentinel",
            policy = %policy.name,
            version = policy.version,
            from = ?from,
            to = ?to,
            "policy state transition"
        );
        Ok((policy, superseded))
    }

    /// Deletes a draft. Any other state is immutable history.
    pub fn delete(&self, id: &str) -> Result<(), PolicyError> {
        let policy = self.get(id)?;
        if policy.state != PolicyState::Draft {
            return Err(PolicyError::InvalidTransition {
                from: policy.state,
                to: policy.state,
            });
        }
        let txn = self.db.begin_write().map_err(be)?;
        {
            let mut table = txn.open_table(POLICIES).map_err(be)?;
            table.remove(id).map_err(be)?;
            let mut by_nv = txn.open_table(NAME_VERSION).map_err(be)?;
            by_nv
                .remove(nv_key(&policy.name, policy.version).as_str())
                .map_err(be)?;
        }
        txn.commit().map_err(be)?;
        self.invalidate_cache();
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Policy, PolicyError> {
        let txn = self.db.begin_read().map_err(be)?;
        let table = txn.open_table(POLICIES).map_err(be)?;
        let row = table
            .get(id)
            .map_err(be)?
            .ok_or_else(|| PolicyError::NotFound(id.to_string()))?;
        Ok(serde_json::from_slice(row.value())?)
    }

    pub fn get_by_name_version(&self, name: &str, version: u32) -> Result<Policy, PolicyError> {
        let txn = self.db.begin_read().map_err(be)?;
        let by_nv = txn.open_table(NAME_VERSION).map_err(be)?;
        let id = by_nv
            .get(nv_key(name, version).as_str())
            .map_err(be)?
            .ok_or_else(|| PolicyError::NotFound(nv_key(name, version)))?
            .value()
            .to_string();
        drop(by_nv);
        let table = txn.open_table(POLICIES).map_err(be)?;
        let row = table
            .get(id.as_str())
            .map_err(be)?
            .ok_or_else(|| PolicyError::NotFound(id.clone()))?;
        Ok(serde_json::from_slice(row.value())?)
    }

    /// Lists policies, optionally filtered by state.
    pub fn list(&self, state: Option<PolicyState>) -> Result<Vec<Policy>, PolicyError> {
        let txn = self.db.begin_read().map_err(be)?;
        let table = txn.open_table(POLICIES).map_err(be)?;
        let mut out = Vec::new();
        for item in table.iter().map_err(be)? {
            let (_, row) = item.map_err(be)?;
            let policy: Policy = serde_json::from_slice(row.value())?;
            if state.map_or(true, |s| policy.state == s) {
                out.push(policy);
            }
        }
        out.sort_by(|a, b| a.ordering_key().cmp(&b.ordering_key()));
        Ok(out)
    }

    /// The enforceable set (`active` + `canary`) in evaluation order:
    /// ascending severity, then name, then version. Served from the TTL
    /// cache.
    pub fn enforceable(&self) -> Result<Arc<Vec<Policy>>, PolicyError> {
        {
            let cache = self
                .cache
                .read()
                .map_err(|_| PolicyError::Backend("cache lock poisoned".into()))?;
            if let Some(at) = cache.fetched_at {
                if at.elapsed() < self.cache_ttl {
                    return Ok(cache.enforceable.clone());
                }
            }
        }
        let fresh: Vec<Policy> = self
            .list(None)?
            .into_iter()
            .filter(|p| p.state.is_enforceable())
            .collect();
        let fresh = Arc::new(fresh);
        let mut cache = self
            .cache
            .write()
            .map_err(|_| PolicyError::Backend("cache lock poisoned".into()))?;
        cache.fetched_at = Some(Instant::now());
        cache.enforceable = fresh.clone();
        policy_metrics().inc_cache_refreshes();
        Ok(fresh)
    }

    /// Drops the cached enforceable set. Triggered by writes and by
    /// `policy.updated` events observed on the audit stream.
    pub fn invalidate_cache(&self) {
        if let Ok(mut cache) = self.cache.write() {
            cache.fetched_at = None;
        }
    }

    pub fn history(&self, id: &str) -> Result<Vec<PolicyHistoryEntry>, PolicyError> {
        let txn = self.db.begin_read().map_err(be)?;
        let table = txn.open_table(HISTORY).map_err(be)?;
        let prefix = format!("{}#", id);
        let mut out = Vec::new();
        for item in table.range(prefix.as_str()..).map_err(be)? {
            let (key, row) = item.map_err(be)?;
            if !key.value().starts_with(&prefix) {
                break;
            }
            out.push(serde_json::from_slice(row.value())?);
        }
        Ok(out)
    }

    fn push_history(
        txn: &redb::WriteTransaction,
        policy_id: &str,
        version: u32,
        changes: serde_json::Value,
        edited_by: &str,
    ) -> Result<(), PolicyError> {
        let entry = PolicyHistoryEntry {
            policy_id: policy_id.to_string(),
            version,
            changes,
            edited_by: edited_by.to_string(),
            edited_at: Utc::now(),
        };
        let mut table = txn.open_table(HISTORY).map_err(be)?;
        // Keys order history rows by insertion within each policy.
        let prefix = format!("{}#", policy_id);
        let mut seq = 0u64;
        for item in table.range(prefix.as_str()..).map_err(be)? {
            let (key, _) = item.map_err(be)?;
            if !key.value().starts_with(&prefix) {
                break;
            }
            seq += 1;
        }
        let key = format!("{}#{:016x}", policy_id, seq);
        let row = serde_json::to_vec(&entry)?;
        table.insert(key.as_str(), row.as_slice()).map_err(be)?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn test_registry(dir: &tempfile::TempDir) -> PolicyRegistry {
        let db = Arc::new(Database::create(dir.path().join("policies.redb")).unwrap());
        PolicyRegistry::new(db)
            .unwrap()
            .with_cache_ttl(Duration::from_millis(0))
    }

    pub(crate) fn draft(name: &str, version: u32, severity: Severity) -> NewPolicy {
        NewPolicy {
            name: name.into(),
            version,
            severity,
            rule: RuleNode::from_value(&json!({"==": [{"var": "action"}, "x"]})).unwrap(),
            metadata: PolicyMetadata {
                effect: Some(sentinel_types::policy::Effect::Deny),
                ..Default::default()
            },
        }
    }

    fn activate(registry: &PolicyRegistry, id: &str) {
        registry.transition(id, PolicyState::Simulating, "t").unwrap();
        registry.transition(id, PolicyState::Canary, "t").unwrap();
        registry.transition(id, PolicyState::Active, "t").unwrap();
    }

    #[test]
    fn name_version_uniqueness() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(&dir);
        registry.create(draft("p", 1, Severity::Low), "alice").unwrap();
        let err = registry
            .create(draft("p", 1, Severity::High), "alice")
            .unwrap_err();
        assert!(matches!(err, PolicyError::DuplicateVersion { .. }));
        registry.create(draft("p", 2, Severity::Low), "alice").unwrap();
    }

    #[test]
    fn activation_requires_effect() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(&dir);
        let mut new = draft("p", 1, Severity::Low);
        new.metadata.effect = None;
        let p = registry.create(new, "alice").unwrap();
        registry.transition(&p.id, PolicyState::Simulating, "alice").unwrap();
        registry.transition(&p.id, PolicyState::Canary, "alice").unwrap();
        let err = registry
            .transition(&p.id, PolicyState::Active, "alice")
            .unwrap_err();
        assert!(matches!(err, PolicyError::EffectRequired(_)));
    }

    #[test]
    fn activation_supersedes_previous_active() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(&dir);
        let v1 = registry.create(draft("p", 1, Severity::Low), "alice").unwrap();
        let v2 = registry.create(draft("p", 2, Severity::Low), "alice").unwrap();
        activate(&registry, &v1.id);
        let (_, superseded) = {
            registry.transition(&v2.id, PolicyState::Simulating, "t").unwrap();
            registry.transition(&v2.id, PolicyState::Canary, "t").unwrap();
            registry.transition(&v2.id, PolicyState::Active, "t").unwrap()
        };
        assert_eq!(superseded.len(), 1);
        assert_eq!(superseded[0].id, v1.id);
        assert_eq!(registry.get(&v1.id).unwrap().state, PolicyState::Deprecated);
        // Exactly one active version of the name remains.
        let active = registry.list(Some(PolicyState::Active)).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, v2.id);
    }

    #[test]
    fn enforceable_is_sorted_by_severity_name_version() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(&dir);
        let c = registry.create(draft("zeta", 1, Severity::Critical), "t").unwrap();
        let a = registry.create(draft("alpha", 1, Severity::Low), "t").unwrap();
        let b = registry.create(draft("beta", 1, Severity::Low), "t").unwrap();
        activate(&registry, &c.id);
        activate(&registry, &a.id);
        activate(&registry, &b.id);

        let ordered = registry.enforceable().unwrap();
        let names: Vec<_> = ordered.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "beta", "zeta"]);
    }

    #[test]
    fn history_records_every_write() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(&dir);
        let p = registry.create(draft("p", 1, Severity::Low), "alice").unwrap();
        registry
            .update(&p.id, Some(Severity::High), None, None, "bob")
            .unwrap();
        registry.transition(&p.id, PolicyState::Simulating, "carol").unwrap();

        let history = registry.history(&p.id).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].changes["op"], json!("created"));
        assert_eq!(history[1].changes["op"], json!("updated"));
        assert_eq!(history[1].edited_by, "bob");
        assert_eq!(history[2].changes["op"], json!("transition"));
    }

    #[test]
    fn delete_only_drafts() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(&dir);
        let p = registry.create(draft("p", 1, Severity::Low), "alice").unwrap();
        let q = registry.create(draft("q", 1, Severity::Low), "alice").unwrap();
        registry.transition(&q.id, PolicyState::Simulating, "alice").unwrap();

        registry.delete(&p.id).unwrap();
        assert!(matches!(registry.get(&p.id), Err(PolicyError::NotFound(_))));
        assert!(registry.delete(&q.id).is_err());
    }
}
