//! Conflict resolution for bidirectional change sets.
//!
//! When both sides changed the same mapped pair inside one sync window the
//! newer modification wins; on an exact tie the local version wins.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::crm::CrmRecord;
use crate::local::LocalRecord;

/// One record operation chosen by the planner.
#[derive(Debug, Clone, PartialEq)]
pub enum PlannedOp {
    /// Propagate a local change to the CRM.
    Push(LocalRecord),
    /// Propagate a CRM change locally.
    Pull(CrmRecord),
}

impl PlannedOp {
    pub fn modified_at(&self) -> DateTime<Utc> {
        match self {
            PlannedOp::Push(record) => record.updated_at,
            PlannedOp::Pull(record) => record.updated_at,
        }
    }
}

/// Which side won a conflicting pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    Local,
    External,
}

/// Last-write-wins with the local side preferred on ties.
pub fn resolve_conflict(local_at: DateTime<Utc>, external_at: DateTime<Utc>) -> Winner {
    if local_at >= external_at {
        Winner::Local
    } else {
        Winner::External
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Plan {
    pub ops: Vec<PlannedOp>,
    /// Number of mapped pairs changed on both sides
    pub conflicts: usize,
}

/// Merges the two change sets into one ordered list of record operations.
///
/// `mapped` holds live mappings, local id to external id, for the records in
/// the change sets. For a mapped pair present in both sets only the winner
/// produces an operation.
pub fn plan(
    local_changes: Vec<LocalRecord>,
    external_changes: Vec<CrmRecord>,
    mapped: &HashMap<String, String>,
) -> Plan {
    let external_by_id: HashMap<&str, &CrmRecord> = external_changes
        .iter()
        .map(|r| (r.id.as_str(), r))
        .collect();

    let mut suppressed_external: HashSet<String> = HashSet::new();
    let mut ops = Vec::with_capacity(local_changes.len() + external_changes.len());
    let mut conflicts = 0;

    for local in local_changes {
        let counterpart = mapped
            .get(&local.id)
            .and_then(|external_id| external_by_id.get(external_id.as_str()));

        match counterpart {
            Some(external) => {
                conflicts += 1;
                match resolve_conflict(local.updated_at, external.updated_at) {
                    Winner::Local => {
                        suppressed_external.insert(external.id.clone());
                        ops.push(PlannedOp::Push(local));
                    }
                    // The external record is pulled below.
                    Winner::External => {}
                }
            }
            None => ops.push(PlannedOp::Push(local)),
        }
    }

    for external in external_changes {
        if !suppressed_external.contains(&external.id) {
            ops.push(PlannedOp::Pull(external));
        }
    }

    ops.sort_by_key(PlannedOp::modified_at);
    Plan { ops, conflicts }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::{Map, json};

    fn local(id: &str, at: DateTime<Utc>) -> LocalRecord {
        LocalRecord {
            id: id.to_string(),
            fields: json!({"name": format!("local-{id}")}).as_object().cloned().unwrap(),
            updated_at: at,
            deleted: false,
        }
    }

    fn external(id: &str, at: DateTime<Utc>) -> CrmRecord {
        CrmRecord {
            id: id.to_string(),
            properties: Map::new(),
            updated_at: at,
            archived: false,
        }
    }

    fn pairs() -> HashMap<String, String> {
        HashMap::from([("L1".to_string(), "E1".to_string())])
    }

    #[test]
    fn newer_local_wins() {
        let t = Utc::now();
        let plan = plan(
            vec![local("L1", t + Duration::seconds(5))],
            vec![external("E1", t + Duration::seconds(3))],
            &pairs(),
        );
        assert_eq!(plan.conflicts, 1);
        assert_eq!(plan.ops.len(), 1);
        assert!(matches!(&plan.ops[0], PlannedOp::Push(r) if r.id == "L1"));
    }

    #[test]
    fn newer_external_wins() {
        let t = Utc::now();
        let plan = plan(
            vec![local("L1", t + Duration::seconds(3))],
            vec![external("E1", t + Duration::seconds(5))],
            &pairs(),
        );
        assert_eq!(plan.ops.len(), 1);
        assert!(matches!(&plan.ops[0], PlannedOp::Pull(r) if r.id == "E1"));
    }

    #[test]
    fn exact_tie_prefers_local() {
        let t = Utc::now();
        assert_eq!(resolve_conflict(t, t), Winner::Local);
        let plan = plan(vec![local("L1", t)], vec![external("E1", t)], &pairs());
        assert!(matches!(&plan.ops[..], [PlannedOp::Push(_)]));
    }

    #[test]
    fn unrelated_changes_flow_both_ways_in_time_order() {
        let t = Utc::now();
        let plan = plan(
            vec![local("L2", t + Duration::seconds(2)), local("L1", t)],
            vec![external("E9", t + Duration::seconds(1))],
            &pairs(),
        );
        assert_eq!(plan.conflicts, 0);
        let order: Vec<String> = plan
            .ops
            .iter()
            .map(|op| match op {
                PlannedOp::Push(r) => r.id.clone(),
                PlannedOp::Pull(r) => r.id.clone(),
            })
            .collect();
        assert_eq!(order, vec!["L1", "E9", "L2"]);
    }
}
