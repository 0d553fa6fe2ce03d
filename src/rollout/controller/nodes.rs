/*
 * Copyright (C) 2024 The Nanocloud Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::rollout::k8s::operator::NodeRolloutRecord;

use std::collections::BTreeSet;

/// Outcome of aligning the record list with the live node set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeSetChange {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl NodeSetChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Drops records of vanished nodes and appends idle records for new ones.
/// Surviving records keep their relative order; new names are appended in
/// sorted order.
pub fn reconcile_node_records(
    records: &mut Vec<NodeRolloutRecord>,
    live_nodes: &[String],
) -> NodeSetChange {
    let live: BTreeSet<&str> = live_nodes.iter().map(String::as_str).collect();
    let mut change = NodeSetChange::default();

    records.retain(|record| {
        let keep = live.contains(record.node_name.as_str());
        if !keep {
            change.removed.push(record.node_name.clone());
        }
        keep
    });

    let known: BTreeSet<String> = records.iter().map(|r| r.node_name.clone()).collect();
    for name in live {
        if !known.contains(name) {
            records.push(NodeRolloutRecord::new(name));
            change.added.push(name.to_string());
        }
    }
    change
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(records: &[NodeRolloutRecord]) -> Vec<&str> {
        records.iter().map(|r| r.node_name.as_str()).collect()
    }

    #[test]
    fn appends_new_nodes_without_reordering() {
        let mut records = vec![NodeRolloutRecord::new("c"), NodeRolloutRecord::new("a")];
        records[0].current_revision = 3;
        let change = reconcile_node_records(
            &mut records,
            &["a".to_string(), "d".to_string(), "b".to_string(), "c".to_string()],
        );

        assert_eq!(names(&records), vec!["c", "a", "b", "d"]);
        assert_eq!(records[0].current_revision, 3);
        assert_eq!(records[2], NodeRolloutRecord::new("b"));
        assert_eq!(change.added, vec!["b", "d"]);
        assert!(change.removed.is_empty());
    }

    #[test]
    fn removes_vanished_nodes() {
        let mut records = vec![
            NodeRolloutRecord::new("a"),
            NodeRolloutRecord::new("b"),
            NodeRolloutRecord::new("c"),
        ];
        let change = reconcile_node_records(&mut records, &["a".to_string(), "c".to_string()]);
        assert_eq!(names(&records), vec!["a", "c"]);
        assert_eq!(change.removed, vec!["b"]);
    }

    #[test]
    fn stable_set_is_a_noop() {
        let mut records = vec![NodeRolloutRecord::new("a")];
        let change = reconcile_node_records(&mut records, &["a".to_string()]);
        assert!(change.is_empty());
    }
}
