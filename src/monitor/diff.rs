//! Pure diff classification between a registry snapshot and a fresh
//! runtime listing (spec §4.4 step 2). Kept free of I/O so it is directly
//! unit-testable.

use std::collections::HashMap;

use crate::registry::{ContainerRecord, UpdateState};
use crate::runtime::ContainerSummary;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ClassifiedDiff {
    pub to_add: Vec<String>,
    pub to_update: Vec<String>,
    pub to_remove: Vec<String>,
}

/// Classifies observed containers against the current registry snapshot.
/// `add` gets a follow-up `inspect()` by the caller to fill in digest,
/// ports, and `env_fingerprint`; `update` is triggered only when status,
/// the cheaply-available image id, or labels changed; `remove` is
/// deferred for any container whose `update_state` is `updating`.
pub fn classify(current: &[ContainerRecord], observed: &[ContainerSummary]) -> ClassifiedDiff {
    let current_by_id: HashMap<&str, &ContainerRecord> = current.iter().map(|r| (r.id.as_str(), r)).collect();
    let observed_ids: std::collections::HashSet<&str> = observed.iter().map(|s| s.id.as_str()).collect();

    let mut diff = ClassifiedDiff::default();

    for summary in observed {
        match current_by_id.get(summary.id.as_str()) {
            None => diff.to_add.push(summary.id.clone()),
            Some(existing) => {
                let status_changed = existing.status != summary.status;
                let labels_changed = existing.labels != summary.labels;
                let digest_drifted = summary
                    .image_id
                    .as_ref()
                    .is_some_and(|observed_digest| existing.image_digest.as_ref() != Some(observed_digest));

                if status_changed || labels_changed || digest_drifted {
                    diff.to_update.push(summary.id.clone());
                }
            }
        }
    }

    for record in current {
        if !observed_ids.contains(record.id.as_str()) && record.update_state != UpdateState::Updating {
            diff.to_remove.push(record.id.clone());
        }
    }

    diff
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ContainerStatus;
    use chrono::Utc;

    fn record(id: &str, status: ContainerStatus) -> ContainerRecord {
        ContainerRecord {
            id: id.to_string(),
            name: id.to_string(),
            image_ref: "app:1".to_string(),
            image_digest: Some("sha256:aaa".to_string()),
            status,
            created_at: Utc::now(),
            started_at: None,
            last_seen_at: Utc::now(),
            labels: HashMap::new(),
            ports: Vec::new(),
            env_fingerprint: None,
            update_state: UpdateState::Idle,
            update_state_changed_at: Utc::now(),
            update_last_error: None,
            config_snapshot: None,
        }
    }

    fn summary(id: &str, status: ContainerStatus) -> ContainerSummary {
        ContainerSummary {
            id: id.to_string(),
            name: id.to_string(),
            image_ref: "app:1".to_string(),
            image_id: Some("sha256:aaa".to_string()),
            status,
            created_at: Utc::now(),
            labels: HashMap::new(),
        }
    }

    #[test]
    fn unseen_container_is_an_add() {
        let diff = classify(&[], &[summary("a", ContainerStatus::Running)]);
        assert_eq!(diff.to_add, vec!["a".to_string()]);
    }

    #[test]
    fn status_change_is_an_update() {
        let current = vec![record("a", ContainerStatus::Running)];
        let observed = vec![summary("a", ContainerStatus::Exited)];
        let diff = classify(&current, &observed);
        assert_eq!(diff.to_update, vec!["a".to_string()]);
    }

    #[test]
    fn unchanged_container_is_neither_added_nor_updated() {
        let current = vec![record("a", ContainerStatus::Running)];
        let observed = vec![summary("a", ContainerStatus::Running)];
        let diff = classify(&current, &observed);
        assert!(diff.to_add.is_empty());
        assert!(diff.to_update.is_empty());
        assert!(diff.to_remove.is_empty());
    }

    #[test]
    fn missing_container_is_a_remove() {
        let current = vec![record("a", ContainerStatus::Running)];
        let diff = classify(&current, &[]);
        assert_eq!(diff.to_remove, vec!["a".to_string()]);
    }

    #[test]
    fn updating_container_remove_is_deferred() {
        let mut updating = record("a", ContainerStatus::Running);
        updating.update_state = UpdateState::Updating;
        let diff = classify(&[updating], &[]);
        assert!(diff.to_remove.is_empty());
    }

    #[test]
    fn digest_drift_without_status_change_is_an_update() {
        let current = vec![record("a", ContainerStatus::Running)];
        let mut drifted = summary("a", ContainerStatus::Running);
        drifted.image_id = Some("sha256:bbb".to_string());
        let diff = classify(&current, &[drifted]);
        assert_eq!(diff.to_update, vec!["a".to_string()]);
    }
}
