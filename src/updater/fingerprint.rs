//! `env_fingerprint`: a stable digest over the externally observable
//! configuration of a container, used to detect drift that would make a
//! recreation unsafe (spec §9).

use std::collections::HashMap;

use sha2::{Digest, Sha256};

use crate::registry::{labels_without_internal, MountBinding, PortMapping};

/// SHA-256 hex digest over image_ref + sorted env + sorted mounts +
/// sorted ports + labels (stripped of `fleetwatch.`-prefixed keys,
/// sorted by key). Canonical and order-independent so the same
/// configuration always fingerprints identically regardless of the
/// order the runtime reports it in.
pub fn compute(
    image_ref: &str,
    env: &HashMap<String, String>,
    mounts: &[MountBinding],
    ports: &[PortMapping],
    labels: &HashMap<String, String>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(image_ref.as_bytes());
    hasher.update(b"\0");

    let mut env_keys: Vec<_> = env.keys().collect();
    env_keys.sort();
    for key in env_keys {
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(env[key].as_bytes());
        hasher.update(b"\0");
    }

    let mut sorted_mounts: Vec<_> = mounts.iter().collect();
    sorted_mounts.sort_by(|a, b| (&a.source, &a.target).cmp(&(&b.source, &b.target)));
    for mount in sorted_mounts {
        hasher.update(mount.source.as_bytes());
        hasher.update(b":");
        hasher.update(mount.target.as_bytes());
        hasher.update(b":");
        hasher.update([mount.read_only as u8]);
        hasher.update(b"\0");
    }

    let mut sorted_ports: Vec<_> = ports.iter().collect();
    sorted_ports.sort_by_key(|p| (p.container_port, p.protocol.clone()));
    for port in sorted_ports {
        hasher.update(port.container_port.to_be_bytes());
        hasher.update(port.protocol.as_bytes());
        hasher.update(port.host_port.unwrap_or(0).to_be_bytes());
        hasher.update(b"\0");
    }

    let filtered = labels_without_internal(labels);
    let mut label_keys: Vec<_> = filtered.keys().collect();
    label_keys.sort();
    for key in label_keys {
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(filtered[key].as_bytes());
        hasher.update(b"\0");
    }

    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_order_independent() {
        let mut env_a = HashMap::new();
        env_a.insert("A".to_string(), "1".to_string());
        env_a.insert("B".to_string(), "2".to_string());

        let mut env_b = HashMap::new();
        env_b.insert("B".to_string(), "2".to_string());
        env_b.insert("A".to_string(), "1".to_string());

        let fp_a = compute("app:1", &env_a, &[], &[], &HashMap::new());
        let fp_b = compute("app:1", &env_b, &[], &[], &HashMap::new());
        assert_eq!(fp_a, fp_b);
    }

    #[test]
    fn fingerprint_changes_with_image_ref() {
        let env = HashMap::new();
        let fp_a = compute("app:1", &env, &[], &[], &HashMap::new());
        let fp_b = compute("app:2", &env, &[], &[], &HashMap::new());
        assert_ne!(fp_a, fp_b);
    }

    #[test]
    fn internal_labels_are_excluded() {
        let env = HashMap::new();
        let mut labels_with_internal = HashMap::new();
        labels_with_internal.insert("fleetwatch.managed".to_string(), "true".to_string());

        let fp_a = compute("app:1", &env, &[], &[], &labels_with_internal);
        let fp_b = compute("app:1", &env, &[], &[], &HashMap::new());
        assert_eq!(fp_a, fp_b);
    }
}
