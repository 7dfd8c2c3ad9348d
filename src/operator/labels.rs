use std::collections::BTreeMap;

// Kubernetes label constants
pub const LABEL_MANAGED_BY: &str = "rise.dev/managed-by";
pub const LABEL_COMPONENT: &str = "rise.dev/component";
pub const LABEL_OWNER: &str = "rise.dev/owner";

pub const MANAGED_BY: &str = "rise-frontend-operator";

/// Label values are limited to 63 characters
const MAX_LABEL_VALUE_LEN: usize = 63;

/// Sanitize a string to be a valid Kubernetes label value
/// Replaces sequences of invalid characters with '--' to avoid collisions
/// (e.g., "mr/26" → "mr--26", "mr-26" → "mr-26")
/// Ensures it matches the regex: (([A-Za-z0-9][-A-Za-z0-9_.]*)?[A-Za-z0-9])?
pub fn sanitize_label_value(value: &str) -> String {
    let mut result = String::new();
    let mut last_was_invalid = false;

    for ch in value.chars() {
        if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.' {
            result.push(ch);
            last_was_invalid = false;
        } else if !last_was_invalid {
            result.push_str("--");
            last_was_invalid = true;
        }
    }

    result.truncate(MAX_LABEL_VALUE_LEN);
    result
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

/// Deterministic label set identifying a managed resource by component and owner name.
///
/// Used verbatim as pod template labels and selectors, so the values must never
/// depend on anything but the two inputs.
pub fn managed_labels(component: &str, owner: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string());
    labels.insert(LABEL_COMPONENT.to_string(), component.to_string());
    labels.insert(LABEL_OWNER.to_string(), sanitize_label_value(owner));
    labels
}

/// Overwrite the engine-managed keys on an existing label map, leaving others alone
pub fn merge_managed_labels(
    existing: &mut Option<BTreeMap<String, String>>,
    managed: &BTreeMap<String, String>,
) {
    let labels = existing.get_or_insert_with(BTreeMap::new);
    for (key, value) in managed {
        labels.insert(key.clone(), value.clone());
    }
}

/// Label selector matching everything this operator manages
pub fn managed_selector() -> String {
    format!("{}={}", LABEL_MANAGED_BY, MANAGED_BY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_label_value() {
        assert_eq!(sanitize_label_value("inventory"), "inventory");
        assert_eq!(sanitize_label_value("mr/26"), "mr--26");
        assert_eq!(sanitize_label_value("a//b"), "a--b");
        assert_eq!(sanitize_label_value("-edge-"), "edge");
        assert_eq!(sanitize_label_value(&"x".repeat(80)).len(), 63);
    }

    #[test]
    fn test_managed_labels_are_deterministic() {
        let a = managed_labels("frontend", "inventory");
        let b = managed_labels("frontend", "inventory");
        assert_eq!(a, b);
        assert_eq!(a.get(LABEL_COMPONENT).map(String::as_str), Some("frontend"));
        assert_eq!(a.get(LABEL_OWNER).map(String::as_str), Some("inventory"));
    }

    #[test]
    fn test_merge_keeps_foreign_labels() {
        let mut existing = Some(BTreeMap::from([
            ("team".to_string(), "platform".to_string()),
            (LABEL_OWNER.to_string(), "stale".to_string()),
        ]));
        merge_managed_labels(&mut existing, &managed_labels("frontend", "inventory"));

        let labels = existing.unwrap();
        assert_eq!(labels.get("team").map(String::as_str), Some("platform"));
        assert_eq!(labels.get(LABEL_OWNER).map(String::as_str), Some("inventory"));
        assert_eq!(labels.len(), 4);
    }

    #[test]
    fn test_managed_selector() {
        assert_eq!(
            managed_selector(),
            "rise.dev/managed-by=rise-frontend-operator"
        );
    }
}
