//! Asset identifier normalization (spec §3, §9 Design Note).
//!
//! An asset id is a case-insensitive canonical string. The canonical form
//! trims whitespace; the normalized form additionally lowercases. Both are
//! carried together wherever an asset id is stored, so lookups never need
//! to re-derive the normalized form from a possibly-stale canonical one.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssetId {
    /// Trimmed, case-preserved form, used for display.
    pub canonical: String,
    /// Lowercased form, used as the map/lookup key.
    pub normalized: String,
}

impl AssetId {
    pub fn new(raw: &str) -> Self {
        let canonical = raw.trim().to_string();
        let normalized = canonical.to_lowercase();
        Self {
            canonical,
            normalized,
        }
    }
}

impl std::fmt::Display for AssetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.canonical)
    }
}

/// `partitionKey === null` is stored as an empty-string normalized key
/// (spec §4.F "Partition semantics").
pub fn normalize_partition_key(partition_key: Option<&str>) -> String {
    partition_key.unwrap_or("").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_and_lowercases() {
        let id = AssetId::new("  Orders.Daily  ");
        assert_eq!(id.canonical, "Orders.Daily");
        assert_eq!(id.normalized, "orders.daily");
    }

    #[test]
    fn equal_case_insensitively_via_normalized() {
        let a = AssetId::new("Orders");
        let b = AssetId::new("orders");
        assert_eq!(a.normalized, b.normalized);
        assert_ne!(a.canonical, b.canonical);
    }

    #[test]
    fn null_partition_key_normalizes_to_empty_string() {
        assert_eq!(normalize_partition_key(None), "");
        assert_eq!(normalize_partition_key(Some("  ")), "");
        assert_eq!(normalize_partition_key(Some("us-east")), "us-east");
    }
}
