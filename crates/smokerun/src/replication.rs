//! Replication consistency checking.
//!
//! After a replicated run the primary and secondary should hold identical
//! data. Each node reports a digest per collection; the report lists the
//! collections missing on either side and the ones whose digests disagree.

use std::collections::BTreeMap;
use tracing::info;

use crate::error::Result;
use crate::server::ServerControl;

/// Collection name to content digest.
pub type CollectionDigests = BTreeMap<String, String>;

/// Outcome of comparing a primary with its secondary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicationDigestReport {
    /// Digests reported by the primary.
    pub primary: CollectionDigests,
    /// Digests reported by the secondary.
    pub secondary: CollectionDigests,
    /// Present on the primary, absent on the secondary.
    pub lost_in_secondary: Vec<String>,
    /// Present on the secondary, absent on the primary.
    pub lost_in_primary: Vec<String>,
    /// Present on both with different digests: `(primary, secondary)`.
    pub mismatched: BTreeMap<String, (String, String)>,
}

impl ReplicationDigestReport {
    /// Compares two digest maps. Digests are compared as exact strings.
    #[must_use]
    pub fn compare(primary: CollectionDigests, secondary: CollectionDigests) -> Self {
        let lost_in_secondary = primary
            .keys()
            .filter(|name| !secondary.contains_key(*name))
            .cloned()
            .collect();

        let lost_in_primary = secondary
            .keys()
            .filter(|name| !primary.contains_key(*name))
            .cloned()
            .collect();

        let mismatched = primary
            .iter()
            .filter_map(|(name, p_hash)| {
                let s_hash = secondary.get(name)?;
                (p_hash != s_hash).then(|| (name.clone(), (p_hash.clone(), s_hash.clone())))
            })
            .collect();

        Self {
            primary,
            secondary,
            lost_in_secondary,
            lost_in_primary,
            mismatched,
        }
    }

    /// True when both nodes hold the same collections with the same digests.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.lost_in_secondary.is_empty()
            && self.lost_in_primary.is_empty()
            && self.mismatched.is_empty()
    }

    /// Number of collections the primary replicated.
    #[must_use]
    pub fn replicated_collections(&self) -> usize {
        self.primary.len()
    }
}

/// Fetches both digests and compares them.
///
/// The caller must have passed a replication fence on the primary first;
/// a mismatch is reported as-is and never retried.
///
/// # Errors
///
/// Returns an error if either node cannot report its digest.
pub async fn check(
    primary: &dyn ServerControl,
    secondary: &dyn ServerControl,
) -> Result<ReplicationDigestReport> {
    let primary_digest = primary.content_digest().await?;
    let secondary_digest = secondary.content_digest().await?;

    let report = ReplicationDigestReport::compare(primary_digest, secondary_digest);
    info!(
        "replication check: {} collections, consistent={}",
        report.replicated_collections(),
        report.is_consistent()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digests(pairs: &[(&str, &str)]) -> CollectionDigests {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_compare_with_itself_is_consistent() {
        // Arrange
        let node = digests(&[("a", "1"), ("b", "2"), ("system.indexes", "3")]);

        // Act
        let report = ReplicationDigestReport::compare(node.clone(), node);

        // Assert
        assert!(report.is_consistent());
        assert!(report.lost_in_primary.is_empty());
        assert!(report.lost_in_secondary.is_empty());
        assert_eq!(report.replicated_collections(), 3);
    }

    #[test]
    fn test_compare_reports_each_divergence_kind() {
        // Arrange: primary {A,B}, secondary {A,C}, A differs
        let primary = digests(&[("A", "p-hash"), ("B", "b-hash")]);
        let secondary = digests(&[("A", "s-hash"), ("C", "c-hash")]);

        // Act
        let report = ReplicationDigestReport::compare(primary, secondary);

        // Assert
        assert_eq!(report.lost_in_secondary, vec!["B".to_string()]);
        assert_eq!(report.lost_in_primary, vec!["C".to_string()]);
        assert_eq!(report.mismatched.len(), 1);
        assert_eq!(
            report.mismatched.get("A"),
            Some(&("p-hash".to_string(), "s-hash".to_string()))
        );
        assert!(!report.is_consistent());
    }

    #[test]
    fn test_compare_empty_nodes() {
        let report = ReplicationDigestReport::compare(CollectionDigests::new(), CollectionDigests::new());

        assert!(report.is_consistent());
        assert_eq!(report.replicated_collections(), 0);
    }

    #[test]
    fn test_digest_comparison_is_exact() {
        let report = ReplicationDigestReport::compare(
            digests(&[("a", "ABC")]),
            digests(&[("a", "abc")]),
        );

        assert_eq!(report.mismatched.len(), 1);
    }
}
