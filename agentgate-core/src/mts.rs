//! Multi-Tenant Sandboxing (MTS) labels.
//!
//! Labels follow the SELinux MCS shape: a sensitivity level plus a set of
//! category compartments, written `s0:c42,c108`. Each tenant is assigned
//! unique categories; the dominance check decides whether a subject label
//! may access an object label.
//!
//! Access rules:
//! - Subject sensitivity must be at least the object sensitivity.
//! - A subject with no categories can only access objects with no
//!   categories.
//! - Otherwise the subject's categories must be a superset of the
//!   object's.

use std::fmt;
use std::str::FromStr;

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Highest valid category number (SELinux MCS default).
pub const MAX_CATEGORY: u16 = 1023;

/// Default sensitivity level for tenant isolation.
pub const DEFAULT_SENSITIVITY: u32 = 0;

/// Errors from parsing a label string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LabelError {
    /// The sensitivity part is missing its `s` prefix or is not a number.
    #[error("invalid sensitivity in MTS label '{label}'")]
    InvalidSensitivity { label: String },

    /// A category is missing its `c` prefix or is not a number.
    #[error("invalid category '{category}' in MTS label")]
    InvalidCategory { category: String },

    /// A category number exceeds [`MAX_CATEGORY`].
    #[error("category {category} out of range (0-{MAX_CATEGORY})")]
    CategoryOutOfRange { category: u32 },
}

/// An MTS label: sensitivity plus sorted, de-duplicated categories.
///
/// The canonical string form round-trips exactly:
/// `parse(format(l)) == l` for every valid label.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct MtsLabel {
    /// Sensitivity level (typically 0 for tenant isolation).
    pub sensitivity: u32,
    /// Category compartments, always sorted ascending and unique,
    /// each within `0..=MAX_CATEGORY`.
    categories: Vec<u16>,
}

impl MtsLabel {
    /// Build a label, normalizing the categories to sorted unique form.
    ///
    /// Categories above [`MAX_CATEGORY`] are rejected.
    pub fn new(sensitivity: u32, mut categories: Vec<u16>) -> Result<Self, LabelError> {
        if let Some(&bad) = categories.iter().find(|&&c| c > MAX_CATEGORY) {
            return Err(LabelError::CategoryOutOfRange {
                category: u32::from(bad),
            });
        }
        categories.sort_unstable();
        categories.dedup();
        Ok(Self {
            sensitivity,
            categories,
        })
    }

    /// The sorted category list.
    pub fn categories(&self) -> &[u16] {
        &self.categories
    }

    /// Derive a label deterministically from a tenant id.
    ///
    /// Two distinct categories are drawn by hashing the tenant id with two
    /// salts, which keeps accidental cross-tenant overlap unlikely. The
    /// same tenant id always produces the same label; the empty tenant id
    /// produces the unrestricted `s0` label.
    pub fn generate(tenant_id: &str) -> Self {
        if tenant_id.is_empty() {
            return Self::default();
        }

        let cat1 = hash_to_category(tenant_id, 0x00);
        let mut cat2 = hash_to_category(tenant_id, 0x01);
        if cat1 == cat2 {
            cat2 = (cat2 + 1) % (MAX_CATEGORY + 1);
        }

        let mut categories = vec![cat1, cat2];
        categories.sort_unstable();
        Self {
            sensitivity: DEFAULT_SENSITIVITY,
            categories,
        }
    }

    /// Dominance check: may a subject with this label access `object`?
    pub fn can_access(&self, object: &MtsLabel) -> bool {
        if self.sensitivity < object.sensitivity {
            return false;
        }
        // An empty compartment set can only see the empty compartment.
        if self.categories.is_empty() {
            return object.categories.is_empty();
        }
        if object.categories.is_empty() {
            return true;
        }
        contains_all(&self.categories, &object.categories)
    }

    /// Dominance over optional labels: an absent subject or object means
    /// no MTS enforcement, so access is permitted.
    pub fn check_access(subject: Option<&MtsLabel>, object: Option<&MtsLabel>) -> bool {
        match (subject, object) {
            (Some(s), Some(o)) => s.can_access(o),
            _ => true,
        }
    }
}

impl fmt::Display for MtsLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.sensitivity)?;
        for (i, c) in self.categories.iter().enumerate() {
            let sep = if i == 0 { ':' } else { ',' };
            write!(f, "{sep}c{c}")?;
        }
        Ok(())
    }
}

impl FromStr for MtsLabel {
    type Err = LabelError;

    /// Parse a label string.
    ///
    /// Accepted forms: `""` (no restrictions), `s0`, `s0:c42`,
    /// `s0:c42,c108`. Whitespace around the whole string and around
    /// commas is ignored; duplicate categories are discarded.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Self::default());
        }

        let (sens_part, cats_part) = match s.split_once(':') {
            Some((sens, cats)) => (sens, Some(cats)),
            None => (s, None),
        };

        let sensitivity = sens_part
            .strip_prefix('s')
            .and_then(|n| n.parse::<u32>().ok())
            .ok_or_else(|| LabelError::InvalidSensitivity {
                label: s.to_string(),
            })?;

        let mut categories = Vec::new();
        if let Some(cats) = cats_part {
            for raw in cats.split(',') {
                let raw = raw.trim();
                let num = raw
                    .strip_prefix('c')
                    .and_then(|n| n.parse::<u32>().ok())
                    .ok_or_else(|| LabelError::InvalidCategory {
                        category: raw.to_string(),
                    })?;
                if num > u32::from(MAX_CATEGORY) {
                    return Err(LabelError::CategoryOutOfRange { category: num });
                }
                categories.push(num as u16);
            }
        }

        categories.sort_unstable();
        categories.dedup();
        Ok(Self {
            sensitivity,
            categories,
        })
    }
}

/// Map a tenant id and salt byte onto a category via SHA-256.
///
/// The first two digest bytes (big endian) are reduced mod the category
/// space for a uniform spread.
fn hash_to_category(tenant_id: &str, salt: u8) -> u16 {
    let mut hasher = Sha256::new();
    hasher.update(tenant_id.as_bytes());
    hasher.update([salt]);
    let digest = hasher.finalize();
    u16::from_be_bytes([digest[0], digest[1]]) % (MAX_CATEGORY + 1)
}

/// True when `a` contains every element of `b`. Both must be sorted.
fn contains_all(a: &[u16], b: &[u16]) -> bool {
    let mut i = 0;
    for &needle in b {
        while i < a.len() && a[i] < needle {
            i += 1;
        }
        if i >= a.len() || a[i] != needle {
            return false;
        }
    }
    true
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn label(s: &str) -> MtsLabel {
        s.parse().expect("label should parse")
    }

    // ── Parsing ─────────────────────────────────────────────────────────

    #[test]
    fn parse_empty_is_unrestricted() {
        let l = label("");
        assert_eq!(l.sensitivity, 0);
        assert!(l.categories().is_empty());
    }

    #[test]
    fn parse_sensitivity_only() {
        let l = label("s2");
        assert_eq!(l.sensitivity, 2);
        assert!(l.categories().is_empty());
    }

    #[test]
    fn parse_full_label() {
        let l = label("s0:c42,c108");
        assert_eq!(l.sensitivity, 0);
        assert_eq!(l.categories(), &[42, 108]);
    }

    #[test]
    fn parse_sorts_and_dedups_categories() {
        let l = label("s0:c108,c42,c42");
        assert_eq!(l.categories(), &[42, 108]);
    }

    #[test]
    fn parse_ignores_whitespace() {
        let l = label("  s0:c1 , c2  ");
        assert_eq!(l.categories(), &[1, 2]);
    }

    #[test]
    fn parse_rejects_missing_s_prefix() {
        assert!(matches!(
            "0:c42".parse::<MtsLabel>(),
            Err(LabelError::InvalidSensitivity { .. })
        ));
    }

    #[test]
    fn parse_rejects_negative_sensitivity() {
        assert!("s-1".parse::<MtsLabel>().is_err());
    }

    #[test]
    fn parse_rejects_missing_c_prefix() {
        assert!(matches!(
            "s0:42".parse::<MtsLabel>(),
            Err(LabelError::InvalidCategory { .. })
        ));
    }

    #[test]
    fn parse_rejects_category_out_of_range() {
        assert!(matches!(
            "s0:c1024".parse::<MtsLabel>(),
            Err(LabelError::CategoryOutOfRange { category: 1024 })
        ));
        assert_eq!(label("s0:c1023").categories(), &[1023]);
    }

    #[test]
    fn parse_rejects_empty_category_list() {
        // "s0:" has a colon but nothing after it.
        assert!("s0:".parse::<MtsLabel>().is_err());
    }

    // ── Canonical form ──────────────────────────────────────────────────

    #[test]
    fn display_canonical_forms() {
        assert_eq!(label("s0").to_string(), "s0");
        assert_eq!(label("s1:c5").to_string(), "s1:c5");
        assert_eq!(label("s0:c108,c42").to_string(), "s0:c42,c108");
    }

    #[test]
    fn round_trip_is_exact() {
        for s in ["s0", "s3:c1", "s0:c42,c108", "s0:c0,c512,c1023"] {
            let l = label(s);
            assert_eq!(l.to_string(), s);
            assert_eq!(label(&l.to_string()), l);
        }
    }

    // ── Generation ──────────────────────────────────────────────────────

    #[test]
    fn generate_is_deterministic() {
        let a = MtsLabel::generate("tenant-a");
        let b = MtsLabel::generate("tenant-a");
        assert_eq!(a, b);
    }

    #[test]
    fn generate_has_two_distinct_categories() {
        for tenant in ["tenant-a", "tenant-b", "acme", "x", "a-rather-long-id"] {
            let l = MtsLabel::generate(tenant);
            assert_eq!(l.categories().len(), 2, "tenant {tenant}");
            assert!(l.categories()[0] < l.categories()[1]);
            assert!(l.categories()[1] <= MAX_CATEGORY);
        }
    }

    #[test]
    fn generate_empty_tenant_is_unrestricted() {
        let l = MtsLabel::generate("");
        assert_eq!(l, MtsLabel::default());
    }

    #[test]
    fn generate_differs_across_tenants() {
        assert_ne!(MtsLabel::generate("tenant-a"), MtsLabel::generate("tenant-b"));
    }

    // ── Dominance ───────────────────────────────────────────────────────

    #[test]
    fn dominance_superset_allows() {
        assert!(label("s0:c42,c100,c108").can_access(&label("s0:c42,c108")));
    }

    #[test]
    fn dominance_subset_denies() {
        assert!(!label("s0:c42").can_access(&label("s0:c42,c108")));
    }

    #[test]
    fn dominance_sensitivity_must_rise() {
        assert!(label("s1:c42").can_access(&label("s0:c42")));
        assert!(!label("s0:c42").can_access(&label("s1:c42")));
    }

    #[test]
    fn dominance_empty_subject_only_sees_empty_object() {
        assert!(!label("s0").can_access(&label("s0:c42")));
        assert!(label("s0").can_access(&label("s0")));
    }

    #[test]
    fn dominance_empty_object_accessible_with_categories() {
        assert!(label("s0:c42").can_access(&label("s0")));
    }

    #[test]
    fn dominance_absent_labels_allow() {
        let l = label("s0:c1");
        assert!(MtsLabel::check_access(None, Some(&l)));
        assert!(MtsLabel::check_access(Some(&l), None));
        assert!(MtsLabel::check_access(None, None));
        assert!(!MtsLabel::check_access(Some(&label("s0")), Some(&l)));
    }

    #[test]
    fn equality_is_sequence_sensitive() {
        assert_eq!(label("s0:c1,c2"), label("s0:c2,c1"));
        assert_ne!(label("s0:c1"), label("s0:c1,c2"));
        assert_ne!(label("s0"), label("s1"));
    }
}
