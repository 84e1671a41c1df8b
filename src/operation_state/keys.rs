//! Composite `OperationState` key construction (spec §3's key-pattern
//! table), all joined with the `::` separator the spec specifies.

/// A thin namespace of key builders; these are free functions rather than
/// an owned struct since a key is just a formatted string with no behavior
/// of its own.
pub struct OperationKey;

impl OperationKey {
    pub fn progress(service: &str, org_id: &str) -> String {
        format!("{service}::{org_id}::progress")
    }

    pub fn lock(service: &str, org_id: &str, scope: Option<&str>) -> String {
        match scope {
            Some(scope) => format!("{service}::{org_id}::{scope}::lock"),
            None => format!("{service}::{org_id}::lock"),
        }
    }

    pub fn bookmark(service: &str, org_id: &str, scope: Option<&str>, extractor_name: &str) -> String {
        match scope {
            Some(scope) => format!("{service}::{org_id}::{scope}::{extractor_name}"),
            None => format!("{service}::{org_id}::{extractor_name}"),
        }
    }

    pub fn cluster_fingerprints(
        service: &str,
        org_id: &str,
        feedback_name: &str,
        version: Option<&str>,
    ) -> String {
        match version {
            Some(version) => format!("{service}::{org_id}::{feedback_name}::{version}::clusters"),
            None => format!("{service}::{org_id}::{feedback_name}::clusters"),
        }
    }

    pub fn simple_lock(service: &str, org_id: &str) -> String {
        format!("{service}::{org_id}::simple-lock")
    }

    pub fn cancellation(service: &str, org_id: &str) -> String {
        format!("{service}::{org_id}::cancellation")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_match_spec_table_patterns() {
        assert_eq!(OperationKey::progress("profile", "org1"), "profile::org1::progress");
        assert_eq!(OperationKey::lock("profile", "org1", Some("u1")), "profile::org1::u1::lock");
        assert_eq!(OperationKey::lock("feedback", "org1", None), "feedback::org1::lock");
        assert_eq!(
            OperationKey::bookmark("profile", "org1", Some("u1"), "e1"),
            "profile::org1::u1::e1"
        );
        assert_eq!(
            OperationKey::cluster_fingerprints("feedback", "org1", "fn_tone", Some("v1")),
            "feedback::org1::fn_tone::v1::clusters"
        );
        assert_eq!(OperationKey::simple_lock("feedback", "org1"), "feedback::org1::simple-lock");
        assert_eq!(OperationKey::cancellation("versioning", "org1"), "versioning::org1::cancellation");
    }
}
