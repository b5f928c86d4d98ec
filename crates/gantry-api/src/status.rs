//! Status conditions reported back to the owners of declarative resources.

use serde::{Deserialize, Serialize};

/// Well known condition types.
pub mod condition_type {
    pub const ACCEPTED: &str = "Accepted";
    pub const PROGRAMMED: &str = "Programmed";
    pub const RESOLVED_REFS: &str = "ResolvedRefs";
}

/// Well known condition reasons.
pub mod reason {
    pub const ACCEPTED: &str = "Accepted";
    pub const PROGRAMMED: &str = "Programmed";
    pub const RESOLVED_REFS: &str = "ResolvedRefs";
    pub const INVALID: &str = "Invalid";
    pub const INVALID_KIND: &str = "InvalidKind";
    pub const INVALID_CERTIFICATE_REF: &str = "InvalidCertificateRef";
    pub const UNSUPPORTED_PROTOCOL: &str = "UnsupportedProtocol";
    pub const PROTOCOL_CONFLICT: &str = "ProtocolConflict";
    pub const HOSTNAME_CONFLICT: &str = "HostnameConflict";
    pub const BACKEND_NOT_FOUND: &str = "BackendNotFound";
    pub const REF_NOT_PERMITTED: &str = "RefNotPermitted";
    pub const NOT_ALLOWED_BY_LISTENERS: &str = "NotAllowedByListeners";
    pub const NO_MATCHING_LISTENER_HOSTNAME: &str = "NoMatchingListenerHostname";
    pub const NO_MATCHING_PARENT: &str = "NoMatchingParent";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        match value {
            true => ConditionStatus::True,
            false => ConditionStatus::False,
        }
    }
}

/// A single observation about the state of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub observed_generation: i64,
}

impl Condition {
    pub fn new(
        type_: &str,
        status: impl Into<ConditionStatus>,
        reason: &str,
        message: impl Into<String>,
        observed_generation: i64,
    ) -> Self {
        Self {
            type_: type_.to_string(),
            status: status.into(),
            reason: reason.to_string(),
            message: message.into(),
            observed_generation,
        }
    }
}

/// Set a condition in a list of conditions.
///
/// Conditions are keyed by type: an existing condition of the same type is
/// replaced in place and a new one is appended. Setting an identical
/// condition is a no-op so repeated translation leaves statuses untouched.
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) if *existing == condition => (),
        Some(existing) => *existing = condition,
        None => conditions.push(condition),
    }
}

/// Return `true` if there's a condition with the given type and status.
pub fn has_condition(conditions: &[Condition], type_: &str, status: ConditionStatus) -> bool {
    conditions
        .iter()
        .any(|c| c.type_ == type_ && c.status == status)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_set_condition_dedupes_by_type() {
        let mut conditions = vec![];

        set_condition(
            &mut conditions,
            Condition::new(condition_type::ACCEPTED, true, reason::ACCEPTED, "", 1),
        );
        set_condition(
            &mut conditions,
            Condition::new(condition_type::PROGRAMMED, true, reason::PROGRAMMED, "", 1),
        );
        set_condition(
            &mut conditions,
            Condition::new(
                condition_type::ACCEPTED,
                false,
                reason::UNSUPPORTED_PROTOCOL,
                "UDP is not supported",
                2,
            ),
        );

        assert_eq!(conditions.len(), 2);
        assert_eq!(conditions[0].type_, condition_type::ACCEPTED);
        assert_eq!(conditions[0].status, ConditionStatus::False);
        assert_eq!(conditions[0].observed_generation, 2);
        assert!(has_condition(
            &conditions,
            condition_type::PROGRAMMED,
            ConditionStatus::True
        ));
        assert!(!has_condition(
            &conditions,
            condition_type::ACCEPTED,
            ConditionStatus::True
        ));
    }
}
