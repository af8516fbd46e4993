//! Risk classification
//!
//! Pure scoring of audit events into [`RiskLevel`] bands. The score is the sum
//! of independent signals (event type, operation keyword, sensitive data,
//! actor role, time of day); the level is the band the score falls into.

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

use super::event::AuditEventType;

/// Score at or above which an event is CRITICAL
pub const CRITICAL_THRESHOLD: u32 = 50;
/// Score at or above which an event is HIGH
pub const HIGH_THRESHOLD: u32 = 35;
/// Score at or above which an event is MEDIUM
pub const MEDIUM_THRESHOLD: u32 = 20;

const DESTRUCTIVE_KEYWORDS: &[&str] = &["delete", "remove", "destroy", "purge"];
const MUTATING_KEYWORDS: &[&str] = &["update", "modify", "change", "edit"];
const ELEVATED_ROLES: &[&str] = &["admin", "administrator", "super_admin", "superadmin", "root"];

/// Fields whose change makes an update HIGH risk
pub const CRITICAL_FIELDS: &[&str] = &["password", "email", "role", "permissions", "status"];
/// Fields whose change makes an update MEDIUM risk (personal data)
pub const SENSITIVE_FIELDS: &[&str] = &["cpf", "phone", "address", "salary"];

/// Risk band of an audit event
///
/// Ordered `Low < Medium < High < Critical`. Serialized as `LOW`, `MEDIUM`,
/// `HIGH`, `CRITICAL`, which is also the stored spelling.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    /// Routine operation
    #[default]
    Low,
    /// Touches personal data or mutates state
    Medium,
    /// Security relevant
    High,
    /// Requires review
    Critical,
}

impl RiskLevel {
    /// Stored spelling
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }

    /// Band a numeric score falls into
    pub fn from_score(score: u32) -> Self {
        if score >= CRITICAL_THRESHOLD {
            Self::Critical
        } else if score >= HIGH_THRESHOLD {
            Self::High
        } else if score >= MEDIUM_THRESHOLD {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LOW" => Ok(Self::Low),
            "MEDIUM" => Ok(Self::Medium),
            "HIGH" => Ok(Self::High),
            "CRITICAL" => Ok(Self::Critical),
            other => Err(format!("unknown risk level: {}", other)),
        }
    }
}

/// Signals considered by [`score`]
#[derive(Debug, Clone)]
pub struct RiskInput<'a> {
    /// Type of the event being scored
    pub event_type: AuditEventType,
    /// Free-form operation name (e.g. `remove_dependent`)
    pub operation: Option<&'a str>,
    /// Whether sensitive fields were read or changed
    pub sensitive_fields: bool,
    /// Role of the acting user
    pub actor_role: Option<&'a str>,
    /// Local wall-clock time the event happened at
    pub local_time: NaiveTime,
}

/// Outcome of [`score`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RiskAssessment {
    /// Sum of all signal points
    pub score: u32,
    /// Band for `score`
    pub level: RiskLevel,
}

/// Score an event. Deterministic for equal input.
pub fn score(input: &RiskInput<'_>) -> RiskAssessment {
    let mut points = event_type_points(input.event_type);

    if let Some(operation) = input.operation {
        points += operation_points(operation);
    }

    if input.sensitive_fields {
        points += 20;
    }

    if input.actor_role.is_some_and(is_elevated_role) {
        points += 10;
    }

    if is_off_hours(input.local_time) {
        points += 10;
    }

    RiskAssessment {
        score: points,
        level: RiskLevel::from_score(points),
    }
}

fn event_type_points(event_type: AuditEventType) -> u32 {
    match event_type {
        AuditEventType::FailedLogin => 30,
        AuditEventType::SensitiveDataAccessed => 25,
        AuditEventType::EntityDeleted => 20,
        AuditEventType::EntityUpdated => 15,
        AuditEventType::EntityCreated => 10,
        AuditEventType::EntityAccessed => 5,
        _ => 5,
    }
}

fn operation_points(operation: &str) -> u32 {
    let operation = operation.to_lowercase();
    if DESTRUCTIVE_KEYWORDS.iter().any(|k| operation.contains(k)) {
        15
    } else if MUTATING_KEYWORDS.iter().any(|k| operation.contains(k)) {
        10
    } else {
        0
    }
}

fn is_elevated_role(role: &str) -> bool {
    let role = role.trim().to_lowercase();
    ELEVATED_ROLES.contains(&role.as_str())
}

/// Before 06:00 or after 22:00
pub fn is_off_hours(time: NaiveTime) -> bool {
    let opening = NaiveTime::from_hms_opt(6, 0, 0).unwrap_or(NaiveTime::MIN);
    let closing = NaiveTime::from_hms_opt(22, 0, 0).unwrap_or(NaiveTime::MIN);
    time < opening || time > closing
}

/// Risk of an update from the names of the fields it changed
///
/// A field matches when its lowercased name, or any `_`-separated segment of
/// it, is one of the listed names (`password_hash` counts as `password`).
pub fn classify_changed_fields<S: AsRef<str>>(fields: &[S]) -> RiskLevel {
    if fields.iter().any(|f| field_matches(f.as_ref(), CRITICAL_FIELDS)) {
        RiskLevel::High
    } else if fields.iter().any(|f| field_matches(f.as_ref(), SENSITIVE_FIELDS)) {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}

/// Changed fields that are critical or personal data
pub fn sensitive_changed_fields<S: AsRef<str>>(fields: &[S]) -> Vec<String> {
    fields
        .iter()
        .map(AsRef::as_ref)
        .filter(|f| field_matches(f, CRITICAL_FIELDS) || field_matches(f, SENSITIVE_FIELDS))
        .map(str::to_string)
        .collect()
}

/// Fields holding personal data (`SENSITIVE_FIELDS`), without the critical
/// account fields
pub fn personal_data_fields<S: AsRef<str>>(fields: &[S]) -> Vec<String> {
    fields
        .iter()
        .map(AsRef::as_ref)
        .filter(|f| field_matches(f, SENSITIVE_FIELDS))
        .map(str::to_string)
        .collect()
}

fn field_matches(field: &str, names: &[&str]) -> bool {
    let field = field.to_lowercase();
    names.contains(&field.as_str()) || field.split('_').any(|segment| names.contains(&segment))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noon() -> NaiveTime {
        NaiveTime::from_hms_opt(12, 0, 0).unwrap()
    }

    fn input(event_type: AuditEventType) -> RiskInput<'static> {
        RiskInput {
            event_type,
            operation: None,
            sensitive_fields: false,
            actor_role: None,
            local_time: noon(),
        }
    }

    #[test]
    fn test_thresholds_are_inclusive_lower_bounds() {
        assert_eq!(RiskLevel::from_score(19), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(20), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(34), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(35), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(49), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(50), RiskLevel::Critical);
    }

    #[test]
    fn test_event_type_points() {
        assert_eq!(score(&input(AuditEventType::FailedLogin)).score, 30);
        assert_eq!(score(&input(AuditEventType::SensitiveDataAccessed)).score, 25);
        assert_eq!(score(&input(AuditEventType::EntityDeleted)).score, 20);
        assert_eq!(score(&input(AuditEventType::EntityCreated)).score, 10);
        assert_eq!(score(&input(AuditEventType::Logout)).score, 5);
    }

    #[test]
    fn test_combined_signals_reach_critical() {
        let assessment = score(&RiskInput {
            event_type: AuditEventType::EntityDeleted,
            operation: Some("Purge_Beneficiary"),
            sensitive_fields: true,
            actor_role: Some("Admin"),
            local_time: NaiveTime::from_hms_opt(23, 30, 0).unwrap(),
        });
        assert_eq!(assessment.score, 20 + 15 + 20 + 10 + 10);
        assert_eq!(assessment.level, RiskLevel::Critical);
    }

    #[test]
    fn test_destructive_keyword_wins_over_mutating() {
        let mut i = input(AuditEventType::EntityUpdated);
        i.operation = Some("update_and_remove");
        assert_eq!(score(&i).score, 15 + 15);

        i.operation = Some("edit_profile");
        assert_eq!(score(&i).score, 15 + 10);

        i.operation = Some("view");
        assert_eq!(score(&i).score, 15);
    }

    #[test]
    fn test_non_elevated_role_scores_nothing() {
        let mut i = input(AuditEventType::EntityAccessed);
        i.actor_role = Some("caseworker");
        assert_eq!(score(&i).score, 5);
        i.actor_role = Some("super_admin");
        assert_eq!(score(&i).score, 15);
    }

    #[test]
    fn test_off_hours_boundaries() {
        assert!(is_off_hours(NaiveTime::from_hms_opt(5, 59, 59).unwrap()));
        assert!(!is_off_hours(NaiveTime::from_hms_opt(6, 0, 0).unwrap()));
        assert!(!is_off_hours(NaiveTime::from_hms_opt(22, 0, 0).unwrap()));
        assert!(is_off_hours(NaiveTime::from_hms_opt(22, 0, 1).unwrap()));
    }

    #[test]
    fn test_score_is_deterministic() {
        let i = RiskInput {
            event_type: AuditEventType::SensitiveDataExported,
            operation: Some("export"),
            sensitive_fields: true,
            actor_role: Some("root"),
            local_time: noon(),
        };
        assert_eq!(score(&i), score(&i));
    }

    #[test]
    fn test_classify_changed_fields() {
        assert_eq!(classify_changed_fields(&["email"]), RiskLevel::High);
        assert_eq!(classify_changed_fields(&["name", "Status"]), RiskLevel::High);
        assert_eq!(classify_changed_fields(&["password_hash"]), RiskLevel::High);
        assert_eq!(classify_changed_fields(&["cpf", "name"]), RiskLevel::Medium);
        assert_eq!(classify_changed_fields(&["home_address"]), RiskLevel::Medium);
        assert_eq!(classify_changed_fields(&["name"]), RiskLevel::Low);
        assert_eq!(classify_changed_fields::<&str>(&[]), RiskLevel::Low);
    }

    #[test]
    fn test_sensitive_changed_fields() {
        let fields = sensitive_changed_fields(&["name", "email", "phone"]);
        assert_eq!(fields, vec!["email".to_string(), "phone".to_string()]);

        let personal = personal_data_fields(&["status", "email", "home_address", "cpf"]);
        assert_eq!(personal, vec!["home_address".to_string(), "cpf".to_string()]);
    }

    #[test]
    fn test_risk_level_ordering_and_spelling() {
        assert!(RiskLevel::Low < RiskLevel::Medium);
        assert!(RiskLevel::High < RiskLevel::Critical);
        assert_eq!(serde_json::to_string(&RiskLevel::High).unwrap(), "\"HIGH\"");
        assert_eq!("critical".parse::<RiskLevel>().unwrap(), RiskLevel::Critical);
        assert!("SEVERE".parse::<RiskLevel>().is_err());
    }
}
