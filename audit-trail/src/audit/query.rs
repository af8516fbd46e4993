//! Read-side types: filters, pages and reports

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::record::{AuditLogRecord, OperationType};
use super::risk::RiskLevel;

/// Largest page a query may request
pub const MAX_PAGE_SIZE: u32 = 100;
const DEFAULT_PAGE_SIZE: u32 = 20;

/// User label for records without a user id
pub const ANONYMOUS_USER: &str = "anonymous";

/// Filters for [`AuditService::find_by_filters`](super::service::AuditService::find_by_filters)
///
/// All filters are conjunctive. Results are ordered by `created_at`
/// descending. `page` is 1-based; `page_size` is clamped to `1..=100`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogQuery {
    #[serde(default)]
    pub operation_type: Option<OperationType>,
    #[serde(default)]
    pub affected_entity: Option<String>,
    #[serde(default)]
    pub affected_entity_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub risk_level: Option<RiskLevel>,
    /// Inclusive lower bound on `created_at`
    #[serde(default)]
    pub created_from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `created_at`
    #[serde(default)]
    pub created_to: Option<DateTime<Utc>>,
    /// Case-insensitive text matched against description, endpoint and entity
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

impl Default for AuditLogQuery {
    fn default() -> Self {
        Self {
            operation_type: None,
            affected_entity: None,
            affected_entity_id: None,
            user_id: None,
            risk_level: None,
            created_from: None,
            created_to: None,
            search: None,
            page: default_page(),
            page_size: default_page_size(),
        }
    }
}

impl AuditLogQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn operation_type(mut self, operation_type: OperationType) -> Self {
        self.operation_type = Some(operation_type);
        self
    }

    /// Restrict to an entity, optionally a single instance
    pub fn entity(mut self, name: impl Into<String>, id: Option<String>) -> Self {
        self.affected_entity = Some(name.into());
        self.affected_entity_id = id;
        self
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn risk_level(mut self, level: RiskLevel) -> Self {
        self.risk_level = Some(level);
        self
    }

    pub fn created_between(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.created_from = Some(from);
        self.created_to = Some(to);
        self
    }

    pub fn search(mut self, text: impl Into<String>) -> Self {
        self.search = Some(text.into());
        self
    }

    pub fn page(mut self, page: u32, page_size: u32) -> Self {
        self.page = page;
        self.page_size = page_size;
        self
    }

    /// 1-based page, never zero
    pub fn effective_page(&self) -> u32 {
        self.page.max(1)
    }

    /// Page size clamped to `1..=MAX_PAGE_SIZE`
    pub fn effective_page_size(&self) -> u32 {
        self.page_size.clamp(1, MAX_PAGE_SIZE)
    }

    /// Rows to skip for the requested page
    pub fn offset(&self) -> u64 {
        u64::from(self.effective_page() - 1) * u64::from(self.effective_page_size())
    }

    /// Trimmed, lowercased search text; `None` when blank
    pub fn search_term(&self) -> Option<String> {
        self.search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase)
    }

    /// Whether a record passes every filter
    pub fn matches(&self, record: &AuditLogRecord) -> bool {
        if self.operation_type.is_some_and(|op| op != record.operation_type) {
            return false;
        }
        if let Some(entity) = &self.affected_entity {
            if &record.affected_entity != entity {
                return false;
            }
        }
        if let Some(id) = &self.affected_entity_id {
            if record.affected_entity_id.as_ref() != Some(id) {
                return false;
            }
        }
        if let Some(user) = &self.user_id {
            if record.user_id.as_ref() != Some(user) {
                return false;
            }
        }
        if let Some(level) = self.risk_level {
            if record.risk_level != Some(level) {
                return false;
            }
        }
        if self.created_from.is_some_and(|from| record.created_at < from) {
            return false;
        }
        if self.created_to.is_some_and(|to| record.created_at > to) {
            return false;
        }
        if let Some(term) = self.search_term() {
            let haystacks = [
                record.description.as_deref(),
                record.endpoint.as_deref(),
                Some(record.affected_entity.as_str()),
            ];
            if !haystacks
                .into_iter()
                .flatten()
                .any(|h| h.to_lowercase().contains(&term))
            {
                return false;
            }
        }
        true
    }
}

/// One page of results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Matching rows across all pages
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

impl<T> Page<T> {
    pub fn total_pages(&self) -> u64 {
        if self.page_size == 0 {
            return 0;
        }
        self.total.div_ceil(u64::from(self.page_size))
    }

    pub fn has_next(&self) -> bool {
        u64::from(self.page) < self.total_pages()
    }
}

/// Who accessed which personal data fields in a window
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensitiveAccessReport {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    /// Records that touched at least one sensitive field
    pub total: u64,
    /// Field name to number of records touching it
    pub by_field: BTreeMap<String, u64>,
    /// User id (or `anonymous`) to number of records
    pub by_user: BTreeMap<String, u64>,
}

impl SensitiveAccessReport {
    /// Tally the records with sensitive fields created within `[from, to]`
    pub fn build<'a>(
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        records: impl IntoIterator<Item = &'a AuditLogRecord>,
    ) -> Self {
        let mut report = Self {
            from: Some(from),
            to: Some(to),
            ..Self::default()
        };

        for record in records {
            if record.sensitive_fields_accessed.is_empty()
                || record.created_at < from
                || record.created_at > to
            {
                continue;
            }
            report.total += 1;
            for field in &record.sensitive_fields_accessed {
                *report.by_field.entry(field.clone()).or_default() += 1;
            }
            let user = record.user_id.as_deref().unwrap_or(ANONYMOUS_USER);
            *report.by_user.entry(user.to_string()).or_default() += 1;
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::record::AuditLogDraft;
    use chrono::Duration;
    use uuid::Uuid;

    fn record(op: OperationType, entity: &str) -> AuditLogRecord {
        AuditLogDraft::new(op, entity)
            .into_record(Uuid::now_v7(), Utc::now())
            .unwrap()
    }

    #[test]
    fn test_page_clamping() {
        let query = AuditLogQuery::new().page(0, 0);
        assert_eq!(query.effective_page(), 1);
        assert_eq!(query.effective_page_size(), 1);
        assert_eq!(query.offset(), 0);

        let query = AuditLogQuery::new().page(3, 1_000);
        assert_eq!(query.effective_page_size(), MAX_PAGE_SIZE);
        assert_eq!(query.offset(), 200);
    }

    #[test]
    fn test_matches_filters() {
        let mut r = record(OperationType::Update, "Usuario");
        r.affected_entity_id = Some("42".to_string());
        r.user_id = Some("7".to_string());
        r.risk_level = Some(RiskLevel::High);
        r.endpoint = Some("/api/usuarios/42".to_string());

        assert!(AuditLogQuery::new().matches(&r));
        assert!(AuditLogQuery::new()
            .entity("Usuario", Some("42".to_string()))
            .user("7")
            .operation_type(OperationType::Update)
            .risk_level(RiskLevel::High)
            .matches(&r));
        assert!(!AuditLogQuery::new().entity("Usuario", Some("43".to_string())).matches(&r));
        assert!(!AuditLogQuery::new().operation_type(OperationType::Delete).matches(&r));
        assert!(!AuditLogQuery::new().user("8").matches(&r));
        assert!(AuditLogQuery::new().search("USUARIOS/42").matches(&r));
        assert!(AuditLogQuery::new().search("   ").matches(&r));
        assert!(!AuditLogQuery::new().search("beneficio").matches(&r));

        let later = r.created_at + Duration::seconds(1);
        assert!(!AuditLogQuery::new().created_between(later, later).matches(&r));
        assert!(AuditLogQuery::new()
            .created_between(r.created_at, r.created_at)
            .matches(&r));
    }

    #[test]
    fn test_page_navigation() {
        let page: Page<u32> = Page {
            items: vec![],
            total: 45,
            page: 2,
            page_size: 20,
        };
        assert_eq!(page.total_pages(), 3);
        assert!(page.has_next());
    }

    #[test]
    fn test_sensitive_access_report() {
        let now = Utc::now();
        let mut a = record(OperationType::Access, "Usuario");
        a.sensitive_fields_accessed = vec!["cpf".to_string(), "salary".to_string()];
        a.user_id = Some("7".to_string());
        let mut b = record(OperationType::Export, "Usuario");
        b.sensitive_fields_accessed = vec!["cpf".to_string()];
        let c = record(OperationType::Read, "Usuario");

        let report = SensitiveAccessReport::build(
            now - Duration::minutes(1),
            now + Duration::minutes(1),
            [&a, &b, &c],
        );
        assert_eq!(report.total, 2);
        assert_eq!(report.by_field.get("cpf"), Some(&2));
        assert_eq!(report.by_field.get("salary"), Some(&1));
        assert_eq!(report.by_user.get("7"), Some(&1));
        assert_eq!(report.by_user.get(ANONYMOUS_USER), Some(&1));
    }
}
