//! PostgreSQL audit storage backend
//!
//! Enforces immutability using `CREATE RULE` to silently discard UPDATE/DELETE
//! operations on both the log and the signature tables.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use super::AuditStorage;
use crate::audit::query::{AuditLogQuery, Page, SensitiveAccessReport, ANONYMOUS_USER};
use crate::audit::record::{AuditLogRecord, OperationType};
use crate::audit::risk::RiskLevel;
use crate::audit::signature::SignatureRecord;
use crate::config::DatabaseConfig;
use crate::error::Error;

const RECORD_COLUMNS: &str = "id, operation_type, affected_entity, affected_entity_id, \
     previous_data, new_data, user_id, source_ip, user_agent, endpoint, http_method, \
     sensitive_fields_accessed, risk_level, reason, description, occurred_at, created_at";

const SENSITIVE_WINDOW: &str = "cardinality(sensitive_fields_accessed) > 0 \
     AND created_at >= $1 AND created_at <= $2";

const SENSITIVE_TOTAL_SQL: &str = "SELECT COUNT(*) FROM audit_logs WHERE ";

const SENSITIVE_BY_FIELD_SQL: &str = "SELECT field, COUNT(*) \
     FROM audit_logs, unnest(sensitive_fields_accessed) AS field WHERE ";

const SENSITIVE_BY_USER_SQL: &str = "SELECT COALESCE(user_id, $3), COUNT(*) FROM audit_logs WHERE ";

/// PostgreSQL-backed audit storage
pub struct PgAuditStorage {
    pool: PgPool,
}

impl PgAuditStorage {
    /// Create a new PostgreSQL audit storage
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect with retries, then create the schema
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, Error> {
        let pool = crate::database::create_pool(config).await?;
        let storage = Self::new(pool);
        storage.initialize().await?;
        Ok(storage)
    }

    /// Initialize the audit tables, indexes and immutability rules
    ///
    /// Idempotent; should be called once during application startup.
    pub async fn initialize(&self) -> Result<(), Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS audit_logs (
                id UUID PRIMARY KEY,
                operation_type TEXT NOT NULL,
                affected_entity TEXT NOT NULL,
                affected_entity_id TEXT,
                previous_data JSONB,
                new_data JSONB,
                user_id TEXT,
                source_ip TEXT,
                user_agent TEXT,
                endpoint TEXT,
                http_method TEXT,
                sensitive_fields_accessed TEXT[] NOT NULL DEFAULT '{}',
                risk_level TEXT,
                reason TEXT,
                description TEXT,
                occurred_at TIMESTAMPTZ NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Storage(format!("Failed to create audit_logs table: {}", e)))?;

        for (name, columns) in [
            ("idx_audit_logs_user_created", "user_id, created_at"),
            ("idx_audit_logs_entity_created", "affected_entity, created_at"),
            ("idx_audit_logs_operation_created", "operation_type, created_at"),
        ] {
            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS {} ON audit_logs ({})",
                name, columns
            ))
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Storage(format!("Failed to create index {}: {}", name, e)))?;
        }

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS audit_log_signatures (
                log_id UUID PRIMARY KEY,
                content_hash TEXT NOT NULL,
                issued_at TIMESTAMPTZ NOT NULL,
                token TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Storage(format!("Failed to create audit_log_signatures table: {}", e))
        })?;

        // Enforce immutability: silently discard UPDATE/DELETE
        sqlx::query(
            r#"
            DO $$
            DECLARE
                t TEXT;
            BEGIN
                FOREACH t IN ARRAY ARRAY['audit_logs', 'audit_log_signatures'] LOOP
                    IF NOT EXISTS (
                        SELECT 1 FROM pg_rules
                        WHERE rulename = t || '_no_update' AND tablename = t
                    ) THEN
                        EXECUTE format('CREATE RULE %I AS ON UPDATE TO %I DO INSTEAD NOTHING',
                                       t || '_no_update', t);
                    END IF;

                    IF NOT EXISTS (
                        SELECT 1 FROM pg_rules
                        WHERE rulename = t || '_no_delete' AND tablename = t
                    ) THEN
                        EXECUTE format('CREATE RULE %I AS ON DELETE TO %I DO INSTEAD NOTHING',
                                       t || '_no_delete', t);
                    END IF;
                END LOOP;
            END
            $$;
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Storage(format!("Failed to create audit immutability rules: {}", e)))?;

        tracing::info!("Audit log schema initialized");
        Ok(())
    }
}

fn push_insert(builder: &mut QueryBuilder<'_, Postgres>, records: &[AuditLogRecord]) {
    builder.push(format!("INSERT INTO audit_logs ({}) ", RECORD_COLUMNS));
    builder.push_values(records, |mut row, record| {
        row.push_bind(record.id)
            .push_bind(record.operation_type.as_str())
            .push_bind(record.affected_entity.clone())
            .push_bind(record.affected_entity_id.clone())
            .push_bind(record.previous_data.clone())
            .push_bind(record.new_data.clone())
            .push_bind(record.user_id.clone())
            .push_bind(record.source_ip.clone())
            .push_bind(record.user_agent.clone())
            .push_bind(record.endpoint.clone())
            .push_bind(record.http_method.clone())
            .push_bind(record.sensitive_fields_accessed.clone())
            .push_bind(record.risk_level.map(|r| r.as_str()))
            .push_bind(record.reason.clone())
            .push_bind(record.description.clone())
            .push_bind(record.occurred_at)
            .push_bind(record.created_at);
    });
}

/// `ILIKE` pattern matching `term` literally anywhere in the column
///
/// Use with `ESCAPE '\'`.
fn contains_pattern(term: &str) -> String {
    let mut pattern = String::with_capacity(term.len() + 2);
    pattern.push('%');
    for c in term.chars() {
        if matches!(c, '\\' | '%' | '_') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

/// Append `WHERE` conditions for every filter set on the query
fn push_filters(builder: &mut QueryBuilder<'_, Postgres>, query: &AuditLogQuery) {
    builder.push(" WHERE TRUE");
    if let Some(op) = query.operation_type {
        builder.push(" AND operation_type = ").push_bind(op.as_str());
    }
    if let Some(entity) = &query.affected_entity {
        builder.push(" AND affected_entity = ").push_bind(entity.clone());
    }
    if let Some(id) = &query.affected_entity_id {
        builder.push(" AND affected_entity_id = ").push_bind(id.clone());
    }
    if let Some(user) = &query.user_id {
        builder.push(" AND user_id = ").push_bind(user.clone());
    }
    if let Some(level) = query.risk_level {
        builder.push(" AND risk_level = ").push_bind(level.as_str());
    }
    if let Some(from) = query.created_from {
        builder.push(" AND created_at >= ").push_bind(from);
    }
    if let Some(to) = query.created_to {
        builder.push(" AND created_at <= ").push_bind(to);
    }
    if let Some(term) = query.search_term() {
        let pattern = contains_pattern(&term);
        builder
            .push(" AND (description ILIKE ")
            .push_bind(pattern.clone())
            .push(" ESCAPE '\\' OR endpoint ILIKE ")
            .push_bind(pattern.clone())
            .push(" ESCAPE '\\' OR affected_entity ILIKE ")
            .push_bind(pattern)
            .push(" ESCAPE '\\')");
    }
}

#[async_trait]
impl AuditStorage for PgAuditStorage {
    async fn append(&self, record: &AuditLogRecord) -> Result<(), Error> {
        let mut builder = QueryBuilder::new("");
        push_insert(&mut builder, std::slice::from_ref(record));
        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn append_batch(&self, records: &[AuditLogRecord]) -> Result<(), Error> {
        if records.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        let mut builder = QueryBuilder::new("");
        push_insert(&mut builder, records);
        builder.build().execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn find(&self, query: &AuditLogQuery) -> Result<Page<AuditLogRecord>, Error> {
        let mut count = QueryBuilder::new("SELECT COUNT(*) FROM audit_logs");
        push_filters(&mut count, query);
        let total: i64 = count.build_query_scalar::<i64>().fetch_one(&self.pool).await?;

        let mut select = QueryBuilder::new(format!("SELECT {} FROM audit_logs", RECORD_COLUMNS));
        push_filters(&mut select, query);
        select
            .push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(i64::from(query.effective_page_size()))
            .push(" OFFSET ")
            .push_bind(query.offset() as i64);
        let rows: Vec<AuditLogRow> = select.build_query_as::<AuditLogRow>().fetch_all(&self.pool).await?;

        Ok(Page {
            items: rows
                .into_iter()
                .map(AuditLogRecord::try_from)
                .collect::<Result<_, _>>()?,
            total: total.max(0) as u64,
            page: query.effective_page(),
            page_size: query.effective_page_size(),
        })
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<AuditLogRecord>, Error> {
        let row = sqlx::query_as::<_, AuditLogRow>(&format!(
            "SELECT {} FROM audit_logs WHERE id = $1",
            RECORD_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(AuditLogRecord::try_from).transpose()
    }

    async fn sensitive_access_report(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<SensitiveAccessReport, Error> {
        let total: i64 = sqlx::query_scalar(&format!("{}{}", SENSITIVE_TOTAL_SQL, SENSITIVE_WINDOW))
            .bind(from)
            .bind(to)
            .fetch_one(&self.pool)
            .await?;

        let by_field: Vec<(String, i64)> = sqlx::query_as(&format!(
            "{}{} GROUP BY field",
            SENSITIVE_BY_FIELD_SQL, SENSITIVE_WINDOW
        ))
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        let by_user: Vec<(String, i64)> = sqlx::query_as(&format!(
            "{}{} GROUP BY 1",
            SENSITIVE_BY_USER_SQL, SENSITIVE_WINDOW
        ))
        .bind(from)
        .bind(to)
        .bind(ANONYMOUS_USER)
        .fetch_all(&self.pool)
        .await?;

        Ok(report_from_counts(from, to, total, by_field, by_user))
    }

    async fn store_signatures(&self, signatures: &[SignatureRecord]) -> Result<(), Error> {
        if signatures.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        let mut builder =
            QueryBuilder::new("INSERT INTO audit_log_signatures (log_id, content_hash, issued_at, token) ");
        builder.push_values(signatures, |mut row, signature| {
            row.push_bind(signature.log_id)
                .push_bind(signature.content_hash.clone())
                .push_bind(signature.issued_at)
                .push_bind(signature.token.clone());
        });
        builder.build().execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn signature_for(&self, log_id: Uuid) -> Result<Option<SignatureRecord>, Error> {
        let row = sqlx::query_as::<_, SignatureRow>(
            "SELECT log_id, content_hash, issued_at, token FROM audit_log_signatures WHERE log_id = $1",
        )
        .bind(log_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| SignatureRecord {
            log_id: r.log_id,
            content_hash: r.content_hash,
            issued_at: r.issued_at,
            token: r.token,
        }))
    }
}

/// Assemble a report from `GROUP BY` counts
fn report_from_counts(
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    total: i64,
    by_field: Vec<(String, i64)>,
    by_user: Vec<(String, i64)>,
) -> SensitiveAccessReport {
    let count = |n: i64| n.max(0) as u64;
    SensitiveAccessReport {
        from: Some(from),
        to: Some(to),
        total: count(total),
        by_field: by_field.into_iter().map(|(k, n)| (k, count(n))).collect(),
        by_user: by_user.into_iter().map(|(k, n)| (k, count(n))).collect(),
    }
}

/// Internal row type for sqlx mapping
#[derive(sqlx::FromRow)]
struct AuditLogRow {
    id: Uuid,
    operation_type: String,
    affected_entity: String,
    affected_entity_id: Option<String>,
    previous_data: Option<serde_json::Value>,
    new_data: Option<serde_json::Value>,
    user_id: Option<String>,
    source_ip: Option<String>,
    user_agent: Option<String>,
    endpoint: Option<String>,
    http_method: Option<String>,
    sensitive_fields_accessed: Vec<String>,
    risk_level: Option<String>,
    reason: Option<String>,
    description: Option<String>,
    occurred_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl TryFrom<AuditLogRow> for AuditLogRecord {
    type Error = Error;

    fn try_from(row: AuditLogRow) -> Result<Self, Self::Error> {
        let operation_type: OperationType = row
            .operation_type
            .parse()
            .map_err(|e: String| Error::Storage(format!("audit log {}: {}", row.id, e)))?;
        let risk_level: Option<RiskLevel> = row
            .risk_level
            .as_deref()
            .map(str::parse::<RiskLevel>)
            .transpose()
            .map_err(|e: String| Error::Storage(format!("audit log {}: {}", row.id, e)))?;

        Ok(AuditLogRecord {
            id: row.id,
            operation_type,
            affected_entity: row.affected_entity,
            affected_entity_id: row.affected_entity_id,
            previous_data: row.previous_data,
            new_data: row.new_data,
            user_id: row.user_id,
            source_ip: row.source_ip,
            user_agent: row.user_agent,
            endpoint: row.endpoint,
            http_method: row.http_method,
            sensitive_fields_accessed: row.sensitive_fields_accessed,
            risk_level,
            reason: row.reason,
            description: row.description,
            occurred_at: row.occurred_at,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SignatureRow {
    log_id: Uuid,
    content_hash: String,
    issued_at: DateTime<Utc>,
    token: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> AuditLogRow {
        AuditLogRow {
            id: Uuid::now_v7(),
            operation_type: "FAILED_LOGIN".to_string(),
            affected_entity: "Usuario".to_string(),
            affected_entity_id: None,
            previous_data: None,
            new_data: None,
            user_id: None,
            source_ip: Some("10.0.0.1".to_string()),
            user_agent: None,
            endpoint: None,
            http_method: None,
            sensitive_fields_accessed: vec![],
            risk_level: Some("MEDIUM".to_string()),
            reason: None,
            description: None,
            occurred_at: Utc::now(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_row_conversion() {
        let record = AuditLogRecord::try_from(row()).unwrap();
        assert_eq!(record.operation_type, OperationType::FailedLogin);
        assert_eq!(record.risk_level, Some(RiskLevel::Medium));
    }

    #[test]
    fn test_row_with_unknown_operation_is_a_storage_error() {
        let mut bad = row();
        bad.operation_type = "TELEPORT".to_string();
        let err = AuditLogRecord::try_from(bad).unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
    }

    #[test]
    fn test_filters_render_placeholders() {
        let query = AuditLogQuery::new()
            .user("7")
            .operation_type(OperationType::Update)
            .search("usuarios");
        let mut builder = QueryBuilder::<Postgres>::new("SELECT 1 FROM audit_logs");
        push_filters(&mut builder, &query);
        let sql = builder.sql();
        assert!(sql.contains("operation_type = $1"));
        assert!(sql.contains("user_id = $2"));
        assert!(sql.contains("endpoint ILIKE $4 ESCAPE '\\'"));
        assert_eq!(sql.matches("ESCAPE").count(), 3);
    }

    #[test]
    fn test_search_wildcards_match_literally() {
        assert_eq!(contains_pattern("usuarios"), "%usuarios%");
        assert_eq!(contains_pattern("audit_log"), "%audit\\_log%");
        assert_eq!(contains_pattern("100%"), "%100\\%%");
        assert_eq!(contains_pattern("c:\\tmp"), "%c:\\\\tmp%");
    }

    #[test]
    fn test_sensitive_report_is_aggregated_in_sql() {
        for sql in [SENSITIVE_TOTAL_SQL, SENSITIVE_BY_FIELD_SQL, SENSITIVE_BY_USER_SQL] {
            assert!(!sql.contains("previous_data"));
            assert!(!sql.contains("new_data"));
        }
        assert!(SENSITIVE_BY_FIELD_SQL.contains("unnest(sensitive_fields_accessed)"));

        let now = Utc::now();
        let report = report_from_counts(
            now,
            now,
            3,
            vec![("cpf".to_string(), 2), ("salary".to_string(), 1)],
            vec![("7".to_string(), 2), (ANONYMOUS_USER.to_string(), 1)],
        );
        assert_eq!(report.total, 3);
        assert_eq!(report.by_field.get("cpf"), Some(&2));
        assert_eq!(report.by_user.get(ANONYMOUS_USER), Some(&1));
    }
}
