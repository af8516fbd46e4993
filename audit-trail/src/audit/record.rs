//! Durable audit log records
//!
//! [`AuditLogRecord`] is what storage holds: created exactly once, never
//! mutated. [`AuditLogDraft`] is the creation command handed to the core
//! service, which validates it and assigns the id and `created_at`.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::event::RequestContext;
use super::risk::RiskLevel;
use crate::error::{Error, Result};

/// Kind of operation recorded
///
/// The serialized spelling (`CREATE`, `FAILED_LOGIN`, ...) is the stored schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    Create,
    Read,
    Update,
    Delete,
    Access,
    Export,
    Anonymize,
    Login,
    Logout,
    FailedLogin,
}

impl OperationType {
    /// Stored spelling
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Read => "READ",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Access => "ACCESS",
            Self::Export => "EXPORT",
            Self::Anonymize => "ANONYMIZE",
            Self::Login => "LOGIN",
            Self::Logout => "LOGOUT",
            Self::FailedLogin => "FAILED_LOGIN",
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OperationType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "CREATE" => Ok(Self::Create),
            "READ" => Ok(Self::Read),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            "ACCESS" => Ok(Self::Access),
            "EXPORT" => Ok(Self::Export),
            "ANONYMIZE" => Ok(Self::Anonymize),
            "LOGIN" => Ok(Self::Login),
            "LOGOUT" => Ok(Self::Logout),
            "FAILED_LOGIN" => Ok(Self::FailedLogin),
            other => Err(format!("unknown operation type: {}", other)),
        }
    }
}

/// A persisted audit log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogRecord {
    /// UUID v7, assigned on persist
    pub id: Uuid,
    pub operation_type: OperationType,
    /// Entity name, e.g. `Usuario`
    pub affected_entity: String,
    pub affected_entity_id: Option<String>,
    pub previous_data: Option<serde_json::Value>,
    pub new_data: Option<serde_json::Value>,
    /// Weak reference to the acting user
    pub user_id: Option<String>,
    pub source_ip: Option<String>,
    pub user_agent: Option<String>,
    pub endpoint: Option<String>,
    pub http_method: Option<String>,
    pub sensitive_fields_accessed: Vec<String>,
    pub risk_level: Option<RiskLevel>,
    pub reason: Option<String>,
    pub description: Option<String>,
    /// When the operation happened (caller supplied)
    pub occurred_at: DateTime<Utc>,
    /// When the record was inserted (server assigned)
    pub created_at: DateTime<Utc>,
}

/// Command to create one [`AuditLogRecord`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditLogDraft {
    /// Required; optional here so malformed commands can be rejected by validation
    pub operation_type: Option<OperationType>,
    pub affected_entity: String,
    #[serde(default)]
    pub affected_entity_id: Option<String>,
    #[serde(default)]
    pub previous_data: Option<serde_json::Value>,
    #[serde(default)]
    pub new_data: Option<serde_json::Value>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub source_ip: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub http_method: Option<String>,
    #[serde(default)]
    pub sensitive_fields_accessed: Vec<String>,
    #[serde(default)]
    pub risk_level: Option<RiskLevel>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Defaults to the server clock at persist time
    #[serde(default)]
    pub occurred_at: Option<DateTime<Utc>>,
}

impl AuditLogDraft {
    /// Create a draft for an operation on an entity
    pub fn new(operation_type: OperationType, affected_entity: impl Into<String>) -> Self {
        Self {
            operation_type: Some(operation_type),
            affected_entity: affected_entity.into(),
            ..Self::default()
        }
    }

    pub fn with_entity_id(mut self, id: impl Into<String>) -> Self {
        self.affected_entity_id = Some(id.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Copy request details (ip, user agent, endpoint, method)
    pub fn with_request(mut self, context: &RequestContext) -> Self {
        self.source_ip = context.ip.clone();
        self.user_agent = context.user_agent.clone();
        self.endpoint = context.endpoint.clone();
        self.http_method = context.method.clone();
        self
    }

    pub fn with_previous_data(mut self, data: serde_json::Value) -> Self {
        self.previous_data = Some(data);
        self
    }

    pub fn with_new_data(mut self, data: serde_json::Value) -> Self {
        self.new_data = Some(data);
        self
    }

    pub fn with_sensitive_fields(mut self, fields: Vec<String>) -> Self {
        self.sensitive_fields_accessed = fields;
        self
    }

    pub fn with_risk_level(mut self, level: RiskLevel) -> Self {
        self.risk_level = Some(level);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_occurred_at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = Some(occurred_at);
        self
    }

    /// Check the draft can become a record at `now`
    pub fn validate(&self, now: DateTime<Utc>) -> Result<()> {
        if self.operation_type.is_none() {
            return Err(Error::validation("operation_type is required"));
        }
        if self.affected_entity.trim().is_empty() {
            return Err(Error::validation("affected_entity must not be empty"));
        }
        if let Some(occurred_at) = self.occurred_at {
            if occurred_at > now {
                return Err(Error::validation(format!(
                    "occurred_at {} is in the future",
                    occurred_at.to_rfc3339()
                )));
            }
        }
        Ok(())
    }

    /// Highest risk level carried by the draft
    pub fn risk(&self) -> RiskLevel {
        self.risk_level.unwrap_or_default()
    }

    /// Turn a validated draft into a record
    ///
    /// Timestamps are truncated to microseconds, the precision storage keeps.
    pub fn into_record(
        self,
        id: Uuid,
        created_at: DateTime<Utc>,
    ) -> Result<AuditLogRecord> {
        self.validate(created_at)?;
        let operation_type = self
            .operation_type
            .ok_or_else(|| Error::validation("operation_type is required"))?;

        Ok(AuditLogRecord {
            id,
            operation_type,
            affected_entity: self.affected_entity,
            affected_entity_id: self.affected_entity_id,
            previous_data: self.previous_data,
            new_data: self.new_data,
            user_id: self.user_id,
            source_ip: self.source_ip,
            user_agent: self.user_agent,
            endpoint: self.endpoint,
            http_method: self.http_method,
            sensitive_fields_accessed: self.sensitive_fields_accessed,
            risk_level: self.risk_level,
            reason: self.reason,
            description: self.description,
            occurred_at: self.occurred_at.unwrap_or(created_at).trunc_subsecs(6),
            created_at: created_at.trunc_subsecs(6),
        })
    }
}
