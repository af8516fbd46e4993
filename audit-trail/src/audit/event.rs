//! Audit event types
//!
//! An [`AuditEvent`] is the in-process message call sites emit. It carries a
//! common envelope (id, timestamp, risk, actor, request context, metadata) and
//! a closed [`AuditEventPayload`] with one variant per event type. Events are
//! ephemeral; listeners turn them into durable
//! [`AuditLogDraft`](super::record::AuditLogDraft)s.

use std::collections::BTreeSet;

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::risk::{self, RiskInput, RiskLevel};
use crate::error::{Error, Result};

/// Flat event type, derived from the payload variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditEventType {
    EntityCreated,
    EntityUpdated,
    EntityDeleted,
    EntityAccessed,
    SensitiveDataAccessed,
    SensitiveDataExported,
    SecurityAlert,
    SecurityViolation,
    UnauthorizedAccess,
    SystemInfo,
    SystemWarning,
    SystemError,
    Login,
    Logout,
    FailedLogin,
}

impl AuditEventType {
    /// Every event type, in topic registration order
    pub const ALL: [AuditEventType; 15] = [
        Self::EntityCreated,
        Self::EntityUpdated,
        Self::EntityDeleted,
        Self::EntityAccessed,
        Self::SensitiveDataAccessed,
        Self::SensitiveDataExported,
        Self::SecurityAlert,
        Self::SecurityViolation,
        Self::UnauthorizedAccess,
        Self::SystemInfo,
        Self::SystemWarning,
        Self::SystemError,
        Self::Login,
        Self::Logout,
        Self::FailedLogin,
    ];

    /// Kebab-case name (`entity-updated`)
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EntityCreated => "entity-created",
            Self::EntityUpdated => "entity-updated",
            Self::EntityDeleted => "entity-deleted",
            Self::EntityAccessed => "entity-accessed",
            Self::SensitiveDataAccessed => "sensitive-data-accessed",
            Self::SensitiveDataExported => "sensitive-data-exported",
            Self::SecurityAlert => "security-alert",
            Self::SecurityViolation => "security-violation",
            Self::UnauthorizedAccess => "unauthorized-access",
            Self::SystemInfo => "system-info",
            Self::SystemWarning => "system-warning",
            Self::SystemError => "system-error",
            Self::Login => "login",
            Self::Logout => "logout",
            Self::FailedLogin => "failed-login",
        }
    }

    /// Bus topic the event is published on
    pub fn topic(&self) -> &'static str {
        match self {
            Self::EntityCreated => "audit.entity.created",
            Self::EntityUpdated => "audit.entity.updated",
            Self::EntityDeleted => "audit.entity.deleted",
            Self::EntityAccessed => "audit.entity.accessed",
            Self::SensitiveDataAccessed => "audit.sensitive.accessed",
            Self::SensitiveDataExported => "audit.sensitive.exported",
            Self::SecurityAlert => "audit.security.alert",
            Self::SecurityViolation => "audit.security.violation",
            Self::UnauthorizedAccess => "audit.security.unauthorized",
            Self::SystemInfo => "audit.system.info",
            Self::SystemWarning => "audit.system.warning",
            Self::SystemError => "audit.system.error",
            Self::Login => "audit.auth.login",
            Self::Logout => "audit.auth.logout",
            Self::FailedLogin => "audit.auth.failed",
        }
    }
}

impl std::fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request details captured at the edge
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    /// Client IP address
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    /// Request URL or path
    #[serde(default)]
    pub endpoint: Option<String>,
    /// HTTP method
    #[serde(default)]
    pub method: Option<String>,
}

impl RequestContext {
    pub fn new(method: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            method: Some(method.into()),
            endpoint: Some(endpoint.into()),
            ..Self::default()
        }
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }
}

/// Create/update/delete of a domain entity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityChange {
    pub entity_name: String,
    #[serde(default)]
    pub entity_id: Option<String>,
    /// Free-form operation name, scored by keyword
    #[serde(default)]
    pub operation: Option<String>,
    #[serde(default)]
    pub previous_data: Option<Value>,
    #[serde(default)]
    pub new_data: Option<Value>,
    #[serde(default)]
    pub changed_fields: Vec<String>,
    #[serde(default)]
    pub sensitive_fields_changed: Vec<String>,
    /// Personal data was touched
    #[serde(default)]
    pub lgpd_relevant: bool,
}

/// Plain read of a domain entity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityAccess {
    pub entity_name: String,
    #[serde(default)]
    pub entity_id: Option<String>,
}

/// Read or export of personal data fields
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensitiveAccess {
    pub entity_name: String,
    #[serde(default)]
    pub entity_id: Option<String>,
    pub fields: Vec<String>,
    /// Legal basis or justification
    #[serde(default)]
    pub reason: Option<String>,
}

/// Category of a security incident
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityKind {
    Alert,
    Violation,
    UnauthorizedAccess,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityIncident {
    pub kind: SecurityKind,
    pub description: String,
    #[serde(default)]
    pub entity_name: Option<String>,
}

/// Severity of a system notice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemNotice {
    pub level: SystemLevel,
    pub component: String,
    pub message: String,
}

/// Login, logout or failed login
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthAttempt {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Type-specific part of an [`AuditEvent`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "data", rename_all = "kebab-case")]
pub enum AuditEventPayload {
    EntityCreated(EntityChange),
    EntityUpdated(EntityChange),
    EntityDeleted(EntityChange),
    EntityAccessed(EntityAccess),
    SensitiveDataAccessed(SensitiveAccess),
    SensitiveDataExported(SensitiveAccess),
    Security(SecurityIncident),
    System(SystemNotice),
    Login(AuthAttempt),
    Logout(AuthAttempt),
    FailedLogin(AuthAttempt),
}

impl AuditEventPayload {
    /// Flat type of this payload
    pub fn event_type(&self) -> AuditEventType {
        match self {
            Self::EntityCreated(_) => AuditEventType::EntityCreated,
            Self::EntityUpdated(_) => AuditEventType::EntityUpdated,
            Self::EntityDeleted(_) => AuditEventType::EntityDeleted,
            Self::EntityAccessed(_) => AuditEventType::EntityAccessed,
            Self::SensitiveDataAccessed(_) => AuditEventType::SensitiveDataAccessed,
            Self::SensitiveDataExported(_) => AuditEventType::SensitiveDataExported,
            Self::Security(incident) => match incident.kind {
                SecurityKind::Alert => AuditEventType::SecurityAlert,
                SecurityKind::Violation => AuditEventType::SecurityViolation,
                SecurityKind::UnauthorizedAccess => AuditEventType::UnauthorizedAccess,
            },
            Self::System(notice) => match notice.level {
                SystemLevel::Info => AuditEventType::SystemInfo,
                SystemLevel::Warning => AuditEventType::SystemWarning,
                SystemLevel::Error => AuditEventType::SystemError,
            },
            Self::Login(_) => AuditEventType::Login,
            Self::Logout(_) => AuditEventType::Logout,
            Self::FailedLogin(_) => AuditEventType::FailedLogin,
        }
    }

    /// Name of the entity the event is about, if any
    pub fn entity_name(&self) -> Option<&str> {
        match self {
            Self::EntityCreated(c) | Self::EntityUpdated(c) | Self::EntityDeleted(c) => {
                Some(&c.entity_name)
            }
            Self::EntityAccessed(a) => Some(&a.entity_name),
            Self::SensitiveDataAccessed(s) | Self::SensitiveDataExported(s) => {
                Some(&s.entity_name)
            }
            Self::Security(incident) => incident.entity_name.as_deref(),
            Self::System(_) | Self::Login(_) | Self::Logout(_) | Self::FailedLogin(_) => None,
        }
    }

    fn operation(&self) -> Option<&str> {
        match self {
            Self::EntityCreated(c) | Self::EntityUpdated(c) | Self::EntityDeleted(c) => {
                c.operation.as_deref()
            }
            _ => None,
        }
    }

    fn touches_sensitive_fields(&self) -> bool {
        match self {
            Self::EntityCreated(c) | Self::EntityUpdated(c) | Self::EntityDeleted(c) => {
                !c.sensitive_fields_changed.is_empty()
            }
            Self::SensitiveDataAccessed(s) | Self::SensitiveDataExported(s) => {
                !s.fields.is_empty()
            }
            _ => false,
        }
    }
}

/// A single audit event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique event identifier
    pub id: Uuid,
    /// When the event occurred; never in the future
    pub timestamp: DateTime<Utc>,
    pub risk_level: RiskLevel,
    /// Acting user
    #[serde(default)]
    pub user_id: Option<String>,
    /// Role of the acting user, scored as elevated for admin roles
    #[serde(default)]
    pub actor_role: Option<String>,
    #[serde(default)]
    pub context: Option<RequestContext>,
    /// Free-form structured metadata
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub payload: AuditEventPayload,
    /// Set once the risk level was chosen explicitly
    #[serde(skip)]
    risk_pinned: bool,
}

impl AuditEvent {
    /// Create an event from a payload, scoring its risk
    pub fn new(payload: AuditEventPayload) -> Self {
        let mut event = Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            risk_level: RiskLevel::Low,
            user_id: None,
            actor_role: None,
            context: None,
            metadata: Map::new(),
            payload,
            risk_pinned: false,
        };
        event.rescore();
        event
    }

    /// A new entity was created
    pub fn entity_created(
        entity_name: impl Into<String>,
        entity_id: impl Into<String>,
        new_data: Value,
    ) -> Self {
        Self::new(AuditEventPayload::EntityCreated(EntityChange {
            entity_name: entity_name.into(),
            entity_id: Some(entity_id.into()),
            new_data: Some(new_data),
            ..EntityChange::default()
        }))
    }

    /// An entity was updated
    ///
    /// When `changed_fields` is empty and both snapshots are JSON objects, the
    /// changed fields are computed by diffing them.
    pub fn entity_updated(
        entity_name: impl Into<String>,
        entity_id: impl Into<String>,
        previous_data: Option<Value>,
        new_data: Option<Value>,
        changed_fields: Vec<String>,
    ) -> Self {
        let changed_fields = if changed_fields.is_empty() {
            match (&previous_data, &new_data) {
                (Some(previous), Some(new)) => diff_fields(previous, new),
                _ => changed_fields,
            }
        } else {
            changed_fields
        };
        let sensitive_fields_changed = risk::sensitive_changed_fields(changed_fields.as_slice());

        Self::new(AuditEventPayload::EntityUpdated(EntityChange {
            entity_name: entity_name.into(),
            entity_id: Some(entity_id.into()),
            operation: None,
            previous_data,
            new_data,
            lgpd_relevant: !sensitive_fields_changed.is_empty(),
            changed_fields,
            sensitive_fields_changed,
        }))
    }

    /// An entity was deleted
    pub fn entity_deleted(
        entity_name: impl Into<String>,
        entity_id: impl Into<String>,
        previous_data: Option<Value>,
    ) -> Self {
        Self::new(AuditEventPayload::EntityDeleted(EntityChange {
            entity_name: entity_name.into(),
            entity_id: Some(entity_id.into()),
            previous_data,
            ..EntityChange::default()
        }))
    }

    /// An entity was read
    pub fn entity_accessed(entity_name: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self::new(AuditEventPayload::EntityAccessed(EntityAccess {
            entity_name: entity_name.into(),
            entity_id: Some(entity_id.into()),
        }))
    }

    /// Personal data fields were read
    pub fn sensitive_access(
        entity_name: impl Into<String>,
        entity_id: impl Into<String>,
        fields: Vec<String>,
        reason: Option<String>,
    ) -> Self {
        Self::new(AuditEventPayload::SensitiveDataAccessed(SensitiveAccess {
            entity_name: entity_name.into(),
            entity_id: Some(entity_id.into()),
            fields,
            reason,
        }))
    }

    /// Personal data fields were exported
    pub fn sensitive_export(
        entity_name: impl Into<String>,
        entity_id: impl Into<String>,
        fields: Vec<String>,
        reason: Option<String>,
    ) -> Self {
        Self::new(AuditEventPayload::SensitiveDataExported(SensitiveAccess {
            entity_name: entity_name.into(),
            entity_id: Some(entity_id.into()),
            fields,
            reason,
        }))
    }

    pub fn security_event(kind: SecurityKind, description: impl Into<String>) -> Self {
        Self::new(AuditEventPayload::Security(SecurityIncident {
            kind,
            description: description.into(),
            entity_name: None,
        }))
    }

    pub fn system_event(
        level: SystemLevel,
        component: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(AuditEventPayload::System(SystemNotice {
            level,
            component: component.into(),
            message: message.into(),
        }))
    }

    pub fn login(username: impl Into<String>) -> Self {
        Self::new(AuditEventPayload::Login(AuthAttempt {
            username: Some(username.into()),
            reason: None,
        }))
    }

    pub fn logout(username: impl Into<String>) -> Self {
        Self::new(AuditEventPayload::Logout(AuthAttempt {
            username: Some(username.into()),
            reason: None,
        }))
    }

    pub fn failed_login(username: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(AuditEventPayload::FailedLogin(AuthAttempt {
            username: Some(username.into()),
            reason: Some(reason.into()),
        }))
    }

    /// Set the acting user
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Set the actor's role (rescored)
    pub fn with_actor_role(mut self, role: impl Into<String>) -> Self {
        self.actor_role = Some(role.into());
        self.rescore();
        self
    }

    /// Attach the request context
    pub fn with_context(mut self, context: RequestContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Set the operation name of an entity change (rescored); ignored for other payloads
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        if let AuditEventPayload::EntityCreated(c)
        | AuditEventPayload::EntityUpdated(c)
        | AuditEventPayload::EntityDeleted(c) = &mut self.payload
        {
            c.operation = Some(operation.into());
        }
        self.rescore();
        self
    }

    /// Set the occurrence time (rescored, the time of day is a risk signal)
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self.rescore();
        self
    }

    /// Add a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Override the computed risk level; later builder calls will not rescore
    pub fn with_risk_level(mut self, level: RiskLevel) -> Self {
        self.risk_level = level;
        self.risk_pinned = true;
        self
    }

    /// Flat event type
    pub fn event_type(&self) -> AuditEventType {
        self.payload.event_type()
    }

    /// Bus topic for this event
    pub fn topic(&self) -> &'static str {
        self.event_type().topic()
    }

    pub(crate) fn risk_is_pinned(&self) -> bool {
        self.risk_pinned
    }

    /// Risk signals for this event
    pub fn risk_input(&self) -> RiskInput<'_> {
        RiskInput {
            event_type: self.event_type(),
            operation: self.payload.operation(),
            sensitive_fields: self.payload.touches_sensitive_fields(),
            actor_role: self.actor_role.as_deref(),
            local_time: self.timestamp.with_timezone(&Local).time(),
        }
    }

    fn rescore(&mut self) {
        if !self.risk_pinned {
            let assessment = risk::score(&self.risk_input());
            self.risk_level = assessment.level;
        }
    }

    /// Reject events that cannot be recorded
    pub fn validate(&self) -> Result<()> {
        if self.timestamp > Utc::now() {
            return Err(Error::validation(format!(
                "event {} timestamp {} is in the future",
                self.id,
                self.timestamp.to_rfc3339()
            )));
        }
        if let Some(name) = self.payload.entity_name() {
            if name.trim().is_empty() {
                return Err(Error::validation(format!(
                    "event {} has an empty entity name",
                    self.id
                )));
            }
        }
        Ok(())
    }

    /// Decode an event from JSON and validate it
    ///
    /// Unknown event types or enum values are reported as validation errors.
    pub fn from_json(json: &str) -> Result<Self> {
        let event: AuditEvent = serde_json::from_str(json)
            .map_err(|e| Error::validation(format!("malformed audit event: {}", e)))?;
        event.validate()?;
        Ok(event)
    }
}

/// Top-level keys whose values differ between two JSON objects, sorted
fn diff_fields(previous: &Value, new: &Value) -> Vec<String> {
    let (Some(previous), Some(new)) = (previous.as_object(), new.as_object()) else {
        return Vec::new();
    };

    let keys: BTreeSet<&String> = previous.keys().chain(new.keys()).collect();
    keys.into_iter()
        .filter(|k| previous.get(k.as_str()) != new.get(k.as_str()))
        .cloned()
        .collect()
}
