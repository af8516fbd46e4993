//! Tamper-evidence for persisted audit records
//!
//! Each record gets a BLAKE3 content hash over a canonical JSON projection of
//! its identifying fields, bound to the record id in an HS256 JWT. A record is
//! intact when the token validates against the signing key, names the record's
//! id, and carries the hash the record still produces.
//!
//! Tokens carry no expiry.

use chrono::{DateTime, SecondsFormat, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::record::AuditLogRecord;
use crate::config::SigningConfig;
use crate::error::{Error, IntegrityFailure, Result};

/// Stored signature of one audit record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureRecord {
    pub log_id: Uuid,
    /// Hex BLAKE3 digest of the canonical content
    pub content_hash: String,
    pub issued_at: DateTime<Utc>,
    /// Opaque HS256 token
    pub token: String,
}

/// Outcome of verifying one record in a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationResult {
    pub id: Uuid,
    pub intact: bool,
    /// Why verification failed
    pub reason: Option<IntegrityFailure>,
}

#[derive(Debug, Serialize, Deserialize)]
struct IntegrityClaims {
    sub: String,
    hash: String,
    iat: i64,
    iss: String,
}

/// Signs and verifies audit records
#[derive(Clone)]
pub struct SignatureService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    issuer: String,
}

impl std::fmt::Debug for SignatureService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureService")
            .field("issuer", &self.issuer)
            .finish_non_exhaustive()
    }
}

impl SignatureService {
    /// Build the service from signing configuration
    ///
    /// Uses `signing_key`, falling back to `app_secret` with a warning.
    /// Fails with a configuration error when neither is set.
    pub fn new(config: &SigningConfig) -> Result<Self> {
        let secret = match (config.signing_key.as_deref(), config.app_secret.as_deref()) {
            (Some(key), _) if !key.is_empty() => key,
            (_, Some(secret)) if !secret.is_empty() => {
                tracing::warn!(
                    "No dedicated audit signing key configured; falling back to the application secret"
                );
                secret
            }
            _ => {
                return Err(Error::Configuration(
                    "signing.signing_key (or signing.app_secret) must be set to sign audit logs"
                        .to_string(),
                ))
            }
        };

        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims.clear();
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.set_issuer(&[config.issuer.as_str()]);

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            issuer: config.issuer.clone(),
        })
    }

    /// Hex BLAKE3 digest of the record's canonical content
    ///
    /// Covers operation type, entity, entity id, user, endpoint, method,
    /// source IP and `occurred_at` (RFC 3339, microseconds).
    pub fn content_hash(record: &AuditLogRecord) -> Result<String> {
        let canonical = serde_json::json!({
            "operation_type": record.operation_type.as_str(),
            "affected_entity": record.affected_entity,
            "affected_entity_id": record.affected_entity_id,
            "user_id": record.user_id,
            "endpoint": record.endpoint,
            "http_method": record.http_method,
            "source_ip": record.source_ip,
            "occurred_at": record.occurred_at.to_rfc3339_opts(SecondsFormat::Micros, true),
        });
        let bytes = serde_json::to_vec(&canonical)?;
        Ok(blake3::hash(&bytes).to_hex().to_string())
    }

    /// Sign one record
    pub fn sign(&self, record: &AuditLogRecord) -> Result<SignatureRecord> {
        let content_hash = Self::content_hash(record)?;
        let issued_at = Utc::now();
        let claims = IntegrityClaims {
            sub: record.id.to_string(),
            hash: content_hash.clone(),
            iat: issued_at.timestamp(),
            iss: self.issuer.clone(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)?;

        Ok(SignatureRecord {
            log_id: record.id,
            content_hash,
            issued_at,
            token,
        })
    }

    /// Sign every record; fails on the first error
    pub fn sign_batch(&self, records: &[AuditLogRecord]) -> Result<Vec<SignatureRecord>> {
        records.iter().map(|r| self.sign(r)).collect()
    }

    /// Check a record against its token, explaining any mismatch
    pub fn check(&self, record: &AuditLogRecord, token: &str) -> Result<()> {
        let data = decode::<IntegrityClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| {
                Error::integrity(record.id, IntegrityFailure::InvalidToken(e.to_string()))
            })?;
        let claims = data.claims;

        if claims.sub != record.id.to_string() {
            return Err(Error::integrity(
                record.id,
                IntegrityFailure::IdMismatch {
                    token_id: claims.sub,
                },
            ));
        }

        if claims.hash != Self::content_hash(record)? {
            return Err(Error::integrity(record.id, IntegrityFailure::HashMismatch));
        }

        Ok(())
    }

    /// Whether a record is intact
    pub fn verify(&self, record: &AuditLogRecord, token: &str) -> bool {
        self.check(record, token).is_ok()
    }

    /// Verify many records, one independent result per entry
    pub fn verify_batch(&self, entries: &[(AuditLogRecord, String)]) -> Vec<VerificationResult> {
        entries
            .iter()
            .map(|(record, token)| match self.check(record, token) {
                Ok(()) => VerificationResult {
                    id: record.id,
                    intact: true,
                    reason: None,
                },
                Err(Error::IntegrityViolation { reason, .. }) => VerificationResult {
                    id: record.id,
                    intact: false,
                    reason: Some(reason),
                },
                Err(other) => VerificationResult {
                    id: record.id,
                    intact: false,
                    reason: Some(IntegrityFailure::InvalidToken(other.to_string())),
                },
            })
            .collect()
    }
}
