//! In-memory audit storage
//!
//! Keeps records in insertion order behind an async `RwLock`. Useful for tests
//! and for running the pipeline without a database; contents are lost on exit.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::AuditStorage;
use crate::audit::query::{AuditLogQuery, Page, SensitiveAccessReport};
use crate::audit::record::AuditLogRecord;
use crate::audit::signature::SignatureRecord;
use crate::error::Error;

#[derive(Debug, Default)]
struct Tables {
    records: Vec<AuditLogRecord>,
    ids: HashSet<Uuid>,
    signatures: HashMap<Uuid, SignatureRecord>,
}

/// Process-local append-only storage
#[derive(Debug, Default)]
pub struct MemoryAuditStorage {
    tables: RwLock<Tables>,
}

impl MemoryAuditStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records
    pub async fn len(&self) -> usize {
        self.tables.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Every stored record in insertion order
    pub async fn all(&self) -> Vec<AuditLogRecord> {
        self.tables.read().await.records.clone()
    }
}

#[async_trait]
impl AuditStorage for MemoryAuditStorage {
    async fn append(&self, record: &AuditLogRecord) -> Result<(), Error> {
        let mut tables = self.tables.write().await;
        if !tables.ids.insert(record.id) {
            return Err(Error::Storage(format!(
                "duplicate audit log id {}",
                record.id
            )));
        }
        tables.records.push(record.clone());
        Ok(())
    }

    async fn append_batch(&self, records: &[AuditLogRecord]) -> Result<(), Error> {
        let mut tables = self.tables.write().await;

        // Check everything before touching the tables
        let mut batch_ids = HashSet::with_capacity(records.len());
        for record in records {
            if tables.ids.contains(&record.id) || !batch_ids.insert(record.id) {
                return Err(Error::Storage(format!(
                    "duplicate audit log id {}",
                    record.id
                )));
            }
        }

        tables.ids.extend(batch_ids);
        tables.records.extend_from_slice(records);
        Ok(())
    }

    async fn find(&self, query: &AuditLogQuery) -> Result<Page<AuditLogRecord>, Error> {
        let tables = self.tables.read().await;
        let mut matching: Vec<&AuditLogRecord> =
            tables.records.iter().filter(|r| query.matches(r)).collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(query.offset() as usize)
            .take(query.effective_page_size() as usize)
            .cloned()
            .collect();

        Ok(Page {
            items,
            total,
            page: query.effective_page(),
            page_size: query.effective_page_size(),
        })
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<AuditLogRecord>, Error> {
        let tables = self.tables.read().await;
        Ok(tables.records.iter().find(|r| r.id == id).cloned())
    }

    async fn sensitive_access_report(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<SensitiveAccessReport, Error> {
        let tables = self.tables.read().await;
        Ok(SensitiveAccessReport::build(from, to, tables.records.iter()))
    }

    async fn store_signatures(&self, signatures: &[SignatureRecord]) -> Result<(), Error> {
        let mut tables = self.tables.write().await;
        for signature in signatures {
            if tables.signatures.contains_key(&signature.log_id) {
                return Err(Error::Storage(format!(
                    "audit log {} is already signed",
                    signature.log_id
                )));
            }
        }
        for signature in signatures {
            tables
                .signatures
                .insert(signature.log_id, signature.clone());
        }
        Ok(())
    }

    async fn signature_for(&self, log_id: Uuid) -> Result<Option<SignatureRecord>, Error> {
        Ok(self.tables.read().await.signatures.get(&log_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::record::{AuditLogDraft, OperationType};
    use chrono::{Duration, SubsecRound};

    fn record_at(entity: &str, created_at: DateTime<Utc>) -> AuditLogRecord {
        AuditLogDraft::new(OperationType::Read, entity)
            .with_occurred_at(created_at)
            .into_record(Uuid::now_v7(), created_at)
            .unwrap()
    }

    #[tokio::test]
    async fn test_append_and_find_newest_first() {
        let storage = MemoryAuditStorage::new();
        let base = Utc::now() - Duration::minutes(10);
        for i in 0..5 {
            storage
                .append(&record_at("Beneficio", base + Duration::seconds(i)))
                .await
                .unwrap();
        }

        let page = storage
            .find(&AuditLogQuery::new().page(1, 2))
            .await
            .unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.items.len(), 2);
        assert!(page.items[0].created_at > page.items[1].created_at);

        let last = storage
            .find(&AuditLogQuery::new().page(3, 2))
            .await
            .unwrap();
        assert_eq!(last.items.len(), 1);
        assert_eq!(last.items[0].created_at, base.trunc_subsecs(6));
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let storage = MemoryAuditStorage::new();
        let record = record_at("Beneficio", Utc::now());
        storage.append(&record).await.unwrap();
        let err = storage.append(&record).await.unwrap_err();
        assert!(!err.is_retriable());
    }

    #[tokio::test]
    async fn test_batch_is_all_or_nothing() {
        let storage = MemoryAuditStorage::new();
        let existing = record_at("Beneficio", Utc::now());
        storage.append(&existing).await.unwrap();

        let batch = vec![record_at("Usuario", Utc::now()), existing.clone()];
        assert!(storage.append_batch(&batch).await.is_err());
        assert_eq!(storage.len().await, 1);

        let batch = vec![record_at("Usuario", Utc::now()), record_at("Usuario", Utc::now())];
        storage.append_batch(&batch).await.unwrap();
        assert_eq!(storage.len().await, 3);
    }

    #[tokio::test]
    async fn test_signatures_are_write_once() {
        let storage = MemoryAuditStorage::new();
        let signature = SignatureRecord {
            log_id: Uuid::now_v7(),
            content_hash: "00".repeat(32),
            issued_at: Utc::now(),
            token: "t".to_string(),
        };
        storage
            .store_signatures(std::slice::from_ref(&signature))
            .await
            .unwrap();
        assert!(storage
            .store_signatures(std::slice::from_ref(&signature))
            .await
            .is_err());
        assert_eq!(
            storage.signature_for(signature.log_id).await.unwrap(),
            Some(signature)
        );
    }
}
