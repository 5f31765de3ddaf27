//! In-process contact store.
//!
//! A transaction holds the store mutex for its whole lifetime and works on a
//! private copy of the rows; `commit` publishes the copy, dropping the
//! transaction discards it.

use std::collections::BTreeSet;
use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{
    ContactId, ContactRecord, ContactStore, ContactTx, LinkPrecedence, NewContact, StoreError,
};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    records: Vec<ContactRecord>,
    last_id: i64,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryContactStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryContactStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store pre-populated with `records`; new ids continue after the highest seeded id.
    #[must_use]
    pub fn with_records(mut records: Vec<ContactRecord>) -> Self {
        records.sort_by_key(|record| record.id);
        let last_id = records.last().map_or(0, |record| record.id.0);
        Self { state: Arc::new(Mutex::new(MemoryState { records, last_id })) }
    }

    /// Committed rows ordered by id.
    pub async fn snapshot(&self) -> Vec<ContactRecord> {
        self.state.lock().await.records.clone()
    }
}

impl ContactStore for MemoryContactStore {
    type Tx = MemoryContactTx;

    async fn begin(&self) -> Result<MemoryContactTx, StoreError> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let working = guard.clone();
        Ok(MemoryContactTx { guard, working })
    }
}

#[derive(Debug)]
pub struct MemoryContactTx {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
}

impl ContactTx for MemoryContactTx {
    async fn find_by_email_or_phone(
        &mut self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Vec<ContactRecord>, StoreError> {
        Ok(self
            .working
            .records
            .iter()
            .filter(|record| {
                let email_hit = email.is_some() && record.email.as_deref() == email;
                let phone_hit =
                    phone_number.is_some() && record.phone_number.as_deref() == phone_number;
                email_hit || phone_hit
            })
            .cloned()
            .collect())
    }

    async fn find_by_ids_or_linked_ids(
        &mut self,
        ids: &BTreeSet<ContactId>,
    ) -> Result<Vec<ContactRecord>, StoreError> {
        Ok(self
            .working
            .records
            .iter()
            .filter(|record| {
                ids.contains(&record.id)
                    || record.precedence.linked_id().is_some_and(|linked| ids.contains(&linked))
            })
            .cloned()
            .collect())
    }

    async fn insert(&mut self, contact: NewContact) -> Result<ContactRecord, StoreError> {
        if let Some(linked_id) = contact.precedence.linked_id() {
            if !self.working.records.iter().any(|record| record.id == linked_id) {
                return Err(StoreError::Backend(format!(
                    "linked contact {linked_id} does not exist"
                )));
            }
        }

        let now = OffsetDateTime::now_utc();
        self.working.last_id += 1;
        let record = ContactRecord {
            id: ContactId(self.working.last_id),
            email: contact.email,
            phone_number: contact.phone_number,
            precedence: contact.precedence,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        self.working.records.push(record.clone());
        Ok(record)
    }

    async fn update_to_secondary(
        &mut self,
        id: ContactId,
        linked_id: ContactId,
    ) -> Result<(), StoreError> {
        if id == linked_id {
            return Err(StoreError::Backend(format!("contact {id} cannot link to itself")));
        }
        let Some(record) = self.working.records.iter_mut().find(|record| record.id == id) else {
            return Err(StoreError::Backend(format!("contact {id} does not exist")));
        };
        record.precedence = LinkPrecedence::Secondary { linked_id };
        record.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    async fn commit(mut self) -> Result<(), StoreError> {
        *self.guard = std::mem::take(&mut self.working);
        Ok(())
    }
}
