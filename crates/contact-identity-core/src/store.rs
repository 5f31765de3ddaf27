//! Storage boundary consumed by the matcher and resolver.
//!
//! Every identify call runs inside one guarded section: [`ContactStore::begin`]
//! opens it, the four record operations run against the returned
//! [`ContactTx`], and [`ContactTx::commit`] publishes the writes. Dropping a
//! transaction without committing discards everything it wrote.

use std::collections::BTreeSet;
use std::future::Future;

use crate::{ContactId, ContactRecord, NewContact};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum StoreError {
    /// Lock contention, busy database, or a constraint raced by another writer.
    #[error("storage conflict: {0}")]
    Conflict(String),
    #[error("storage backend failure: {0}")]
    Backend(String),
    /// A persisted row violates the record shape (for example a secondary without a link).
    #[error("corrupt contact row: {0}")]
    Corrupt(String),
}

impl StoreError {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

pub trait ContactStore: Send + Sync {
    type Tx: ContactTx;

    /// Open a guarded section. Sections opened on the same store never interleave.
    fn begin(&self) -> impl Future<Output = Result<Self::Tx, StoreError>> + Send;
}

pub trait ContactTx: Send {
    /// Records whose email equals `email` OR whose phone number equals `phone_number`.
    fn find_by_email_or_phone(
        &mut self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> impl Future<Output = Result<Vec<ContactRecord>, StoreError>> + Send;

    /// Records whose id is in `ids` plus records linked to any of `ids`.
    fn find_by_ids_or_linked_ids(
        &mut self,
        ids: &BTreeSet<ContactId>,
    ) -> impl Future<Output = Result<Vec<ContactRecord>, StoreError>> + Send;

    fn insert(
        &mut self,
        contact: NewContact,
    ) -> impl Future<Output = Result<ContactRecord, StoreError>> + Send;

    /// Point `id` at `linked_id` as a secondary and bump its `updated_at`.
    fn update_to_secondary(
        &mut self,
        id: ContactId,
        linked_id: ContactId,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn commit(self) -> impl Future<Output = Result<(), StoreError>> + Send;
}
