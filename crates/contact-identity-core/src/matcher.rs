use std::collections::BTreeSet;

use crate::{ContactId, ContactRecord, ContactTx, StoreError};

/// Resolve matched records to the deduplicated set of their cluster primaries.
#[must_use]
pub fn primary_ids_of(records: &[ContactRecord]) -> BTreeSet<ContactId> {
    records.iter().map(ContactRecord::cluster_id).collect()
}

/// Find the primaries of every cluster that references `email` or `phone_number`.
///
/// Empty attributes are ignored; with neither attribute present the store is
/// not queried and the result is empty.
///
/// # Errors
/// Returns the [`StoreError`] raised by the lookup.
pub async fn match_primary_ids<T: ContactTx>(
    tx: &mut T,
    email: Option<&str>,
    phone_number: Option<&str>,
) -> Result<BTreeSet<ContactId>, StoreError> {
    let email = email.filter(|value| !value.is_empty());
    let phone_number = phone_number.filter(|value| !value.is_empty());
    if email.is_none() && phone_number.is_none() {
        return Ok(BTreeSet::new());
    }

    let records = tx.find_by_email_or_phone(email, phone_number).await?;
    Ok(primary_ids_of(&records))
}

#[cfg(test)]
mod tests {
    use time::{Duration, OffsetDateTime};

    use super::*;
    use crate::{ContactStore, LinkPrecedence, MemoryContactStore};

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    fn record(
        id: i64,
        email: Option<&str>,
        phone_number: Option<&str>,
        precedence: LinkPrecedence,
    ) -> ContactRecord {
        ContactRecord {
            id: ContactId(id),
            email: email.map(str::to_string),
            phone_number: phone_number.map(str::to_string),
            precedence,
            created_at: fixture_time() + Duration::minutes(id),
            updated_at: fixture_time() + Duration::minutes(id),
            deleted_at: None,
        }
    }

    fn seeded_store() -> MemoryContactStore {
        MemoryContactStore::with_records(vec![
            record(1, Some("doc@hillvalley.edu"), Some("111"), LinkPrecedence::Primary),
            record(
                2,
                Some("emmett@hillvalley.edu"),
                Some("111"),
                LinkPrecedence::Secondary { linked_id: ContactId(1) },
            ),
            record(3, Some("marty@hillvalley.edu"), Some("222"), LinkPrecedence::Primary),
        ])
    }

    #[test]
    fn primary_ids_resolve_secondaries_to_their_link() {
        let records = vec![
            record(1, Some("a@x.com"), None, LinkPrecedence::Primary),
            record(2, None, Some("9"), LinkPrecedence::Secondary { linked_id: ContactId(1) }),
            record(5, None, Some("9"), LinkPrecedence::Primary),
        ];

        assert_eq!(primary_ids_of(&records), BTreeSet::from([ContactId(1), ContactId(5)]));
    }

    #[tokio::test]
    async fn match_uses_or_semantics_across_attributes() {
        let store = seeded_store();
        let mut tx = match store.begin().await {
            Ok(tx) => tx,
            Err(err) => panic!("begin should succeed: {err}"),
        };

        let matched =
            match match_primary_ids(&mut tx, Some("emmett@hillvalley.edu"), Some("222")).await {
                Ok(matched) => matched,
                Err(err) => panic!("match should succeed: {err}"),
            };
        assert_eq!(matched, BTreeSet::from([ContactId(1), ContactId(3)]));

        let matched = match match_primary_ids(&mut tx, None, Some("111")).await {
            Ok(matched) => matched,
            Err(err) => panic!("match should succeed: {err}"),
        };
        assert_eq!(matched, BTreeSet::from([ContactId(1)]));
    }

    #[tokio::test]
    async fn match_without_attributes_is_empty() {
        let store = seeded_store();
        let mut tx = match store.begin().await {
            Ok(tx) => tx,
            Err(err) => panic!("begin should succeed: {err}"),
        };

        let matched = match match_primary_ids(&mut tx, None, Some("")).await {
            Ok(matched) => matched,
            Err(err) => panic!("match should succeed: {err}"),
        };
        assert!(matched.is_empty());
    }
}
