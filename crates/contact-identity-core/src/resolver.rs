use std::collections::BTreeSet;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    match_primary_ids, ClusterView, ContactId, ContactRecord, ContactStore, ContactTx,
    IdentifyRequest, IdentityError, LinkPrecedence, NewContact, Observation,
};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentifyPolicy {
    /// Total tries for one identify call; retryable storage conflicts consume one each.
    pub max_attempts: u32,
}

impl Default for IdentifyPolicy {
    fn default() -> Self {
        Self { max_attempts: DEFAULT_MAX_ATTEMPTS }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionOutcome {
    Created,
    Merged,
    Extended,
    Unchanged,
}

impl ResolutionOutcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Merged => "merged",
            Self::Extended => "extended",
            Self::Unchanged => "unchanged",
        }
    }
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct Resolution {
    pub view: ClusterView,
    /// Primary inserted because nothing matched.
    pub created_primary: Option<ContactId>,
    /// Secondary inserted because the observation carried new information.
    pub appended_secondary: Option<ContactId>,
    /// Former primaries folded under the survivor.
    pub demoted: Vec<ContactId>,
    /// Secondaries of demoted primaries re-pointed at the survivor.
    pub relinked: Vec<ContactId>,
}

impl Resolution {
    #[must_use]
    pub fn outcome(&self) -> ResolutionOutcome {
        if self.created_primary.is_some() {
            ResolutionOutcome::Created
        } else if !self.demoted.is_empty() {
            ResolutionOutcome::Merged
        } else if self.appended_secondary.is_some() {
            ResolutionOutcome::Extended
        } else {
            ResolutionOutcome::Unchanged
        }
    }
}

/// Pick the surviving primary: earliest `created_at`, lowest id on ties.
#[must_use]
pub fn select_survivor(members: &[ContactRecord]) -> Option<&ContactRecord> {
    members.iter().filter(|member| member.is_primary()).min_by_key(|member| member.seniority())
}

/// Project a cluster into its response view.
///
/// The survivor's own attributes lead their lists; everything else follows in
/// seniority order with duplicates and empty values dropped.
#[must_use]
pub fn project_cluster(survivor: &ContactRecord, members: &[ContactRecord]) -> ClusterView {
    let mut others = members.iter().filter(|member| member.id != survivor.id).collect::<Vec<_>>();
    others.sort_by_key(|member| member.seniority());

    let ordered = std::iter::once(survivor).chain(others.iter().copied()).collect::<Vec<_>>();

    ClusterView {
        primary_contact_id: survivor.id,
        emails: distinct_values(&ordered, |member| member.email.as_deref()),
        phone_numbers: distinct_values(&ordered, |member| member.phone_number.as_deref()),
        secondary_contact_ids: others.iter().map(|member| member.id).collect(),
    }
}

fn distinct_values<'a>(
    ordered: &[&'a ContactRecord],
    field: impl Fn(&'a ContactRecord) -> Option<&'a str>,
) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut values = Vec::new();
    for value in ordered.iter().copied().filter_map(&field) {
        if !value.is_empty() && seen.insert(value) {
            values.push(value.to_string());
        }
    }
    values
}

fn check_matched_roots(
    matched: &BTreeSet<ContactId>,
    members: &[ContactRecord],
) -> Result<(), IdentityError> {
    for id in matched {
        match members.iter().find(|member| member.id == *id) {
            Some(member) if member.is_primary() => {}
            Some(_) => {
                return Err(IdentityError::Inconsistent(format!(
                    "cluster root {id} is referenced as a primary but is a secondary"
                )));
            }
            None => {
                return Err(IdentityError::Inconsistent(format!(
                    "cluster root {id} is referenced but does not exist"
                )));
            }
        }
    }
    Ok(())
}

fn check_flat_cluster(
    survivor_id: ContactId,
    members: &[ContactRecord],
) -> Result<ContactRecord, IdentityError> {
    let mut survivor = None;
    for member in members {
        match member.precedence {
            LinkPrecedence::Primary if member.id == survivor_id => survivor = Some(member.clone()),
            LinkPrecedence::Primary => {
                return Err(IdentityError::Inconsistent(format!(
                    "cluster {survivor_id} still holds a second primary {}",
                    member.id
                )));
            }
            LinkPrecedence::Secondary { linked_id } if linked_id == survivor_id => {}
            LinkPrecedence::Secondary { linked_id } => {
                return Err(IdentityError::Inconsistent(format!(
                    "contact {} in cluster {survivor_id} links to {linked_id}",
                    member.id
                )));
            }
        }
    }

    survivor.ok_or_else(|| {
        IdentityError::Inconsistent(format!("cluster {survivor_id} has no primary record"))
    })
}

/// Fold every member under `survivor`, returning (demoted primaries, relinked secondaries).
async fn fold_into_survivor<T: ContactTx>(
    tx: &mut T,
    survivor_id: ContactId,
    members: &mut [ContactRecord],
) -> Result<(Vec<ContactId>, Vec<ContactId>), IdentityError> {
    let mut demoted = Vec::new();
    let mut relinked = Vec::new();

    for member in members.iter_mut() {
        if member.id == survivor_id {
            continue;
        }
        match member.precedence {
            LinkPrecedence::Primary => demoted.push(member.id),
            LinkPrecedence::Secondary { linked_id } if linked_id != survivor_id => {
                relinked.push(member.id);
            }
            LinkPrecedence::Secondary { .. } => continue,
        }
        tx.update_to_secondary(member.id, survivor_id).await?;
        member.precedence = LinkPrecedence::Secondary { linked_id: survivor_id };
    }

    Ok((demoted, relinked))
}

fn carries_new_information(observation: &Observation, members: &[ContactRecord]) -> bool {
    let new_email = observation
        .email()
        .is_some_and(|email| !members.iter().any(|member| member.email.as_deref() == Some(email)));
    let new_phone = observation.phone_number().is_some_and(|phone| {
        !members.iter().any(|member| member.phone_number.as_deref() == Some(phone))
    });
    new_email || new_phone
}

/// Resolve one observation against the clusters it matched.
///
/// With no match a new primary is created. Otherwise the implicated clusters
/// are merged under their most senior primary, a secondary is appended when
/// the observation adds an unseen email or phone number, and the resulting
/// cluster is re-read and projected.
///
/// # Errors
/// Returns [`IdentityError::Storage`] when any store operation fails, and
/// [`IdentityError::Inconsistent`] when a loaded cluster violates the
/// one-primary, depth-one shape.
pub async fn resolve<T: ContactTx>(
    tx: &mut T,
    observation: &Observation,
    matched: &BTreeSet<ContactId>,
) -> Result<Resolution, IdentityError> {
    if matched.is_empty() {
        let record = tx.insert(NewContact::primary(observation)).await?;
        return Ok(Resolution {
            view: project_cluster(&record, std::slice::from_ref(&record)),
            created_primary: Some(record.id),
            appended_secondary: None,
            demoted: Vec::new(),
            relinked: Vec::new(),
        });
    }

    let mut members = tx.find_by_ids_or_linked_ids(matched).await?;
    members.sort_by_key(ContactRecord::seniority);
    check_matched_roots(matched, &members)?;

    let survivor_id = select_survivor(&members)
        .map(|survivor| survivor.id)
        .ok_or_else(|| IdentityError::Inconsistent("matched clusters hold no primary".to_string()))?;
    debug!(survivor = %survivor_id, clusters = matched.len(), "selected surviving primary");

    let (demoted, relinked) = fold_into_survivor(tx, survivor_id, &mut members).await?;

    let appended_secondary = if carries_new_information(observation, &members) {
        let record = tx.insert(NewContact::secondary(observation, survivor_id)).await?;
        Some(record.id)
    } else {
        None
    };

    if appended_secondary.is_some() || !demoted.is_empty() || !relinked.is_empty() {
        members = tx.find_by_ids_or_linked_ids(&BTreeSet::from([survivor_id])).await?;
    }
    let survivor = check_flat_cluster(survivor_id, &members)?;

    Ok(Resolution {
        view: project_cluster(&survivor, &members),
        created_primary: None,
        appended_secondary,
        demoted,
        relinked,
    })
}

async fn identify_once<S: ContactStore>(
    store: &S,
    observation: &Observation,
) -> Result<Resolution, IdentityError> {
    let mut tx = store.begin().await?;
    let matched =
        match_primary_ids(&mut tx, observation.email(), observation.phone_number()).await?;
    let resolution = resolve(&mut tx, observation, &matched).await?;
    tx.commit().await?;
    Ok(resolution)
}

/// Validate a request and resolve it inside one guarded section.
///
/// Retryable storage conflicts re-run the whole match and resolve sequence, up
/// to `policy.max_attempts` tries in total.
///
/// # Errors
/// Returns [`IdentityError::Validation`] for a request without attributes
/// (the store is never touched), the last storage error once retries are
/// exhausted, or [`IdentityError::Inconsistent`] for a corrupt cluster.
pub async fn identify<S: ContactStore>(
    store: &S,
    request: &IdentifyRequest,
    policy: IdentifyPolicy,
) -> Result<Resolution, IdentityError> {
    let observation = request.validate()?;
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match identify_once(store, &observation).await {
            Ok(resolution) => {
                info!(
                    outcome = resolution.outcome().as_str(),
                    primary = %resolution.view.primary_contact_id,
                    secondaries = resolution.view.secondary_contact_ids.len(),
                    attempt,
                    "identify resolved"
                );
                return Ok(resolution);
            }
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                warn!(
                    attempt,
                    max_attempts,
                    error = %err,
                    "identify hit a storage conflict; retrying"
                );
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
