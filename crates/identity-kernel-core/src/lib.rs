use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

mod in_memory;

pub use in_memory::InMemoryContactStore;

/// Rejection message surfaced when a request carries neither identifier.
pub const MISSING_IDENTIFIERS_MESSAGE: &str =
    "At least one of email or phoneNumber must be provided";

/// Hard ceiling on `linked_id` hops while walking to a primary.
const MAX_LINK_DEPTH: usize = 64;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum IdentityError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("inconsistent link at contact {contact_id}: {detail}")]
    InconsistentLink { contact_id: ContactId, detail: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct ContactId(pub i64);

impl Display for ContactId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LinkPrecedence {
    Primary,
    Secondary,
}

impl LinkPrecedence {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "primary" => Some(Self::Primary),
            "secondary" => Some(Self::Secondary),
            _ => None,
        }
    }
}

/// One observed (email, phone) pairing tied to an identity.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Contact {
    pub id: ContactId,
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub linked_id: Option<ContactId>,
    pub link_precedence: LinkPrecedence,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub deleted_at: Option<OffsetDateTime>,
}

impl Contact {
    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.link_precedence == LinkPrecedence::Primary
    }

    /// Creation order: `created_at` ascending, then id ascending.
    #[must_use]
    pub fn creation_cmp(&self, other: &Self) -> Ordering {
        self.created_at.cmp(&other.created_at).then_with(|| self.id.cmp(&other.id))
    }
}

/// Contact fields supplied by the resolver; the store assigns id and timestamps.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NewContact {
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub linked_id: Option<ContactId>,
    pub link_precedence: LinkPrecedence,
}

impl NewContact {
    #[must_use]
    pub fn primary(email: Option<&str>, phone_number: Option<&str>) -> Self {
        Self {
            email: email.map(str::to_string),
            phone_number: phone_number.map(str::to_string),
            linked_id: None,
            link_precedence: LinkPrecedence::Primary,
        }
    }

    #[must_use]
    pub fn secondary(
        email: Option<&str>,
        phone_number: Option<&str>,
        primary_id: ContactId,
    ) -> Self {
        Self {
            email: email.map(str::to_string),
            phone_number: phone_number.map(str::to_string),
            linked_id: Some(primary_id),
            link_precedence: LinkPrecedence::Secondary,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyRequest {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone_number: Option<String>,
}

impl IdentifyRequest {
    #[must_use]
    pub fn new(email: Option<&str>, phone_number: Option<&str>) -> Self {
        Self { email: email.map(str::to_string), phone_number: phone_number.map(str::to_string) }
    }

    /// Identifiers with blank values folded to `None`.
    ///
    /// # Errors
    /// Returns [`IdentityError::InvalidInput`] when neither identifier is present.
    pub fn identifiers(&self) -> Result<(Option<&str>, Option<&str>), IdentityError> {
        let email = self.email.as_deref().filter(|value| !value.is_empty());
        let phone_number = self.phone_number.as_deref().filter(|value| !value.is_empty());
        if email.is_none() && phone_number.is_none() {
            return Err(IdentityError::InvalidInput(MISSING_IDENTIFIERS_MESSAGE.to_string()));
        }
        Ok((email, phone_number))
    }
}

/// Consolidated view of one identity.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IdentityView {
    pub primary_contact_id: ContactId,
    pub emails: Vec<String>,
    pub phone_numbers: Vec<String>,
    pub secondary_contact_ids: Vec<ContactId>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionOutcome {
    CreatedPrimary,
    MatchedExisting,
    CreatedSecondary,
}

impl ResolutionOutcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CreatedPrimary => "created_primary",
            Self::MatchedExisting => "matched_existing",
            Self::CreatedSecondary => "created_secondary",
        }
    }
}

/// What to do when one request reaches more than one independent primary.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Answer with the oldest reachable primary and leave the other groups untouched.
    #[default]
    ReportOldest,
    /// Demote every younger primary under the oldest one and re-point its secondaries.
    Merge,
}

impl MergePolicy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReportOldest => "report_oldest",
            Self::Merge => "merge",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "report_oldest" | "report-oldest" => Some(Self::ReportOldest),
            "merge" => Some(Self::Merge),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ResolverConfig {
    #[serde(default)]
    pub merge_policy: MergePolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Resolution {
    pub outcome: ResolutionOutcome,
    pub view: IdentityView,
    pub created_contact_id: Option<ContactId>,
    #[serde(default)]
    pub merged_primary_ids: Vec<ContactId>,
}

/// Narrow storage interface the resolver depends on.
///
/// Implementations must give the caller exclusive access for the duration of
/// one resolution (a write transaction, a held lock, or `&mut` ownership).
pub trait ContactStore {
    /// Contacts whose email equals `email` OR whose phone equals `phone_number`.
    /// A `None` argument never matches.
    ///
    /// # Errors
    /// Returns [`IdentityError::StoreUnavailable`] when the read fails.
    fn find_by_email_or_phone(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Vec<Contact>, IdentityError>;

    /// Contacts whose `linked_id` equals `primary_id`. May include the primary itself.
    ///
    /// # Errors
    /// Returns [`IdentityError::StoreUnavailable`] when the read fails.
    fn find_by_linked_id(&self, primary_id: ContactId) -> Result<Vec<Contact>, IdentityError>;

    /// # Errors
    /// Returns [`IdentityError::StoreUnavailable`] when the read fails.
    fn get_by_id(&self, id: ContactId) -> Result<Option<Contact>, IdentityError>;

    /// Persist a contact, assigning id, `created_at`, and `updated_at`.
    ///
    /// # Errors
    /// Returns [`IdentityError::StoreUnavailable`] when the write fails.
    fn insert(&mut self, contact: NewContact) -> Result<Contact, IdentityError>;

    /// Re-point a contact's link and precedence, bumping `updated_at`.
    ///
    /// # Errors
    /// Returns [`IdentityError::StoreUnavailable`] when the write fails.
    fn set_linked_id(
        &mut self,
        id: ContactId,
        linked_id: ContactId,
        link_precedence: LinkPrecedence,
    ) -> Result<(), IdentityError>;
}

/// Map an observed (email, phone) pair onto an existing identity or create a new one.
///
/// # Errors
/// Returns [`IdentityError::InvalidInput`] before touching the store when both
/// identifiers are absent, [`IdentityError::StoreUnavailable`] for store failures,
/// and [`IdentityError::InconsistentLink`] when a matched contact cannot be
/// walked back to a primary.
pub fn resolve<S>(
    store: &mut S,
    request: &IdentifyRequest,
    config: &ResolverConfig,
) -> Result<Resolution, IdentityError>
where
    S: ContactStore + ?Sized,
{
    let (email, phone_number) = request.identifiers()?;
    let matched = store.find_by_email_or_phone(email, phone_number)?;

    let Some(candidate) = matched.iter().min_by(|lhs, rhs| lhs.creation_cmp(rhs)) else {
        return create_primary(store, email, phone_number);
    };
    tracing::debug!(
        matched = matched.len(),
        candidate = %candidate.id,
        "request matched existing contacts"
    );

    let (primary, merged_primary_ids) = match config.merge_policy {
        MergePolicy::ReportOldest => (resolve_primary(store, candidate)?, Vec::new()),
        MergePolicy::Merge => merge_matched_groups(store, candidate, &matched)?,
    };

    let mut secondaries = load_secondaries(store, &primary)?;
    let known = KnownIdentifiers::collect(
        matched.iter().chain(std::iter::once(&primary)).chain(secondaries.iter()),
    );

    if !known.covers(email, phone_number) {
        let created = store.insert(NewContact::secondary(email, phone_number, primary.id))?;
        tracing::info!(
            contact_id = %created.id,
            primary_contact_id = %primary.id,
            "created secondary contact"
        );
        let created_contact_id = created.id;
        secondaries.push(created);
        return Ok(Resolution {
            outcome: ResolutionOutcome::CreatedSecondary,
            view: consolidate(&primary, &secondaries),
            created_contact_id: Some(created_contact_id),
            merged_primary_ids,
        });
    }

    Ok(Resolution {
        outcome: ResolutionOutcome::MatchedExisting,
        view: consolidate(&primary, &secondaries),
        created_contact_id: None,
        merged_primary_ids,
    })
}

/// Read-only consolidated view of the identity that contains `contact_id`.
///
/// # Errors
/// Returns [`IdentityError::StoreUnavailable`] for store failures and
/// [`IdentityError::InconsistentLink`] when the contact's chain is broken.
pub fn identity_view<S>(
    store: &S,
    contact_id: ContactId,
) -> Result<Option<IdentityView>, IdentityError>
where
    S: ContactStore + ?Sized,
{
    let Some(contact) = store.get_by_id(contact_id)? else {
        return Ok(None);
    };
    let primary = resolve_primary(store, &contact)?;
    let secondaries = load_secondaries(store, &primary)?;
    Ok(Some(consolidate(&primary, &secondaries)))
}

/// Walk `linked_id` from `start` until a primary is reached.
///
/// # Errors
/// Returns [`IdentityError::InconsistentLink`] for a secondary without a link, a
/// link to a missing contact, a cycle, or a chain deeper than the walk allows.
pub fn resolve_primary<S>(store: &S, start: &Contact) -> Result<Contact, IdentityError>
where
    S: ContactStore + ?Sized,
{
    let mut current = start.clone();
    let mut visited = BTreeSet::new();

    loop {
        if current.is_primary() {
            return Ok(current);
        }
        if !visited.insert(current.id) {
            return Err(IdentityError::InconsistentLink {
                contact_id: start.id,
                detail: format!("link cycle detected at contact {}", current.id),
            });
        }
        if visited.len() > MAX_LINK_DEPTH {
            return Err(IdentityError::InconsistentLink {
                contact_id: start.id,
                detail: format!("link chain exceeds {MAX_LINK_DEPTH} hops"),
            });
        }

        let Some(parent_id) = current.linked_id else {
            return Err(IdentityError::InconsistentLink {
                contact_id: current.id,
                detail: "secondary contact has no linked_id".to_string(),
            });
        };
        current = store.get_by_id(parent_id)?.ok_or_else(|| IdentityError::InconsistentLink {
            contact_id: current.id,
            detail: format!("linked_id {parent_id} does not resolve to a stored contact"),
        })?;
    }
}

fn create_primary<S>(
    store: &mut S,
    email: Option<&str>,
    phone_number: Option<&str>,
) -> Result<Resolution, IdentityError>
where
    S: ContactStore + ?Sized,
{
    let mut created = store.insert(NewContact::primary(email, phone_number))?;
    store.set_linked_id(created.id, created.id, LinkPrecedence::Primary)?;
    created.linked_id = Some(created.id);
    tracing::info!(contact_id = %created.id, "created primary contact");

    Ok(Resolution {
        outcome: ResolutionOutcome::CreatedPrimary,
        view: consolidate(&created, &[]),
        created_contact_id: Some(created.id),
        merged_primary_ids: Vec::new(),
    })
}

fn merge_matched_groups<S>(
    store: &mut S,
    candidate: &Contact,
    matched: &[Contact],
) -> Result<(Contact, Vec<ContactId>), IdentityError>
where
    S: ContactStore + ?Sized,
{
    let mut winner = resolve_primary(store, candidate)?;
    let mut roots: BTreeMap<ContactId, Contact> = BTreeMap::new();
    for contact in matched {
        let root = resolve_primary(store, contact)?;
        if root.creation_cmp(&winner) == Ordering::Less {
            winner = root.clone();
        }
        roots.entry(root.id).or_insert(root);
    }

    let mut demoted_roots =
        roots.into_values().filter(|root| root.id != winner.id).collect::<Vec<_>>();
    demoted_roots.sort_by(Contact::creation_cmp);

    let mut merged = Vec::new();
    for demoted in demoted_roots {
        for member in group_members(store, &demoted)? {
            store.set_linked_id(member.id, winner.id, LinkPrecedence::Secondary)?;
        }
        store.set_linked_id(demoted.id, winner.id, LinkPrecedence::Secondary)?;
        tracing::info!(
            demoted_contact_id = %demoted.id,
            primary_contact_id = %winner.id,
            "merged identity group under older primary"
        );
        merged.push(demoted.id);
    }

    Ok((winner, merged))
}

/// Every contact that reaches `root` through `linked_id`, at any depth, excluding `root`.
fn group_members<S>(store: &S, root: &Contact) -> Result<Vec<Contact>, IdentityError>
where
    S: ContactStore + ?Sized,
{
    let mut visited = BTreeSet::from([root.id]);
    let mut members = Vec::new();
    let mut frontier = vec![root.id];

    for _ in 0..=MAX_LINK_DEPTH {
        let mut next = Vec::new();
        for parent_id in frontier {
            for child in store.find_by_linked_id(parent_id)? {
                if visited.insert(child.id) {
                    next.push(child.id);
                    members.push(child);
                }
            }
        }
        if next.is_empty() {
            return Ok(members);
        }
        frontier = next;
    }

    Err(IdentityError::InconsistentLink {
        contact_id: root.id,
        detail: format!("identity group is deeper than {MAX_LINK_DEPTH} hops"),
    })
}

fn load_secondaries<S>(store: &S, primary: &Contact) -> Result<Vec<Contact>, IdentityError>
where
    S: ContactStore + ?Sized,
{
    let mut secondaries = group_members(store, primary)?;
    secondaries.sort_by(Contact::creation_cmp);
    Ok(secondaries)
}

struct KnownIdentifiers<'a> {
    emails: BTreeSet<&'a str>,
    phone_numbers: BTreeSet<&'a str>,
}

impl<'a> KnownIdentifiers<'a> {
    fn collect(contacts: impl Iterator<Item = &'a Contact>) -> Self {
        let mut emails = BTreeSet::new();
        let mut phone_numbers = BTreeSet::new();
        for contact in contacts {
            if let Some(email) = contact.email.as_deref() {
                emails.insert(email);
            }
            if let Some(phone_number) = contact.phone_number.as_deref() {
                phone_numbers.insert(phone_number);
            }
        }
        Self { emails, phone_numbers }
    }

    fn covers(&self, email: Option<&str>, phone_number: Option<&str>) -> bool {
        email.map_or(true, |value| self.emails.contains(value))
            && phone_number.map_or(true, |value| self.phone_numbers.contains(value))
    }
}

fn consolidate(primary: &Contact, secondaries: &[Contact]) -> IdentityView {
    let mut emails: Vec<String> = Vec::new();
    let mut phone_numbers: Vec<String> = Vec::new();

    for contact in std::iter::once(primary).chain(secondaries) {
        if let Some(email) = contact.email.as_deref() {
            if !emails.iter().any(|known| known == email) {
                emails.push(email.to_string());
            }
        }
        if let Some(phone_number) = contact.phone_number.as_deref() {
            if !phone_numbers.iter().any(|known| known == phone_number) {
                phone_numbers.push(phone_number.to_string());
            }
        }
    }

    IdentityView {
        primary_contact_id: primary.id,
        emails,
        phone_numbers,
        secondary_contact_ids: secondaries.iter().map(|contact| contact.id).collect(),
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LinkViolationKind {
    PrimaryNotSelfLinked,
    SecondaryWithoutLink,
    DanglingLink,
    LinkedToSecondary,
    PrimaryYoungerThanSecondary,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LinkViolation {
    pub contact_id: ContactId,
    pub kind: LinkViolationKind,
    pub detail: String,
}

/// Check the link invariants across a full set of contacts.
///
/// Violations are ordered by contact id, then kind.
#[must_use]
pub fn link_violations(contacts: &[Contact]) -> Vec<LinkViolation> {
    let by_id = contacts.iter().map(|contact| (contact.id, contact)).collect::<BTreeMap<_, _>>();
    let mut violations = Vec::new();

    for contact in contacts {
        match (contact.link_precedence, contact.linked_id) {
            (LinkPrecedence::Primary, Some(linked_id)) if linked_id == contact.id => {}
            (LinkPrecedence::Primary, linked_id) => violations.push(LinkViolation {
                contact_id: contact.id,
                kind: LinkViolationKind::PrimaryNotSelfLinked,
                detail: match linked_id {
                    Some(linked_id) => format!("primary links to {linked_id}"),
                    None => "primary has no linked_id".to_string(),
                },
            }),
            (LinkPrecedence::Secondary, None) => violations.push(LinkViolation {
                contact_id: contact.id,
                kind: LinkViolationKind::SecondaryWithoutLink,
                detail: "secondary has no linked_id".to_string(),
            }),
            (LinkPrecedence::Secondary, Some(linked_id)) => match by_id.get(&linked_id) {
                None => violations.push(LinkViolation {
                    contact_id: contact.id,
                    kind: LinkViolationKind::DanglingLink,
                    detail: format!("linked_id {linked_id} does not exist"),
                }),
                Some(parent) if !parent.is_primary() => violations.push(LinkViolation {
                    contact_id: contact.id,
                    kind: LinkViolationKind::LinkedToSecondary,
                    detail: format!("linked_id {linked_id} is a secondary contact"),
                }),
                Some(parent) if parent.creation_cmp(contact) == Ordering::Greater => {
                    violations.push(LinkViolation {
                        contact_id: contact.id,
                        kind: LinkViolationKind::PrimaryYoungerThanSecondary,
                        detail: format!("primary {linked_id} was created after this secondary"),
                    });
                }
                Some(_) => {}
            },
        }
    }

    violations.sort_by(|lhs, rhs| {
        lhs.contact_id.cmp(&rhs.contact_id).then_with(|| lhs.kind.cmp(&rhs.kind))
    });
    violations
}
