use time::OffsetDateTime;

use crate::{Contact, ContactId, ContactStore, IdentityError, LinkPrecedence, NewContact};

/// Process-local [`ContactStore`] backed by a vector.
///
/// Resolution takes `&mut self`, so sharing one instance across threads needs an
/// outer `Mutex`; that lock is what serializes concurrent resolutions.
#[derive(Debug, Clone, Default)]
pub struct InMemoryContactStore {
    contacts: Vec<Contact>,
    last_id: i64,
    write_count: usize,
}

impl InMemoryContactStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a fully-formed contact as-is, keeping its id and timestamps.
    ///
    /// Seeded rows do not count as writes.
    ///
    /// # Errors
    /// Returns [`IdentityError::StoreUnavailable`] when the id is already taken.
    pub fn seed(&mut self, contact: Contact) -> Result<(), IdentityError> {
        if self.contacts.iter().any(|existing| existing.id == contact.id) {
            return Err(IdentityError::StoreUnavailable(format!(
                "contact id {} already exists",
                contact.id
            )));
        }
        self.last_id = self.last_id.max(contact.id.0);
        self.contacts.push(contact);
        Ok(())
    }

    #[must_use]
    pub fn contacts(&self) -> &[Contact] {
        &self.contacts
    }

    /// Number of inserts and link updates issued since construction.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.write_count
    }
}

impl ContactStore for InMemoryContactStore {
    fn find_by_email_or_phone(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Vec<Contact>, IdentityError> {
        Ok(self
            .contacts
            .iter()
            .filter(|contact| {
                let email_match = email.is_some() && contact.email.as_deref() == email;
                let phone_match =
                    phone_number.is_some() && contact.phone_number.as_deref() == phone_number;
                email_match || phone_match
            })
            .cloned()
            .collect())
    }

    fn find_by_linked_id(&self, primary_id: ContactId) -> Result<Vec<Contact>, IdentityError> {
        Ok(self
            .contacts
            .iter()
            .filter(|contact| contact.linked_id == Some(primary_id))
            .cloned()
            .collect())
    }

    fn get_by_id(&self, id: ContactId) -> Result<Option<Contact>, IdentityError> {
        Ok(self.contacts.iter().find(|contact| contact.id == id).cloned())
    }

    fn insert(&mut self, contact: NewContact) -> Result<Contact, IdentityError> {
        let now = OffsetDateTime::now_utc();
        self.last_id += 1;
        let stored = Contact {
            id: ContactId(self.last_id),
            email: contact.email,
            phone_number: contact.phone_number,
            linked_id: contact.linked_id,
            link_precedence: contact.link_precedence,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        self.contacts.push(stored.clone());
        self.write_count += 1;
        Ok(stored)
    }

    fn set_linked_id(
        &mut self,
        id: ContactId,
        linked_id: ContactId,
        link_precedence: LinkPrecedence,
    ) -> Result<(), IdentityError> {
        let Some(contact) = self.contacts.iter_mut().find(|contact| contact.id == id) else {
            return Err(IdentityError::StoreUnavailable(format!("contact {id} does not exist")));
        };
        contact.linked_id = Some(linked_id);
        contact.link_precedence = link_precedence;
        contact.updated_at = OffsetDateTime::now_utc();
        self.write_count += 1;
        Ok(())
    }
}
