//! Contact lookups used at send time.
//!
//! Contacts live in the platform's contact store; the engine only needs to
//! know whether a contact can still be mailed and what to merge into the
//! message. [`InMemoryContacts`] backs development runs and tests.

use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashMap;
use drip_core::SequencerResult;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: Uuid,
    pub client_id: Uuid,
    pub email: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub unsubscribed: bool,
}

impl Contact {
    pub fn new(client_id: Uuid, email: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            client_id,
            email: email.into(),
            first_name: None,
            last_name: None,
            company: None,
            tags: Vec::new(),
            unsubscribed: false,
        }
    }

    pub fn full_name(&self) -> Option<String> {
        match (&self.first_name, &self.last_name) {
            (Some(first), Some(last)) => Some(format!("{} {}", first, last)),
            (Some(first), None) => Some(first.clone()),
            (None, Some(last)) => Some(last.clone()),
            (None, None) => None,
        }
    }

    /// Variables available to `{{...}}` merge tags.
    pub fn merge_vars(&self) -> HashMap<String, String> {
        let mut vars = HashMap::new();
        vars.insert("email".to_string(), self.email.clone());
        let optional = [
            ("first_name", self.first_name.clone()),
            ("last_name", self.last_name.clone()),
            ("full_name", self.full_name()),
            ("company", self.company.clone()),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                vars.insert(key.to_string(), value);
            }
        }
        vars
    }
}

#[async_trait]
pub trait ContactDirectory: Send + Sync {
    /// `None` when the contact has been deleted.
    async fn get_contact(&self, contact_id: &Uuid) -> SequencerResult<Option<Contact>>;

    /// Deleted contacts count as unsubscribed.
    async fn is_unsubscribed(&self, contact_id: &Uuid) -> SequencerResult<bool> {
        Ok(self
            .get_contact(contact_id)
            .await?
            .map_or(true, |c| c.unsubscribed))
    }
}

#[derive(Default)]
pub struct InMemoryContacts {
    contacts: DashMap<Uuid, Contact>,
}

impl InMemoryContacts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, contact: Contact) {
        self.contacts.insert(contact.id, contact);
    }

    pub fn remove(&self, contact_id: &Uuid) -> Option<Contact> {
        self.contacts.remove(contact_id).map(|(_, c)| c)
    }

    pub fn set_unsubscribed(&self, contact_id: &Uuid, unsubscribed: bool) -> bool {
        match self.contacts.get_mut(contact_id) {
            Some(mut contact) => {
                contact.unsubscribed = unsubscribed;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }
}

#[async_trait]
impl ContactDirectory for InMemoryContacts {
    async fn get_contact(&self, contact_id: &Uuid) -> SequencerResult<Option<Contact>> {
        Ok(self.contacts.get(contact_id).map(|c| c.clone()))
    }
}
