//! Linked-identifier resolution for outbound sends.
//!
//! Sending to a linked identifier requires its real address. Resolution
//! never guesses: an identifier with no known mapping fails the send.

use crate::address::AddressScheme;
use crate::config::RoutingConfig;
use crate::error::IdentityError;
use crate::event::Participant;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

/// Mapping table maintained by the transport itself, if it keeps one.
#[async_trait]
pub trait LinkedIdLookup: Send + Sync {
    async fn real_address_for(&self, linked_id: &str) -> Option<String>;
}

pub struct IdentityResolver {
    scheme: AddressScheme,
    self_address: Option<String>,
    self_linked_id: Option<String>,
    native: Option<Arc<dyn LinkedIdLookup>>,
    // linked id -> real address, learned from inbound traffic.
    observed: DashMap<String, String>,
}

impl IdentityResolver {
    pub fn new(scheme: AddressScheme) -> Self {
        Self {
            scheme,
            self_address: None,
            self_linked_id: None,
            native: None,
            observed: DashMap::new(),
        }
    }

    pub fn from_routing(cfg: &RoutingConfig) -> Self {
        Self::new(AddressScheme::new(cfg.linked_domain.clone()))
            .with_self_identity(cfg.self_address.as_deref(), cfg.self_linked_id.as_deref())
    }

    pub fn with_self_identity(mut self, address: Option<&str>, linked_id: Option<&str>) -> Self {
        self.self_address = non_empty(address).map(|value| self.scheme.normalize(value));
        self.self_linked_id = non_empty(linked_id).map(|value| self.scheme.normalize(value));
        self
    }

    pub fn with_native_lookup(mut self, lookup: Arc<dyn LinkedIdLookup>) -> Self {
        self.native = Some(lookup);
        self
    }

    pub fn scheme(&self) -> &AddressScheme {
        &self.scheme
    }

    /// Records that `linked_id` belongs to `real_address`. Pairs that are not
    /// (linked, real) are ignored. Returns whether the table changed.
    pub fn observe(&self, linked_id: &str, real_address: &str) -> bool {
        let linked = self.scheme.normalize(linked_id);
        let real = self.scheme.normalize(real_address);
        if linked.is_empty() || real.is_empty() {
            return false;
        }
        if !self.scheme.is_linked(&linked) || self.scheme.is_linked(&real) {
            return false;
        }
        match self.observed.insert(linked.clone(), real.clone()) {
            Some(previous) if previous == real => false,
            Some(previous) => {
                tracing::warn!(
                    linked_id = %linked,
                    previous = %previous,
                    current = %real,
                    "linked identifier remapped"
                );
                true
            }
            None => {
                tracing::debug!(linked_id = %linked, real_address = %real, "learned linked identifier");
                true
            }
        }
    }

    /// Learns from a participant that disclosed both of its identities.
    pub fn observe_participant(&self, participant: &Participant) -> bool {
        let Some(linked_id) = participant.linked_id.as_deref() else {
            return false;
        };
        if !self.scheme.is_linked(&participant.address) {
            return self.observe(linked_id, &participant.address);
        }
        match participant.phone.as_deref() {
            Some(phone) => self.observe(linked_id, phone),
            None => false,
        }
    }

    pub fn observed(&self, linked_id: &str) -> Option<String> {
        self.observed
            .get(&self.scheme.normalize(linked_id))
            .map(|entry| entry.value().clone())
    }

    pub fn observed_len(&self) -> usize {
        self.observed.len()
    }

    pub fn clear(&self) {
        self.observed.clear();
    }

    /// Real address to send to. Non-linked addresses pass through as given.
    pub async fn resolve(&self, address: &str) -> Result<String, IdentityError> {
        let trimmed = address.trim();
        if trimmed.is_empty() {
            return Err(IdentityError::EmptyAddress);
        }
        if !self.scheme.is_linked(trimmed) {
            return Ok(trimmed.to_string());
        }
        let linked = self.scheme.normalize(trimmed);

        if self.self_linked_id.as_deref() == Some(linked.as_str()) {
            if let Some(self_address) = &self.self_address {
                return Ok(self_address.clone());
            }
        }

        if let Some(native) = &self.native {
            if let Some(real) = native.real_address_for(&linked).await {
                let real = self.scheme.normalize(&real);
                if !real.is_empty() && !self.scheme.is_linked(&real) {
                    return Ok(real);
                }
                tracing::warn!(linked_id = %linked, "native mapping returned a non-routable address");
            }
        }

        if let Some(real) = self.observed(&linked) {
            return Ok(real);
        }

        tracing::warn!(linked_id = %linked, "refusing to send to unresolved linked identifier");
        Err(IdentityError::Unresolvable(linked))
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}
