//! Address syntax shared by every channel: `user[:device]@domain`, or a bare
//! routable id (phone number, chat id) with no domain at all.

use crate::config::default_linked_domain;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressScheme {
    linked_domain: String,
}

impl Default for AddressScheme {
    fn default() -> Self {
        Self::new(default_linked_domain())
    }
}

impl AddressScheme {
    pub fn new(linked_domain: impl Into<String>) -> Self {
        let linked_domain = linked_domain.into().trim().to_ascii_lowercase();
        Self { linked_domain }
    }

    pub fn linked_domain(&self) -> &str {
        &self.linked_domain
    }

    /// Trims, lowercases the domain, and drops any `:device` suffix from the
    /// user part.
    pub fn normalize(&self, address: &str) -> String {
        normalize_address(address)
    }

    pub fn is_linked(&self, address: &str) -> bool {
        !self.linked_domain.is_empty()
            && domain_of(address).is_some_and(|domain| domain == self.linked_domain)
    }

    /// Renders a linked identifier for a bare id, e.g. `abc` -> `abc@lid`.
    pub fn linked(&self, id: &str) -> String {
        format!("{}@{}", id.trim(), self.linked_domain)
    }

    /// E.164 phone form of a real address. A bare address counts only when
    /// it carries the leading `+`, so numeric platform ids (Telegram chat and
    /// bot ids) are never read as phone numbers. Linked identifiers never
    /// yield a phone number even if numeric.
    pub fn phone_of(&self, address: &str) -> Option<String> {
        if self.is_linked(address) {
            return None;
        }
        let normalized = normalize_address(address);
        let (user, has_domain) = match normalized.split_once('@') {
            Some((user, _)) => (user, true),
            None => (normalized.as_str(), false),
        };
        let number = match user.strip_prefix('+') {
            Some(number) => number,
            None if has_domain => user,
            None => return None,
        };
        if number.len() < 5 || !number.chars().all(|ch| ch.is_ascii_digit()) {
            return None;
        }
        Some(format!("+{number}"))
    }
}

pub fn normalize_address(address: &str) -> String {
    let trimmed = address.trim();
    match trimmed.split_once('@') {
        Some((user, domain)) => {
            let user = user.split_once(':').map(|(bare, _)| bare).unwrap_or(user);
            format!("{}@{}", user, domain.to_ascii_lowercase())
        }
        None => trimmed.to_string(),
    }
}

fn domain_of(address: &str) -> Option<String> {
    address
        .trim()
        .rsplit_once('@')
        .map(|(_, domain)| domain.to_ascii_lowercase())
        .filter(|domain| !domain.is_empty())
}

pub fn digits(text: &str) -> String {
    text.chars().filter(|ch| ch.is_ascii_digit()).collect()
}
