//! Decides whether a group message addresses the bot.

use crate::address::{AddressScheme, digits};
use crate::config::RoutingConfig;
use crate::event::{InboundEvent, Participant};
use regex::{Regex, RegexBuilder};
use serde::Serialize;

const MIN_PHONE_DIGITS: usize = 5;

/// Which check confirmed the mention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MentionSource {
    Native,
    Pattern,
    PhoneNumber,
    ReplyToBot,
}

/// The bot's own identities on one platform, normalized.
#[derive(Debug, Clone, Default)]
pub struct BotIdentity {
    pub address: Option<String>,
    pub linked_id: Option<String>,
    pub phone: Option<String>,
}

impl BotIdentity {
    pub fn from_routing(scheme: &AddressScheme, cfg: &RoutingConfig) -> Self {
        let address = clean(cfg.self_address.as_deref()).map(|value| scheme.normalize(value));
        let linked_id = clean(cfg.self_linked_id.as_deref()).map(|value| scheme.normalize(value));
        let phone = clean(cfg.self_phone.as_deref())
            .map(|value| format!("+{}", digits(value)))
            .or_else(|| address.as_deref().and_then(|value| scheme.phone_of(value)));
        Self {
            address,
            linked_id,
            phone,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.address.is_none() && self.linked_id.is_none() && self.phone.is_none()
    }

    pub fn matches(&self, scheme: &AddressScheme, candidate: &str) -> bool {
        let normalized = scheme.normalize(candidate);
        if normalized.is_empty() {
            return false;
        }
        if self.address.as_deref() == Some(normalized.as_str())
            || self.linked_id.as_deref() == Some(normalized.as_str())
        {
            return true;
        }
        match (&self.phone, scheme.phone_of(&normalized)) {
            (Some(own), Some(theirs)) => *own == theirs,
            _ => false,
        }
    }

    pub fn matches_participant(&self, scheme: &AddressScheme, participant: &Participant) -> bool {
        self.matches(scheme, &participant.address)
            || participant
                .linked_id
                .as_deref()
                .is_some_and(|linked| self.matches(scheme, linked))
            || participant
                .phone
                .as_deref()
                .is_some_and(|phone| self.matches(scheme, phone))
    }
}

pub struct MentionDetector {
    scheme: AddressScheme,
    identity: BotIdentity,
    patterns: Vec<Regex>,
    self_chat_mode: bool,
}

impl MentionDetector {
    pub fn new(cfg: &RoutingConfig) -> Self {
        let scheme = AddressScheme::new(cfg.linked_domain.clone());
        let identity = BotIdentity::from_routing(&scheme, cfg);
        let patterns = compile_patterns(&cfg.mention_patterns);
        Self {
            scheme,
            identity,
            patterns,
            self_chat_mode: cfg.self_chat_mode,
        }
    }

    pub fn identity(&self) -> &BotIdentity {
        &self.identity
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    /// First check that confirms a mention, or `None`. A native mention list
    /// is authoritative: when present, the remaining checks are skipped.
    pub fn detect(&self, event: &InboundEvent) -> Option<MentionSource> {
        if !self.self_chat_mode {
            if let Some(native) = &event.native_mentions {
                let mentioned = native
                    .iter()
                    .any(|candidate| self.identity.matches(&self.scheme, candidate));
                return mentioned.then_some(MentionSource::Native);
            }
        }

        let text = strip_bidi_controls(&event.text);
        if self.patterns.iter().any(|pattern| pattern.is_match(&text)) {
            return Some(MentionSource::Pattern);
        }

        if let Some(phone) = &self.identity.phone {
            let own = digits(phone);
            if own.len() >= MIN_PHONE_DIGITS && digits(&text).contains(&own) {
                return Some(MentionSource::PhoneNumber);
            }
        }

        let replied_to_bot = event
            .reply_to_sender
            .as_ref()
            .is_some_and(|sender| self.identity.matches_participant(&self.scheme, sender));
        replied_to_bot.then_some(MentionSource::ReplyToBot)
    }
}

fn compile_patterns(patterns: &[String]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|pattern| {
            match RegexBuilder::new(pattern).case_insensitive(true).build() {
                Ok(regex) => Some(regex),
                Err(error) => {
                    tracing::warn!(%pattern, %error, "skipping invalid mention pattern");
                    None
                }
            }
        })
        .collect()
}

fn strip_bidi_controls(text: &str) -> String {
    text.chars()
        .filter(|ch| !matches!(ch, '\u{200e}' | '\u{200f}' | '\u{202a}'..='\u{202e}' | '\u{2066}'..='\u{2069}'))
        .collect()
}

fn clean(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::{MentionDetector, MentionSource};
    use crate::config::RoutingConfig;
    use crate::event::{Participant, fixtures};

    fn routing() -> RoutingConfig {
        RoutingConfig {
            self_address: Some("15550001111:4@s.whatsapp.net".to_string()),
            self_linked_id: Some("9001@lid".to_string()),
            mention_patterns: vec!["@?bot".to_string()],
            ..RoutingConfig::default()
        }
    }

    #[test]
    fn pattern_matches_case_insensitively() {
        let detector = MentionDetector::new(&routing());
        let event = fixtures::group("1", "g1", "+15552220000", "hey Bot, help");
        assert_eq!(detector.detect(&event), Some(MentionSource::Pattern));
    }

    #[test]
    fn native_mentions_of_someone_else_deny_without_fallthrough() {
        let detector = MentionDetector::new(&routing());
        let mut event = fixtures::group("1", "g1", "+15552220000", "bot please ask @carol");
        event.native_mentions = Some(vec!["15553334444@s.whatsapp.net".to_string()]);
        assert_eq!(detector.detect(&event), None);

        event.native_mentions = Some(vec!["9001:2@lid".to_string()]);
        assert_eq!(detector.detect(&event), Some(MentionSource::Native));
    }

    #[test]
    fn native_mention_by_phone_confirms() {
        let detector = MentionDetector::new(&routing());
        let mut event = fixtures::group("1", "g1", "+15552220000", "hello");
        event.native_mentions = Some(vec!["+15550001111".to_string()]);
        assert_eq!(detector.detect(&event), Some(MentionSource::Native));
    }

    #[test]
    fn self_chat_mode_ignores_native_mentions() {
        let cfg = RoutingConfig {
            self_chat_mode: true,
            ..routing()
        };
        let detector = MentionDetector::new(&cfg);
        let mut event = fixtures::group("1", "g1", "+15552220000", "what does bot think");
        event.native_mentions = Some(vec!["15553334444@s.whatsapp.net".to_string()]);
        assert_eq!(detector.detect(&event), Some(MentionSource::Pattern));
    }

    #[test]
    fn reply_to_a_bot_message_is_an_implicit_mention() {
        let detector = MentionDetector::new(&routing());
        let mut event = fixtures::group("1", "g1", "+15552220000", "sounds good");
        assert_eq!(detector.detect(&event), None);

        event.reply_to_sender = Some(Participant::new("9001@lid"));
        assert_eq!(detector.detect(&event), Some(MentionSource::ReplyToBot));

        event.reply_to_sender = Some(Participant::new("15553334444@s.whatsapp.net"));
        assert_eq!(detector.detect(&event), None);
    }

    #[test]
    fn phone_digits_in_text_count_as_mention() {
        let detector = MentionDetector::new(&RoutingConfig {
            mention_patterns: Vec::new(),
            ..routing()
        });
        let event = fixtures::group("1", "g1", "+15552220000", "ping +1 (555) 000-1111 please");
        assert_eq!(detector.detect(&event), Some(MentionSource::PhoneNumber));
    }

    #[test]
    fn numeric_bot_ids_are_not_treated_as_phone_numbers() {
        let cfg = RoutingConfig {
            self_address: Some("6123456789".to_string()),
            ..RoutingConfig::default()
        };
        let detector = MentionDetector::new(&cfg);
        assert_eq!(detector.identity().phone, None);
        let event = fixtures::group("1", "g1", "+15552220000", "order 6123456789 shipped");
        assert_eq!(detector.detect(&event), None);

        let mut mentioned = fixtures::group("2", "g1", "+15552220000", "@switchbot hi");
        mentioned.native_mentions = Some(vec!["6123456789".to_string()]);
        assert_eq!(detector.detect(&mentioned), Some(MentionSource::Native));
    }

    #[test]
    fn bidi_marks_do_not_hide_a_pattern() {
        let cfg = RoutingConfig {
            mention_patterns: vec!["^@bot\\b".to_string()],
            ..routing()
        };
        let detector = MentionDetector::new(&cfg);
        let event = fixtures::group("1", "g1", "+15552220000", "\u{200e}@bot status");
        assert_eq!(detector.detect(&event), Some(MentionSource::Pattern));
    }

    #[test]
    fn invalid_patterns_are_skipped() {
        let cfg = RoutingConfig {
            mention_patterns: vec!["(unclosed".to_string(), "bot".to_string()],
            ..routing()
        };
        let detector = MentionDetector::new(&cfg);
        assert_eq!(detector.pattern_count(), 1);
    }
}
