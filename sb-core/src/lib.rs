//! Reliability and identity-resolution layer for Switchboard channels.
//!
//! Everything between a raw platform event and the agent lives here:
//! duplicate suppression, burst debouncing, reconnect backoff, crash-safe
//! session persistence, and the identity / mention routing policy. The
//! components hold no global state; each adapter owns its own instances.

pub mod address;
pub mod backoff;
pub mod config;
pub mod credentials;
pub mod debounce;
pub mod dedupe;
pub mod error;
pub mod event;
pub mod gate;
pub mod identity;
pub mod mention;
pub mod reconnect;
pub mod supervisor;

pub use backoff::{BackoffPolicy, compute_backoff, compute_backoff_with_unit};
pub use config::{
    DebounceConfig, DedupeConfig, GroupEntry, ReconnectConfig, ReliabilityConfig, RoutingConfig,
};
pub use credentials::{CredentialSaveQueue, CredentialStore, RecoveryOutcome, restore_from_backup};
pub use debounce::{BatchHandler, Debouncer, Delivery};
pub use dedupe::DedupeCache;
pub use error::{CredentialError, IdentityError, SleepError};
pub use event::{ChannelId, InboundEvent, MessageId, Participant};
pub use gate::{GateDecision, GateReason, GroupGate};
pub use identity::{IdentityResolver, LinkedIdLookup};
pub use mention::{BotIdentity, MentionDetector, MentionSource};
pub use reconnect::{ReconnectManager, ReconnectPolicy, sleep_with_cancel};
pub use supervisor::{Connection, ConnectionSupervisor, Disconnect, SessionLifecycle, SupervisorExit};
