use crate::types::{DeliveryId, OutboundMessage};
use anyhow::Result;
use async_trait::async_trait;
use sb_core::{Disconnect, InboundEvent, LinkedIdLookup, SessionLifecycle};
use std::sync::Arc;
use tokio::sync::mpsc;

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Unique channel identifier: "signal", "telegram".
    fn channel_id(&self) -> &str;

    /// Receive until the connection drops, pushing each normalized event to
    /// `tx`. Reports `lifecycle.on_connected()` once the platform answers.
    async fn run_session(
        &self,
        tx: &mpsc::Sender<InboundEvent>,
        lifecycle: &SessionLifecycle,
    ) -> Result<Disconnect>;

    /// Send a message to an already-resolved real address on this platform.
    async fn send(&self, recipient: &str, message: OutboundMessage) -> Result<DeliveryId>;

    /// The platform's own linked-id table, if it exposes one.
    fn linked_id_lookup(&self) -> Option<Arc<dyn LinkedIdLookup>> {
        None
    }
}
