use crate::traits::ChannelAdapter;
use async_trait::async_trait;
use sb_core::{Connection, Disconnect, InboundEvent, SessionLifecycle};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Runs an adapter's receive sessions under a `ConnectionSupervisor`.
pub struct AdapterConnection {
    adapter: Arc<dyn ChannelAdapter>,
    tx: mpsc::Sender<InboundEvent>,
}

impl AdapterConnection {
    pub fn new(adapter: Arc<dyn ChannelAdapter>, tx: mpsc::Sender<InboundEvent>) -> Self {
        Self { adapter, tx }
    }
}

#[async_trait]
impl Connection for AdapterConnection {
    fn name(&self) -> &str {
        self.adapter.channel_id()
    }

    async fn run_session(&self, lifecycle: &SessionLifecycle) -> anyhow::Result<Disconnect> {
        if self.tx.is_closed() {
            return Ok(Disconnect::terminal("inbound queue closed"));
        }
        let outcome = self.adapter.run_session(&self.tx, lifecycle).await;
        if self.tx.is_closed() {
            return Ok(Disconnect::terminal("inbound queue closed"));
        }
        outcome
    }
}
