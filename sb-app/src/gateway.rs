//! Relay gateway: every adapter feeds one inbound queue; each channel owns a
//! private pipeline of dedupe, identity learning, gating, and debouncing in
//! front of the agent.

use crate::agent::{AgentBatch, AgentDispatch};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use sb_channels::{ChannelAdapter, OutboundMessage};
use sb_core::{
    BatchHandler, DebounceConfig, DedupeCache, Debouncer, GateReason, GroupGate,
    IdentityResolver, InboundEvent, ReliabilityConfig, RoutingConfig,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Duplicate,
    Gated(GateReason),
    Queued,
}

pub struct ChannelPipeline {
    dedupe: Mutex<DedupeCache>,
    resolver: Arc<IdentityResolver>,
    gate: GroupGate,
    debouncer: Debouncer<InboundEvent>,
}

impl ChannelPipeline {
    pub fn new(
        adapter: Arc<dyn ChannelAdapter>,
        routing: &RoutingConfig,
        reliability: &ReliabilityConfig,
        agent: Arc<dyn AgentDispatch>,
    ) -> Self {
        let mut resolver = IdentityResolver::from_routing(routing);
        if let Some(lookup) = adapter.linked_id_lookup() {
            resolver = resolver.with_native_lookup(lookup);
        }
        let resolver = Arc::new(resolver);
        let router = Arc::new(ReplyRouter {
            adapter,
            resolver: resolver.clone(),
            agent,
        });
        Self {
            dedupe: Mutex::new(DedupeCache::from_config(&reliability.dedupe)),
            resolver,
            gate: GroupGate::new(routing),
            debouncer: build_debouncer(&reliability.debounce, router),
        }
    }

    /// Runs one event through dedupe, identity learning, and the group gate,
    /// then hands it to the debouncer without waiting for delivery.
    pub fn accept(&self, event: InboundEvent) -> Admission {
        let key = event.dedupe_key();
        let duplicate = self
            .dedupe
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .check(&key);
        if duplicate {
            tracing::debug!(dedupe_key = %key, "dropping duplicate event");
            return Admission::Duplicate;
        }

        self.resolver.observe_participant(&event.sender);
        if let Some(quoted) = &event.reply_to_sender {
            self.resolver.observe_participant(quoted);
        }

        let decision = self.gate.evaluate(&event);
        if let (false, Some(reason)) = (decision.should_process, decision.reason) {
            tracing::debug!(
                channel = %event.channel,
                conversation = %event.conversation_key,
                reason = %reason,
                "event gated"
            );
            return Admission::Gated(reason);
        }
        if let Some(source) = decision.mention {
            tracing::debug!(mention = ?source, "group mention detected");
        }

        let _delivery = self.debouncer.submit(event);
        Admission::Queued
    }

    pub async fn shutdown(&self) {
        self.debouncer.shutdown().await;
    }
}

fn build_debouncer(
    cfg: &DebounceConfig,
    router: Arc<ReplyRouter>,
) -> Debouncer<InboundEvent> {
    let skip_commands = cfg.skip_commands;
    let skip_media = cfg.skip_media;
    Debouncer::new(
        Duration::from_millis(cfg.window_ms),
        InboundEvent::debounce_key,
        move |event: &InboundEvent| {
            !(skip_commands && event.is_command()) && !(skip_media && event.has_media)
        },
        router,
    )
}

/// Sends each debounced batch to the agent and routes its reply back.
struct ReplyRouter {
    adapter: Arc<dyn ChannelAdapter>,
    resolver: Arc<IdentityResolver>,
    agent: Arc<dyn AgentDispatch>,
}

#[async_trait]
impl BatchHandler<InboundEvent> for ReplyRouter {
    async fn flush(&self, _key: Option<&str>, items: Vec<InboundEvent>) -> Result<()> {
        let Some(batch) = AgentBatch::from_events(items) else {
            return Ok(());
        };
        let Some(reply) = self.agent.dispatch(&batch).await? else {
            tracing::debug!(batch_id = %batch.batch_id, "agent returned no reply");
            return Ok(());
        };

        let recipient = self
            .resolver
            .resolve(&batch.conversation_key)
            .await
            .map_err(|e| anyhow!("reply to {} rejected: {e}", batch.conversation_key))?;
        let delivery_id = self
            .adapter
            .send(
                &recipient,
                OutboundMessage {
                    content: reply,
                    reply_to: batch.last_event_id().cloned(),
                },
            )
            .await?;
        tracing::info!(
            channel = %batch.channel,
            batch_id = %batch.batch_id,
            delivery_id = %delivery_id,
            "reply delivered"
        );
        Ok(())
    }

    fn on_error(&self, key: Option<&str>, batch_len: usize, error: &anyhow::Error) {
        tracing::error!(
            channel = self.adapter.channel_id(),
            key = ?key,
            batch_len,
            %error,
            "batch dropped"
        );
    }
}

pub struct Gateway {
    pipelines: HashMap<String, Arc<ChannelPipeline>>,
    inbound_rx: mpsc::Receiver<InboundEvent>,
}

impl Gateway {
    pub fn new(
        pipelines: HashMap<String, Arc<ChannelPipeline>>,
        inbound_rx: mpsc::Receiver<InboundEvent>,
    ) -> Self {
        Self {
            pipelines,
            inbound_rx,
        }
    }

    pub fn start(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run_loop(shutdown).await })
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn run_loop(mut self, shutdown: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = self.inbound_rx.recv() => event,
            };
            let Some(event) = event else {
                break;
            };
            if let Err(e) = self.handle_inbound(event) {
                tracing::warn!(%e, "handle_inbound failed");
            }
        }

        for (channel, pipeline) in &self.pipelines {
            pipeline.shutdown().await;
            tracing::info!(%channel, "pipeline drained");
        }
    }

    fn handle_inbound(&self, event: InboundEvent) -> Result<Admission> {
        let pipeline = self
            .pipelines
            .get(event.channel.as_str())
            .ok_or_else(|| anyhow!("unknown channel: {}", event.channel))?;
        Ok(pipeline.accept(event))
    }
}

#[cfg(test)]
mod tests {
    use super::{Admission, ChannelPipeline, Gateway};
    use crate::agent::{AgentBatch, AgentDispatch};
    use async_trait::async_trait;
    use chrono::Utc;
    use sb_channels::{ChannelAdapter, DeliveryId, OutboundMessage};
    use sb_core::{
        Disconnect, GateReason, InboundEvent, Participant, ReliabilityConfig, RoutingConfig,
        SessionLifecycle,
    };
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct RecordingAdapter {
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl ChannelAdapter for RecordingAdapter {
        fn channel_id(&self) -> &str {
            "signal"
        }

        async fn run_session(
            &self,
            _tx: &mpsc::Sender<InboundEvent>,
            _lifecycle: &SessionLifecycle,
        ) -> anyhow::Result<Disconnect> {
            Ok(Disconnect::terminal("unused"))
        }

        async fn send(&self, recipient: &str, message: OutboundMessage) -> anyhow::Result<DeliveryId> {
            self.sent
                .lock()
                .expect("sent")
                .push((recipient.to_string(), message.content));
            Ok(DeliveryId::new("d1"))
        }
    }

    struct EchoAgent {
        batches: mpsc::UnboundedSender<Vec<String>>,
    }

    #[async_trait]
    impl AgentDispatch for EchoAgent {
        async fn dispatch(&self, batch: &AgentBatch) -> anyhow::Result<Option<String>> {
            let texts: Vec<String> = batch.events.iter().map(|event| event.text.clone()).collect();
            let _ = self.batches.send(texts.clone());
            Ok(Some(format!("echo: {}", texts.join(" | "))))
        }
    }

    fn event(id: &str, sender: Participant, text: &str, group: Option<&str>) -> InboundEvent {
        InboundEvent {
            channel: "signal".into(),
            event_id: id.into(),
            conversation_key: group
                .map(|group| format!("group:{group}"))
                .unwrap_or_else(|| sender.address.clone()),
            sender,
            text: text.to_string(),
            timestamp: Utc::now(),
            native_mentions: None,
            reply_to_sender: None,
            is_group: group.is_some(),
            group_id: group.map(ToOwned::to_owned),
            has_media: false,
        }
    }

    fn routing() -> RoutingConfig {
        RoutingConfig {
            self_address: Some("+15550001111".to_string()),
            mention_patterns: vec!["@bot".to_string()],
            ..RoutingConfig::default()
        }
    }

    fn pipeline(
        window_ms: u64,
    ) -> (
        Arc<ChannelPipeline>,
        Arc<RecordingAdapter>,
        mpsc::UnboundedReceiver<Vec<String>>,
    ) {
        let adapter = Arc::new(RecordingAdapter::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let mut reliability = ReliabilityConfig::default();
        reliability.debounce.window_ms = window_ms;
        let pipeline = ChannelPipeline::new(
            adapter.clone(),
            &routing(),
            &reliability,
            Arc::new(EchoAgent { batches: tx }),
        );
        (Arc::new(pipeline), adapter, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn duplicates_and_unmentioned_group_messages_never_reach_the_agent() {
        let (pipeline, _adapter, mut batches) = pipeline(0);
        let alice = Participant::new("+15552220000");

        assert_eq!(
            pipeline.accept(event("1", alice.clone(), "hi", None)),
            Admission::Queued
        );
        assert_eq!(
            pipeline.accept(event("1", alice.clone(), "hi", None)),
            Admission::Duplicate
        );
        assert_eq!(
            pipeline.accept(event("2", alice.clone(), "chatter", Some("g1"))),
            Admission::Gated(GateReason::MentionRequired)
        );
        assert_eq!(
            pipeline.accept(event("3", alice, "@bot status", Some("g1"))),
            Admission::Queued
        );

        pipeline.shutdown().await;
        let mut seen = vec![
            batches.recv().await.expect("first batch").join(" "),
            batches.recv().await.expect("second batch").join(" "),
        ];
        seen.sort();
        assert_eq!(seen, vec!["@bot status".to_string(), "hi".to_string()]);
        assert!(batches.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn burst_is_batched_and_reply_goes_to_the_conversation() {
        let (pipeline, adapter, mut batches) = pipeline(500);
        let alice = Participant::new("+15552220000");
        for (id, text) in [("1", "one"), ("2", "two"), ("3", "three")] {
            assert_eq!(pipeline.accept(event(id, alice.clone(), text, None)), Admission::Queued);
            tokio::time::advance(Duration::from_millis(100)).await;
        }

        let batch = batches.recv().await.expect("batch");
        assert_eq!(batch, vec!["one", "two", "three"]);
        pipeline.shutdown().await;
        let sent = adapter.sent.lock().expect("sent").clone();
        assert_eq!(
            sent,
            vec![("+15552220000".to_string(), "echo: one | two | three".to_string())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn group_members_typing_together_share_one_batch() {
        let (pipeline, adapter, mut batches) = pipeline(500);
        let alice = Participant::new("+15552220000");
        let bob = Participant::new("+15552220001");
        pipeline.accept(event("1", alice, "@bot first", Some("g1")));
        tokio::time::advance(Duration::from_millis(100)).await;
        pipeline.accept(event("2", bob, "@bot second", Some("g1")));

        let batch = batches.recv().await.expect("batch");
        assert_eq!(batch, vec!["@bot first", "@bot second"]);
        pipeline.shutdown().await;
        assert!(batches.try_recv().is_err());
        let sent = adapter.sent.lock().expect("sent").clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "group:g1");
    }

    #[tokio::test(start_paused = true)]
    async fn reply_to_unresolved_linked_sender_is_not_sent() {
        let (pipeline, adapter, mut batches) = pipeline(0);
        let stranger = Participant::new("9f1c@lid").with_linked_id("9f1c@lid");
        pipeline.accept(event("1", stranger, "hello", None));
        pipeline.shutdown().await;

        assert_eq!(batches.recv().await.expect("agent saw it"), vec!["hello".to_string()]);
        assert!(adapter.sent.lock().expect("sent").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn linked_sender_that_disclosed_a_phone_gets_the_reply() {
        let (pipeline, adapter, _batches) = pipeline(0);
        let sender = Participant::new("9f1c@lid")
            .with_linked_id("9f1c@lid")
            .with_phone("+15553334444");
        pipeline.accept(event("1", sender, "hello", None));
        pipeline.shutdown().await;

        let sent = adapter.sent.lock().expect("sent").clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "+15553334444");
    }

    #[tokio::test(start_paused = true)]
    async fn gateway_drains_pending_batches_when_inbound_closes() {
        let (pipeline, adapter, _batches) = pipeline(10_000);
        let (tx, rx) = mpsc::channel(8);
        let handle = Gateway::new(HashMap::from([("signal".to_string(), pipeline)]), rx)
            .start(CancellationToken::new());

        tx.send(event("1", Participant::new("+15552220000"), "queued", None))
            .await
            .expect("send");
        let mut stray = event("2", Participant::new("+15552220000"), "lost", None);
        stray.channel = "matrix".into();
        tx.send(stray).await.expect("send");
        drop(tx);
        handle.await.expect("gateway join");

        let sent = adapter.sent.lock().expect("sent").clone();
        assert_eq!(sent, vec![("+15552220000".to_string(), "echo: queued".to_string())]);
    }
}
