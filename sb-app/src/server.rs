//! Switchboard server: wires adapters, supervisors, and the relay gateway.

use crate::agent::{AgentDispatch, HttpAgentClient};
use crate::config::SwitchboardConfig;
use crate::gateway::{ChannelPipeline, Gateway};
use anyhow::Result;
use sb_channels::{AdapterConnection, ChannelAdapter, SignalAdapter, TelegramAdapter};
use sb_core::{
    ConnectionSupervisor, CredentialStore, RecoveryOutcome, RoutingConfig, SupervisorExit,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const SIGNAL_STATE_NAME: &str = "signal-cursor";
const TELEGRAM_STATE_NAME: &str = "telegram-offset";

struct ChannelSetup {
    adapter: Arc<dyn ChannelAdapter>,
    routing: RoutingConfig,
    store: CredentialStore,
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = SwitchboardConfig::load_with_path(config_path).await?;
    let data_dir = cfg.data_dir_path()?;
    tokio::fs::create_dir_all(&data_dir)
        .await
        .map_err(|e| anyhow::anyhow!("create data dir {}: {e}", data_dir.display()))?;
    tracing::info!(
        config_path = %path.display(),
        data_dir = %data_dir.display(),
        "starting switchboard"
    );

    let channels = build_channels(&cfg, &data_dir).await?;
    if channels.is_empty() {
        return Err(anyhow::anyhow!(
            "no channels enabled; enable [channels.signal] or [channels.telegram]"
        ));
    }

    let agent: Arc<dyn AgentDispatch> = Arc::new(HttpAgentClient::new(&cfg.agent)?);
    let (inbound_tx, inbound_rx) = mpsc::channel(cfg.general.inbound_queue_capacity);
    let shutdown = CancellationToken::new();
    let policy = cfg.reliability.reconnect.policy();

    let mut pipelines = HashMap::new();
    let mut supervisors: Vec<JoinHandle<()>> = Vec::new();
    let mut stores = Vec::new();
    for setup in channels {
        let channel = setup.adapter.channel_id().to_string();
        let pipeline = ChannelPipeline::new(
            setup.adapter.clone(),
            &setup.routing,
            &cfg.reliability,
            agent.clone(),
        );
        pipelines.insert(channel.clone(), Arc::new(pipeline));

        let connection = Arc::new(AdapterConnection::new(setup.adapter, inbound_tx.clone()));
        let supervisor = ConnectionSupervisor::new(connection, policy, shutdown.clone());
        supervisors.push(tokio::spawn(async move {
            match supervisor.run().await {
                SupervisorExit::Cancelled => {
                    tracing::info!(%channel, "channel supervisor stopped");
                }
                exit => {
                    tracing::error!(%channel, exit = ?exit, "channel connection given up");
                }
            }
        }));
        stores.push(setup.store);
    }
    drop(inbound_tx);

    let gateway = Gateway::new(pipelines, inbound_rx).start(shutdown.clone());
    tracing::info!(channels = supervisors.len(), "switchboard running");

    shutdown_signal(shutdown.clone()).await;

    for handle in supervisors {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "channel supervisor task failed");
        }
    }
    if let Err(e) = gateway.await {
        tracing::error!(error = %e, "gateway task failed");
    }
    for store in &stores {
        if let Err(e) = store.flush().await {
            tracing::error!(error = %e, path = %store.main_path().display(), "final state flush failed");
        }
    }
    tracing::info!("switchboard stopped");
    Ok(())
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = SwitchboardConfig::load_with_path(config_path).await?;
    let data_dir = cfg.data_dir_path()?;
    for (channel, enabled, name) in [
        ("signal", cfg.channels.signal.enabled, SIGNAL_STATE_NAME),
        ("telegram", cfg.channels.telegram.enabled, TELEGRAM_STATE_NAME),
    ] {
        if !enabled {
            continue;
        }
        let outcome = recover_store(&data_dir, name).await?.1;
        tracing::info!(channel, outcome = ?outcome, "state check");
    }
    tracing::info!(
        config_path = %path.display(),
        data_dir = %data_dir.display(),
        signal = cfg.channels.signal.enabled,
        telegram = cfg.channels.telegram.enabled,
        agent_endpoint = %cfg.agent.endpoint,
        "config ok"
    );
    Ok(())
}

async fn recover_store(data_dir: &Path, name: &str) -> Result<(CredentialStore, RecoveryOutcome)> {
    let store = CredentialStore::open(data_dir, name);
    let outcome = store.recover().await?;
    if outcome == RecoveryOutcome::Unrecoverable {
        tracing::info!(
            path = %store.main_path().display(),
            "no usable saved state; starting fresh"
        );
    }
    Ok((store, outcome))
}

async fn build_channels(cfg: &SwitchboardConfig, data_dir: &Path) -> Result<Vec<ChannelSetup>> {
    let mut channels = Vec::new();

    let signal = &cfg.channels.signal;
    if signal.enabled {
        let (store, _) = recover_store(data_dir, SIGNAL_STATE_NAME).await?;
        let adapter = SignalAdapter::new(&signal.api_base_url, &signal.account)?
            .with_api_token(signal.api_token.clone())
            .with_linked_domain(&signal.routing.linked_domain)
            .with_poll_interval(Duration::from_millis(signal.poll_interval_ms))
            .with_start_from_latest(signal.start_from_latest)
            .with_receive_timeout_seconds(signal.receive_timeout_seconds)
            .with_state_store(store.clone());
        let mut routing = signal.routing.clone();
        if routing.self_address.is_none() {
            routing.self_address = Some(signal.account.trim().to_string());
        }
        channels.push(ChannelSetup {
            adapter: Arc::new(adapter),
            routing,
            store,
        });
    }

    let telegram = &cfg.channels.telegram;
    if telegram.enabled {
        let (store, _) = recover_store(data_dir, TELEGRAM_STATE_NAME).await?;
        let adapter = TelegramAdapter::new(&telegram.bot_token)?.with_state_store(store.clone());
        let mut routing = telegram.routing.clone();
        if routing.self_address.is_none() {
            match adapter.fetch_profile().await {
                Ok(profile) => routing.self_address = Some(profile.id.to_string()),
                Err(e) => {
                    tracing::warn!(error = %e, "telegram bot identity unknown; only patterns and replies count as mentions");
                }
            }
        }
        channels.push(ChannelSetup {
            adapter: Arc::new(adapter),
            routing,
            store,
        });
    }

    Ok(channels)
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to await ctrl-c signal");
        } else {
            tracing::warn!("received ctrl-c; beginning graceful shutdown");
        }
    }
    shutdown.cancel();
}
