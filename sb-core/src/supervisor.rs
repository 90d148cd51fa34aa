//! Keeps one adapter connection alive across disconnects.

use crate::reconnect::{ReconnectManager, ReconnectPolicy, sleep_with_cancel};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    pub reason: String,
    /// `false` for terminal conditions such as a logged-out account.
    pub retryable: bool,
}

impl Disconnect {
    pub fn retry(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retryable: true,
        }
    }

    pub fn terminal(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            retryable: false,
        }
    }
}

/// Handed to each session so it can report a successful connect and watch
/// for shutdown.
#[derive(Debug)]
pub struct SessionLifecycle {
    connected: AtomicBool,
    shutdown: CancellationToken,
}

impl SessionLifecycle {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            connected: AtomicBool::new(false),
            shutdown,
        }
    }

    pub fn on_connected(&self) {
        if !self.connected.swap(true, Ordering::SeqCst) {
            tracing::debug!("session connected");
        }
    }

    pub fn was_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) -> &CancellationToken {
        &self.shutdown
    }
}

#[async_trait]
pub trait Connection: Send + Sync {
    fn name(&self) -> &str;

    /// Runs until the connection drops. Call `lifecycle.on_connected()` once
    /// the session is usable.
    async fn run_session(&self, lifecycle: &SessionLifecycle) -> anyhow::Result<Disconnect>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorExit {
    Cancelled,
    Exhausted { attempts: u32 },
    Stopped(String),
}

pub struct ConnectionSupervisor {
    connection: Arc<dyn Connection>,
    manager: ReconnectManager,
    shutdown: CancellationToken,
}

impl ConnectionSupervisor {
    pub fn new(
        connection: Arc<dyn Connection>,
        policy: ReconnectPolicy,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            connection,
            manager: ReconnectManager::new(policy),
            shutdown,
        }
    }

    pub async fn run(mut self) -> SupervisorExit {
        let name = self.connection.name().to_string();
        loop {
            if self.shutdown.is_cancelled() {
                return SupervisorExit::Cancelled;
            }

            let lifecycle = SessionLifecycle::new(self.shutdown.child_token());
            let outcome = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return SupervisorExit::Cancelled,
                outcome = self.connection.run_session(&lifecycle) => outcome,
            };

            if lifecycle.was_connected() {
                self.manager.reset();
            }

            match outcome {
                Ok(disconnect) if !disconnect.retryable => {
                    tracing::error!(
                        connection = %name,
                        reason = %disconnect.reason,
                        "connection stopped; not reconnecting"
                    );
                    return SupervisorExit::Stopped(disconnect.reason);
                }
                Ok(disconnect) => {
                    tracing::warn!(connection = %name, reason = %disconnect.reason, "connection dropped");
                }
                Err(error) => {
                    tracing::warn!(connection = %name, error = %error, "session failed");
                }
            }

            if self.manager.is_exhausted() {
                let attempts = self.manager.attempts();
                tracing::error!(connection = %name, attempts, "reconnect attempts exhausted");
                return SupervisorExit::Exhausted { attempts };
            }

            let delay = self.manager.next_delay();
            tracing::info!(
                connection = %name,
                attempt = self.manager.attempts(),
                max_attempts = self.manager.policy().max_attempts,
                delay_ms = duration_ms(delay),
                "reconnecting"
            );
            if sleep_with_cancel(delay, &self.shutdown).await.is_err() {
                return SupervisorExit::Cancelled;
            }
        }
    }
}

fn duration_ms(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::{Connection, ConnectionSupervisor, Disconnect, SessionLifecycle, SupervisorExit};
    use crate::backoff::BackoffPolicy;
    use crate::reconnect::ReconnectPolicy;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    enum Step {
        Drop { connected: bool },
        Fail,
        LoggedOut,
        Hang,
    }

    struct Scripted {
        steps: Mutex<VecDeque<Step>>,
        sessions: Mutex<Vec<Instant>>,
    }

    impl Scripted {
        fn new(steps: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                steps: Mutex::new(steps.into()),
                sessions: Mutex::new(Vec::new()),
            })
        }

        fn session_count(&self) -> usize {
            self.sessions.lock().expect("sessions").len()
        }
    }

    #[async_trait]
    impl Connection for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn run_session(&self, lifecycle: &SessionLifecycle) -> anyhow::Result<Disconnect> {
            self.sessions.lock().expect("sessions").push(Instant::now());
            let step = self
                .steps
                .lock()
                .expect("steps")
                .pop_front()
                .unwrap_or(Step::Fail);
            match step {
                Step::Drop { connected } => {
                    if connected {
                        lifecycle.on_connected();
                    }
                    Ok(Disconnect::retry("stream closed"))
                }
                Step::Fail => anyhow::bail!("connect refused"),
                Step::LoggedOut => Ok(Disconnect::terminal("logged out")),
                Step::Hang => {
                    lifecycle.on_connected();
                    std::future::pending::<()>().await;
                    unreachable!()
                }
            }
        }
    }

    fn policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            backoff: BackoffPolicy {
                initial_ms: 100,
                max_ms: 1_000,
                factor: 2.0,
                jitter_fraction: 0.0,
            },
            max_attempts,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let connection = Scripted::new(Vec::new());
        let started = Instant::now();
        let exit = ConnectionSupervisor::new(connection.clone(), policy(3), CancellationToken::new())
            .run()
            .await;
        assert_eq!(exit, SupervisorExit::Exhausted { attempts: 3 });
        assert_eq!(connection.session_count(), 4);
        // 100 + 200 + 400 ms of backoff between the four sessions.
        assert_eq!(started.elapsed(), Duration::from_millis(700));
    }

    #[tokio::test(start_paused = true)]
    async fn successful_connect_resets_the_attempt_counter() {
        let connection = Scripted::new(vec![
            Step::Fail,
            Step::Fail,
            Step::Drop { connected: true },
            Step::Fail,
        ]);
        let exit = ConnectionSupervisor::new(connection.clone(), policy(2), CancellationToken::new())
            .run()
            .await;
        assert_eq!(exit, SupervisorExit::Exhausted { attempts: 2 });
        // two failures, one good session, then a fresh budget of two retries
        assert_eq!(connection.session_count(), 5);

        let sessions = connection.sessions.lock().expect("sessions").clone();
        assert_eq!(sessions[3] - sessions[2], Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_disconnect_stops_immediately() {
        let connection = Scripted::new(vec![Step::Fail, Step::LoggedOut]);
        let exit = ConnectionSupervisor::new(connection.clone(), policy(5), CancellationToken::new())
            .run()
            .await;
        assert_eq!(exit, SupervisorExit::Stopped("logged out".to_string()));
        assert_eq!(connection.session_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_the_backoff_wait() {
        let connection = Scripted::new(vec![Step::Fail]);
        let shutdown = CancellationToken::new();
        let supervisor = ConnectionSupervisor::new(connection.clone(), policy(5), shutdown.clone());
        let task = tokio::spawn(supervisor.run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        let exit = task.await.expect("join");
        assert_eq!(exit, SupervisorExit::Cancelled);
        assert_eq!(connection.session_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_ends_a_live_session() {
        let connection = Scripted::new(vec![Step::Hang]);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(
            ConnectionSupervisor::new(connection.clone(), policy(5), shutdown.clone()).run(),
        );

        tokio::time::sleep(Duration::from_secs(60)).await;
        shutdown.cancel();
        assert_eq!(task.await.expect("join"), SupervisorExit::Cancelled);
    }
}
