use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use protocol::{Command, CommandResult, RelayMessage};
use tokio::{
    sync::{Mutex, oneshot},
    time::timeout,
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{error::RelayError, sessions::SessionRegistry};

pub struct RouterMetrics {
    pub started_at: Instant,
    pub commands_sent_total: AtomicU64,
    pub results_ok_total: AtomicU64,
    pub results_error_total: AtomicU64,
}

impl Default for RouterMetrics {
    fn default() -> Self {
        Self {
            started_at: Instant::now(),
            commands_sent_total: AtomicU64::new(0),
            results_ok_total: AtomicU64::new(0),
            results_error_total: AtomicU64::new(0),
        }
    }
}

struct PendingResult {
    controller_id: String,
    tx: oneshot::Sender<Result<CommandResult, RelayError>>,
}

/// Forwards commands to controllers and pairs tagged commands with their results.
#[derive(Clone)]
pub struct CommandRouter {
    sessions: SessionRegistry,
    pending: Arc<Mutex<HashMap<String, PendingResult>>>,
    metrics: Arc<RouterMetrics>,
    result_timeout: Duration,
}

impl CommandRouter {
    pub fn new(sessions: SessionRegistry, result_timeout: Duration) -> Self {
        Self {
            sessions,
            pending: Arc::new(Mutex::new(HashMap::new())),
            metrics: Arc::new(RouterMetrics::default()),
            result_timeout,
        }
    }

    pub fn metrics(&self) -> &RouterMetrics {
        &self.metrics
    }

    /// Sends `command` to one controller.
    ///
    /// Without `request_result` this returns `Ok(None)` once the command is
    /// handed to the channel. Otherwise a fresh tag is attached and the call
    /// waits for the matching result, up to the result timeout.
    pub async fn send_command(
        &self,
        controller_id: &str,
        mut command: Command,
    ) -> Result<Option<CommandResult>, RelayError> {
        let channel = self.sessions.channel(controller_id).await?;

        if !command.request_result {
            command.tag = None;
            channel.send(RelayMessage::Command(command)).await?;
            self.metrics
                .commands_sent_total
                .fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        let tag = Uuid::new_v4().to_string();
        command.tag = Some(tag.clone());
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(
            tag.clone(),
            PendingResult {
                controller_id: controller_id.to_string(),
                tx,
            },
        );

        if let Err(err) = channel.send(RelayMessage::Command(command)).await {
            self.pending.lock().await.remove(&tag);
            return Err(err);
        }
        self.metrics
            .commands_sent_total
            .fetch_add(1, Ordering::Relaxed);

        let outcome = match timeout(self.result_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(RelayError::ChannelClosed),
            Err(_) => {
                self.pending.lock().await.remove(&tag);
                warn!(controller_id = %controller_id, tag = %tag, "command result timed out");
                Err(RelayError::ResultTimeout(tag))
            }
        };

        match outcome {
            Ok(result) => match result.error.clone() {
                Some(failure) => {
                    self.metrics
                        .results_error_total
                        .fetch_add(1, Ordering::Relaxed);
                    Err(RelayError::CommandFailed(failure))
                }
                None => {
                    self.metrics.results_ok_total.fetch_add(1, Ordering::Relaxed);
                    Ok(Some(result))
                }
            },
            Err(err) => {
                self.metrics
                    .results_error_total
                    .fetch_add(1, Ordering::Relaxed);
                Err(err)
            }
        }
    }

    /// Hands a result to the caller waiting on its tag. Results with an unknown
    /// tag, or from a controller other than the one the tag was sent to, are
    /// discarded.
    pub async fn resolve(&self, controller_id: &str, result: CommandResult) -> bool {
        let mut pending = self.pending.lock().await;
        let matches = pending
            .get(&result.tag)
            .is_some_and(|waiter| waiter.controller_id == controller_id);
        if !matches {
            debug!(controller_id = %controller_id, tag = %result.tag, "discarding unmatched command result");
            return false;
        }
        let Some(waiter) = pending.remove(&result.tag) else {
            return false;
        };
        waiter.tx.send(Ok(result)).is_ok()
    }

    /// Fails every waiter still pending on `controller_id`.
    pub async fn fail_pending(&self, controller_id: &str) -> usize {
        let mut pending = self.pending.lock().await;
        let tags = pending
            .iter()
            .filter(|(_, waiter)| waiter.controller_id == controller_id)
            .map(|(tag, _)| tag.clone())
            .collect::<Vec<_>>();
        for tag in &tags {
            if let Some(waiter) = pending.remove(tag) {
                let _ = waiter.tx.send(Err(RelayError::ChannelClosed));
            }
        }
        tags.len()
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use protocol::{
        CommandAction, CommandFailure, FailureKind, RollArgs, STATUS_DEVICE_CONNECTED,
    };
    use tokio::sync::mpsc;

    use super::*;
    use crate::channel::ControllerChannel;

    async fn router_with_controller(
        result_timeout: Duration,
    ) -> (CommandRouter, String, mpsc::Receiver<RelayMessage>) {
        let sessions = SessionRegistry::new(30_000);
        let (channel, mut outbound) = ControllerChannel::new(8);
        let info = sessions.register("Rig-1", channel).await.expect("register");
        let _scan = outbound.recv().await.expect("scan request");
        (
            CommandRouter::new(sessions, result_timeout),
            info.controller_id,
            outbound,
        )
    }

    async fn next_command(outbound: &mut mpsc::Receiver<RelayMessage>) -> Command {
        match outbound.recv().await {
            Some(RelayMessage::Command(command)) => command,
            other => panic!("expected a command, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn fire_and_forget_sends_untagged_command() {
        let (router, controller_id, mut outbound) =
            router_with_controller(Duration::from_secs(30)).await;
        let command = Command::new(
            "dev1",
            CommandAction::Roll(RollArgs {
                speed: 50.0,
                heading: 90.0,
            }),
        );

        let result = router
            .send_command(&controller_id, command.clone())
            .await
            .expect("send should succeed");

        assert_eq!(result, None);
        assert_eq!(next_command(&mut outbound).await, command);
        assert_eq!(router.pending_count().await, 0);
    }

    #[tokio::test]
    async fn tagged_command_resolves_with_matching_result() {
        let (router, controller_id, mut outbound) =
            router_with_controller(Duration::from_secs(30)).await;
        let waiter = {
            let router = router.clone();
            let controller_id = controller_id.clone();
            tokio::spawn(async move {
                router
                    .send_command(
                        &controller_id,
                        Command::new("dev1", CommandAction::Connect).with_result(),
                    )
                    .await
            })
        };

        let sent = next_command(&mut outbound).await;
        let tag = sent.tag.clone().expect("tag should be generated");
        assert!(sent.request_result);

        assert!(
            !router
                .resolve(
                    &controller_id,
                    CommandResult::ok("unrelated", STATUS_DEVICE_CONNECTED)
                )
                .await
        );
        assert!(
            router
                .resolve(
                    &controller_id,
                    CommandResult::ok(tag.clone(), STATUS_DEVICE_CONNECTED)
                )
                .await
        );

        let result = waiter
            .await
            .expect("waiter should join")
            .expect("command should succeed");
        assert_eq!(result, Some(CommandResult::ok(tag, STATUS_DEVICE_CONNECTED)));
        assert_eq!(router.pending_count().await, 0);
    }

    #[tokio::test]
    async fn concurrent_waiters_are_not_crossed() {
        let (router, controller_id, mut outbound) =
            router_with_controller(Duration::from_secs(30)).await;
        let spawn_wait = |device_id: &'static str| {
            let router = router.clone();
            let controller_id = controller_id.clone();
            tokio::spawn(async move {
                router
                    .send_command(
                        &controller_id,
                        Command::new(device_id, CommandAction::Connect).with_result(),
                    )
                    .await
            })
        };
        let first = spawn_wait("dev1");
        let first_sent = next_command(&mut outbound).await;
        let second = spawn_wait("dev2");
        let second_sent = next_command(&mut outbound).await;

        let second_tag = second_sent.tag.expect("second tag");
        router
            .resolve(&controller_id, CommandResult::ok(second_tag.clone(), "second"))
            .await;
        let second = second.await.expect("join").expect("second result");
        assert_eq!(second.map(|result| result.status), Some("second".to_string()));
        assert_eq!(router.pending_count().await, 1);

        let first_tag = first_sent.tag.expect("first tag");
        assert_ne!(first_tag, second_tag);
        router
            .resolve(&controller_id, CommandResult::ok(first_tag, "first"))
            .await;
        let first = first.await.expect("join").expect("first result");
        assert_eq!(first.map(|result| result.status), Some("first".to_string()));
    }

    #[tokio::test]
    async fn unknown_controller_fails_without_tag() {
        let (router, _controller_id, _outbound) =
            router_with_controller(Duration::from_secs(30)).await;
        let err = router
            .send_command(
                "missing",
                Command::new("dev1", CommandAction::Connect).with_result(),
            )
            .await
            .expect_err("unknown controller");

        assert_eq!(err, RelayError::UnknownController("missing".to_string()));
        assert_eq!(router.pending_count().await, 0);
    }

    #[tokio::test]
    async fn reported_failure_becomes_command_failed() {
        let (router, controller_id, mut outbound) =
            router_with_controller(Duration::from_secs(30)).await;
        let waiter = {
            let router = router.clone();
            let controller_id = controller_id.clone();
            tokio::spawn(async move {
                router
                    .send_command(
                        &controller_id,
                        Command::new("dev1", CommandAction::Connect).with_result(),
                    )
                    .await
            })
        };
        let tag = next_command(&mut outbound).await.tag.expect("tag");
        let failure = CommandFailure {
            kind: FailureKind::DriverFailure,
            message: "connect was never confirmed".to_string(),
        };
        router
            .resolve(&controller_id, CommandResult::failed(tag, failure.clone()))
            .await;

        let err = waiter.await.expect("join").expect_err("failure");
        assert_eq!(err, RelayError::CommandFailed(failure));
        assert_eq!(err.status_code(), axum::http::StatusCode::BAD_GATEWAY);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_controller_times_out_and_leaves_no_waiter() {
        let (router, controller_id, _outbound) =
            router_with_controller(Duration::from_secs(30)).await;

        let err = router
            .send_command(
                &controller_id,
                Command::new("dev1", CommandAction::Connect).with_result(),
            )
            .await
            .expect_err("timeout");

        assert!(matches!(err, RelayError::ResultTimeout(_)));
        assert_eq!(router.pending_count().await, 0);
    }

    #[tokio::test]
    async fn disconnect_fails_pending_waiters() {
        let (router, controller_id, mut outbound) =
            router_with_controller(Duration::from_secs(30)).await;
        let waiter = {
            let router = router.clone();
            let controller_id = controller_id.clone();
            tokio::spawn(async move {
                router
                    .send_command(
                        &controller_id,
                        Command::new("dev1", CommandAction::Connect).with_result(),
                    )
                    .await
            })
        };
        let _sent = next_command(&mut outbound).await;

        assert_eq!(router.fail_pending(&controller_id).await, 1);
        let err = waiter.await.expect("join").expect_err("closed");
        assert_eq!(err, RelayError::ChannelClosed);
    }

    #[tokio::test]
    async fn result_from_other_controller_is_ignored() {
        let (router, controller_id, mut outbound) =
            router_with_controller(Duration::from_secs(30)).await;
        let waiter = {
            let router = router.clone();
            let controller_id = controller_id.clone();
            tokio::spawn(async move {
                router
                    .send_command(
                        &controller_id,
                        Command::new("dev1", CommandAction::Connect).with_result(),
                    )
                    .await
            })
        };
        let tag = next_command(&mut outbound).await.tag.expect("tag");

        assert!(
            !router
                .resolve("someone-else", CommandResult::ok(tag.clone(), "stolen"))
                .await
        );
        assert_eq!(router.pending_count().await, 1);
        assert!(router.resolve(&controller_id, CommandResult::ok(tag, "ok")).await);
        assert!(waiter.await.expect("join").is_ok());
    }
}
