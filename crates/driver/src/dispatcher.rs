//! Command dispatcher (C3): one command in flight at a time, FIFO order,
//! a toggling flip bit per distinct command, fixed-backoff retry of the
//! identical retransmitted bytes, and an idle-priority status poll that
//! keeps the link alive between application commands.
//!
//! Runs as a single task driven by one `tokio::select!` loop, so there is
//! never a question of two commands racing on the wire.

use std::time::Duration;

use shared::protocol::{Command, MessageProtocol};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_retry::strategy::{jitter, ExponentialBackoff};

use crate::config::DriverConfig;
use crate::error::{DriverError, DriverResult};
use crate::transport_impl::{TransportEvent, TransportWriter};

struct DispatchRequest {
    command: Command,
    payload: Vec<u8>,
    respond: oneshot::Sender<DriverResult<(u8, Vec<u8>)>>,
}

/// Handle used by the rest of the driver to submit commands; cheap to
/// clone, backed by the dispatcher task's request channel.
#[derive(Clone)]
pub struct DispatcherHandle {
    requests: mpsc::Sender<DispatchRequest>,
}

impl DispatcherHandle {
    /// Sends one command and awaits its matched response, including any
    /// retries the dispatcher performs internally.
    pub async fn send(&self, command: Command, payload: Vec<u8>) -> DriverResult<(u8, Vec<u8>)> {
        let (respond, rx) = oneshot::channel();
        self.requests
            .send(DispatchRequest {
                command,
                payload,
                respond,
            })
            .await
            .map_err(|_| DriverError::TransportLost)?;
        rx.await.map_err(|_| DriverError::TransportLost)?
    }
}

struct Pending {
    command: Command,
    payload: Vec<u8>,
    flip: bool,
    retries: u32,
    deadline: Instant,
    backoff: std::vec::IntoIter<Duration>,
    /// `None` for the internally-generated idle status poll, whose timeout
    /// is not reported to any external caller.
    respond: Option<oneshot::Sender<DriverResult<(u8, Vec<u8>)>>>,
}

struct Dispatcher<W> {
    writer: W,
    events: mpsc::Receiver<TransportEvent>,
    requests: mpsc::Receiver<DispatchRequest>,
    protocol: std::sync::Arc<dyn MessageProtocol>,
    config: DriverConfig,
    flip: bool,
    pending: Option<Pending>,
}

fn backoff_for(config: &DriverConfig) -> std::vec::IntoIter<Duration> {
    ExponentialBackoff::from_millis(100)
        .map(jitter)
        .take(config.max_retries as usize)
        .collect::<Vec<_>>()
        .into_iter()
}

impl<W: TransportWriter> Dispatcher<W> {
    async fn start(&mut self, command: Command, payload: Vec<u8>, respond: Option<oneshot::Sender<DriverResult<(u8, Vec<u8>)>>>) {
        self.flip = !self.flip;
        let frames = self.protocol.create_packets(command, self.flip, &payload);
        for frame in &frames {
            if let Err(e) = self.writer.write_frame(frame).await {
                if let Some(tx) = respond {
                    let _ = tx.send(Err(DriverError::Io(e)));
                }
                return;
            }
        }
        self.pending = Some(Pending {
            command,
            payload,
            flip: self.flip,
            retries: 0,
            deadline: Instant::now() + self.config.command_timeout,
            backoff: backoff_for(&self.config),
            respond,
        });
    }

    async fn retransmit(&mut self, pending: &Pending) -> std::io::Result<()> {
        let frames = self
            .protocol
            .create_packets(pending.command, pending.flip, &pending.payload);
        for frame in &frames {
            self.writer.write_frame(frame).await?;
        }
        Ok(())
    }

    fn fail_pending_and_queue(&mut self, err_for: impl Fn() -> DriverError) {
        if let Some(pending) = self.pending.take() {
            if let Some(tx) = pending.respond {
                let _ = tx.send(Err(err_for()));
            }
        }
        while let Ok(req) = self.requests.try_recv() {
            let _ = req.respond.send(Err(err_for()));
        }
    }

    async fn run(mut self) {
        let mut status_timer = tokio::time::interval(self.config.status_poll_interval);
        status_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick fires immediately; consume it so the first real poll
        // happens one full interval after startup.
        status_timer.tick().await;

        loop {
            let Some(mut pending) = self.pending.take() else {
                tokio::select! {
                    maybe_req = self.requests.recv() => {
                        match maybe_req {
                            Some(req) => self.start(req.command, req.payload, Some(req.respond)).await,
                            None => return,
                        }
                    }
                    _ = status_timer.tick() => {
                        self.start(Command::StatusPoll, Vec::new(), None).await;
                    }
                }
                continue;
            };

            tokio::select! {
                event = self.events.recv() => {
                    match event {
                        Some(TransportEvent::Message { command, payload, flip }) => {
                            let flip_matches = flip.map_or(true, |f| f == pending.flip);
                            if command == pending.command.code() && flip_matches {
                                if let Some(tx) = pending.respond {
                                    let _ = tx.send(Ok((command, payload)));
                                }
                            } else {
                                // Unexpected/stale reply (wrong command, or
                                // carrying the wrong flip bit) while one
                                // command is outstanding: drop it and keep
                                // waiting.
                                self.pending = Some(pending);
                            }
                        }
                        Some(TransportEvent::Lost) | None => {
                            if let Some(tx) = pending.respond {
                                let _ = tx.send(Err(DriverError::TransportLost));
                            }
                            self.fail_pending_and_queue(|| DriverError::TransportLost);
                            return;
                        }
                    }
                }
                _ = tokio::time::sleep_until(pending.deadline) => {
                    if pending.retries >= self.config.max_retries {
                        if let Some(tx) = pending.respond {
                            let _ = tx.send(Err(DriverError::Timeout {
                                command: pending.command.code(),
                                retries: pending.retries,
                            }));
                        }
                        // A silent status poll simply lapses; nothing to report.
                    } else {
                        pending.retries += 1;
                        if let Some(delay) = pending.backoff.next() {
                            tokio::time::sleep(delay).await;
                        }
                        if let Err(e) = self.retransmit(&pending).await {
                            if let Some(tx) = pending.respond {
                                let _ = tx.send(Err(DriverError::Io(e)));
                            }
                        } else {
                            pending.deadline = Instant::now() + self.config.command_timeout;
                            self.pending = Some(pending);
                        }
                    }
                }
            }
        }
    }
}

/// Spawns the dispatcher task and returns a handle for submitting commands.
pub fn spawn_dispatcher<W>(
    writer: W,
    events: mpsc::Receiver<TransportEvent>,
    protocol: std::sync::Arc<dyn MessageProtocol>,
    config: DriverConfig,
) -> DispatcherHandle
where
    W: TransportWriter + Send + 'static,
{
    let (tx, rx) = mpsc::channel(32);
    let dispatcher = Dispatcher {
        writer,
        events,
        requests: rx,
        protocol,
        config,
        flip: false,
        pending: None,
    };
    tokio::spawn(dispatcher.run());
    DispatcherHandle { requests: tx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::protocol::ClassicProtocol;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    /// An in-memory writer/event-source pair used to drive the dispatcher
    /// without any real byte stream.
    struct FakeWriter {
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl TransportWriter for FakeWriter {
        async fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()> {
            self.sent.lock().await.push(frame.to_vec());
            Ok(())
        }
    }

    fn short_config() -> DriverConfig {
        DriverConfig {
            command_timeout: Duration::from_millis(30),
            max_retries: 2,
            status_poll_interval: Duration::from_secs(3600),
            mmm_failure_threshold: 1,
        }
    }

    #[tokio::test]
    async fn successful_round_trip_resolves_the_caller() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let (events_tx, events_rx) = mpsc::channel(8);
        let writer = FakeWriter { sent: sent.clone() };
        let handle = spawn_dispatcher(writer, events_rx, std::sync::Arc::new(ClassicProtocol), short_config());

        let reply_events_tx = events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let _ = reply_events_tx
                .send(TransportEvent::Message {
                    command: Command::GetRandomNumber.code(),
                    payload: vec![1, 2, 3],
                    // The first command a fresh dispatcher sends flips from
                    // its initial `false` to `true`.
                    flip: Some(true),
                })
                .await;
        });

        let (command, payload) = handle
            .send(Command::GetRandomNumber, vec![4])
            .await
            .unwrap();
        assert_eq!(command, Command::GetRandomNumber.code());
        assert_eq!(payload, vec![1, 2, 3]);
        assert_eq!(sent.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn reply_with_stale_flip_bit_is_discarded_and_retried() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let (events_tx, events_rx) = mpsc::channel(8);
        let writer = FakeWriter { sent: sent.clone() };
        let handle = spawn_dispatcher(writer, events_rx, std::sync::Arc::new(ClassicProtocol), short_config());

        let reply_events_tx = events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            // Stale reply from the previous command: wrong flip bit, same
            // command code. Must be dropped rather than resolving the caller.
            let _ = reply_events_tx
                .send(TransportEvent::Message {
                    command: Command::GetRandomNumber.code(),
                    payload: vec![0xFF],
                    flip: Some(false),
                })
                .await;
            tokio::time::sleep(Duration::from_millis(40)).await;
            let _ = reply_events_tx
                .send(TransportEvent::Message {
                    command: Command::GetRandomNumber.code(),
                    payload: vec![1, 2, 3],
                    flip: Some(true),
                })
                .await;
        });

        let (command, payload) = handle
            .send(Command::GetRandomNumber, vec![4])
            .await
            .unwrap();
        assert_eq!(command, Command::GetRandomNumber.code());
        assert_eq!(payload, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn timeout_retries_then_fails() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let (_events_tx, events_rx) = mpsc::channel(8);
        let writer = FakeWriter { sent: sent.clone() };
        let handle = spawn_dispatcher(writer, events_rx, std::sync::Arc::new(ClassicProtocol), short_config());

        let err = handle.send(Command::GetRandomNumber, vec![]).await.unwrap_err();
        assert!(matches!(err, DriverError::Timeout { retries: 2, .. }));
        // Initial send plus two retries: three identical frames on the wire.
        assert_eq!(sent.lock().await.len(), 3);
    }

    #[tokio::test]
    async fn transport_loss_fails_the_pending_caller() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let (events_tx, events_rx) = mpsc::channel(8);
        let writer = FakeWriter { sent };
        let handle = spawn_dispatcher(writer, events_rx, std::sync::Arc::new(ClassicProtocol), short_config());

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let _ = events_tx.send(TransportEvent::Lost).await;
        });

        let err = handle.send(Command::GetRandomNumber, vec![]).await.unwrap_err();
        assert!(matches!(err, DriverError::TransportLost));
    }
}
