//! Async job engine (C4): composes multi-step device operations as ordered
//! lists of `Step`s driven one command at a time through the dispatcher.
//!
//! Only one job is ever in flight. A step's handler may ask to run a
//! sub-job ahead of the rest of the current job (`StepOutcome::Prepend`);
//! the sub-job is spliced to the front of the queue so it completes before
//! the parent job's next step is issued.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use shared::protocol::Command;
use tokio::sync::{mpsc, oneshot};

use crate::dispatcher::DispatcherHandle;
use crate::error::DriverError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(u64);

/// Per-job mutable scratch space, handed to every step's builder and
/// handler. Keyed by name rather than typed fields since different job
/// kinds (credential write, MMM phase, export) need entirely different
/// shapes of accumulated state.
#[derive(Default)]
pub struct JobState {
    values: HashMap<&'static str, Box<dyn Any + Send>>,
}

impl JobState {
    pub fn set<T: Any + Send>(&mut self, key: &'static str, value: T) {
        self.values.insert(key, Box::new(value));
    }

    pub fn get<T: Any + Send>(&self, key: &'static str) -> Option<&T> {
        self.values.get(key).and_then(|v| v.downcast_ref())
    }

    pub fn take<T: Any + Send>(&mut self, key: &'static str) -> Option<T> {
        self.values
            .remove(key)
            .and_then(|v| v.downcast::<T>().ok())
            .map(|b| *b)
    }
}

pub enum StepOutcome {
    Continue,
    StopSuccess,
    StopFailure(DriverError),
    /// Run `job` to completion before the current job's next step is issued.
    Prepend(Job),
}

/// One unit of a job: build a command from the accumulated state, then
/// interpret its response.
pub struct Step {
    pub build: Box<dyn FnMut(&mut JobState) -> (Command, Vec<u8>) + Send>,
    pub handle: Box<dyn FnMut(&mut JobState, (u8, Vec<u8>)) -> StepOutcome + Send>,
}

pub enum JobOutcome {
    Success(JobState),
    Failure {
        error: DriverError,
        failed_step_index: usize,
    },
    Cancelled,
}

pub struct Job {
    id: JobId,
    steps: VecDeque<Step>,
    state: JobState,
    next_step_index: usize,
    cancel: Arc<AtomicBool>,
    complete: Option<oneshot::Sender<JobOutcome>>,
}

impl Job {
    pub fn new(id: JobId, steps: Vec<Step>, state: JobState) -> (Self, oneshot::Receiver<JobOutcome>) {
        let (tx, rx) = oneshot::channel();
        (
            Job {
                id,
                steps: steps.into(),
                state,
                next_step_index: 0,
                cancel: Arc::new(AtomicBool::new(false)),
                complete: Some(tx),
            },
            rx,
        )
    }

    fn finish(mut self, outcome: JobOutcome) {
        if let Some(tx) = self.complete.take() {
            let _ = tx.send(outcome);
        }
    }
}

enum JobMsg {
    Enqueue(Job),
    Cancel(JobId),
}

#[derive(Clone)]
pub struct JobEngineHandle {
    tx: mpsc::Sender<JobMsg>,
    next_id: Arc<AtomicU64>,
}

impl JobEngineHandle {
    pub fn alloc_id(&self) -> JobId {
        JobId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub async fn enqueue(&self, job: Job) {
        let _ = self.tx.send(JobMsg::Enqueue(job)).await;
    }

    pub async fn cancel(&self, id: JobId) {
        let _ = self.tx.send(JobMsg::Cancel(id)).await;
    }
}

struct RunningEngine {
    dispatcher: DispatcherHandle,
    msgs: mpsc::Receiver<JobMsg>,
    jobs: VecDeque<Job>,
    cancel_flags: HashMap<JobId, Arc<AtomicBool>>,
}

impl RunningEngine {
    fn drain_messages(&mut self) {
        while let Ok(msg) = self.msgs.try_recv() {
            self.handle_msg(msg);
        }
    }

    fn handle_msg(&mut self, msg: JobMsg) {
        match msg {
            JobMsg::Enqueue(job) => {
                self.cancel_flags.insert(job.id, job.cancel.clone());
                self.jobs.push_back(job);
            }
            JobMsg::Cancel(id) => {
                if let Some(pos) = self.jobs.iter().position(|j| j.id == id) {
                    if pos == 0 {
                        // Already started: mark the flag, checked at the
                        // next checkpoint rather than torn down here.
                        if let Some(flag) = self.cancel_flags.get(&id) {
                            flag.store(true, Ordering::Relaxed);
                        }
                    } else {
                        let job = self.jobs.remove(pos).unwrap();
                        self.cancel_flags.remove(&id);
                        job.finish(JobOutcome::Cancelled);
                    }
                }
            }
        }
    }

    async fn run(mut self) {
        loop {
            self.drain_messages();

            if self.jobs.front().map(|j| j.cancel.load(Ordering::Relaxed)) == Some(true) {
                let job = self.jobs.pop_front().unwrap();
                self.cancel_flags.remove(&job.id);
                job.finish(JobOutcome::Cancelled);
                continue;
            }

            let Some(front) = self.jobs.front_mut() else {
                match self.msgs.recv().await {
                    Some(msg) => self.handle_msg(msg),
                    None => return,
                }
                continue;
            };

            let Some(step) = front.steps.front_mut() else {
                let job = self.jobs.pop_front().unwrap();
                self.cancel_flags.remove(&job.id);
                let Job { state, mut complete, .. } = job;
                if let Some(tx) = complete.take() {
                    let _ = tx.send(JobOutcome::Success(state));
                }
                continue;
            };

            let (command, payload) = (step.build)(&mut front.state);
            front.next_step_index += 1;
            let failed_index = front.next_step_index - 1;

            let result = self.dispatcher.send(command, payload).await;
            self.drain_messages();

            let Some(front) = self.jobs.front_mut() else {
                // Job vanished (shouldn't happen: only removed via cancel
                // checkpoints above, which run before dispatch). Defensive.
                continue;
            };

            if front.cancel.load(Ordering::Relaxed) {
                let job = self.jobs.pop_front().unwrap();
                self.cancel_flags.remove(&job.id);
                job.finish(JobOutcome::Cancelled);
                continue;
            }

            match result {
                Ok(response) => {
                    let mut step = front.steps.pop_front().expect("step present");
                    let outcome = (step.handle)(&mut front.state, response);
                    match outcome {
                        StepOutcome::Continue => {}
                        StepOutcome::StopSuccess => front.steps.clear(),
                        StepOutcome::StopFailure(error) => {
                            let job = self.jobs.pop_front().unwrap();
                            self.cancel_flags.remove(&job.id);
                            job.finish(JobOutcome::Failure {
                                error,
                                failed_step_index: failed_index,
                            });
                        }
                        StepOutcome::Prepend(subjob) => {
                            self.cancel_flags.insert(subjob.id, subjob.cancel.clone());
                            self.jobs.push_front(subjob);
                        }
                    }
                }
                Err(error) => {
                    let job = self.jobs.pop_front().unwrap();
                    self.cancel_flags.remove(&job.id);
                    job.finish(JobOutcome::Failure {
                        error,
                        failed_step_index: failed_index,
                    });
                }
            }
        }
    }
}

pub fn spawn_job_engine(dispatcher: DispatcherHandle) -> JobEngineHandle {
    let (tx, rx) = mpsc::channel(32);
    let engine = RunningEngine {
        dispatcher,
        msgs: rx,
        jobs: VecDeque::new(),
        cancel_flags: HashMap::new(),
    };
    tokio::spawn(engine.run());
    JobEngineHandle {
        tx,
        next_id: Arc::new(AtomicU64::new(1)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriverConfig;
    use crate::transport_impl::{spawn_stream_transport, TransportWriter};
    use std::time::Duration;

    async fn engine_with_loopback_device() -> JobEngineHandle {
        let (client, server) = tokio::io::duplex(8192);
        let (writer, events) = spawn_stream_transport(client);
        let config = DriverConfig {
            command_timeout: Duration::from_millis(200),
            max_retries: 1,
            status_poll_interval: Duration::from_secs(3600),
            mmm_failure_threshold: 1,
        };
        let dispatcher = crate::dispatcher::spawn_dispatcher(
            writer,
            events,
            std::sync::Arc::new(shared::protocol::BleProtocol),
            config,
        );
        // Echo server: reply to every frame with a fixed status payload.
        tokio::spawn(async move {
            use shared::protocol::{decode_stream_message, BleProtocol, MessageProtocol};
            use shared::transport::{StreamReassembler, STREAM_FRAME_SIZE};
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let (mut r, mut w) = tokio::io::split(server);
            let mut reassembler = StreamReassembler::new();
            let mut buf = [0u8; STREAM_FRAME_SIZE];
            loop {
                let Ok(n) = r.read(&mut buf).await else { return };
                if n == 0 {
                    return;
                }
                for message in reassembler.push(&buf[..n]) {
                    let Some((command, _payload)) = decode_stream_message(&message) else {
                        continue;
                    };
                    let proto = BleProtocol;
                    let frames = proto.create_packets(
                        shared::protocol::Command::from_code(command).unwrap(),
                        true,
                        &[0u8],
                    );
                    for frame in frames {
                        if w.write_all(&frame).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });
        spawn_job_engine(dispatcher)
    }

    #[tokio::test]
    async fn a_single_step_job_completes_successfully() {
        let engine = engine_with_loopback_device().await;
        let step = Step {
            build: Box::new(|_state| (Command::StatusPoll, vec![])),
            handle: Box::new(|_state, _response| StepOutcome::StopSuccess),
        };
        let (job, rx) = Job::new(engine.alloc_id(), vec![step], JobState::default());
        engine.enqueue(job).await;
        let outcome = rx.await.unwrap();
        assert!(matches!(outcome, JobOutcome::Success(_)));
    }

    #[tokio::test]
    async fn cancelling_a_queued_job_before_it_starts_resolves_cancelled() {
        let engine = engine_with_loopback_device().await;

        let blocking_step = Step {
            build: Box::new(|_state| (Command::StatusPoll, vec![])),
            handle: Box::new(|_state, _response| StepOutcome::StopSuccess),
        };
        let (blocking_job, _blocking_rx) =
            Job::new(engine.alloc_id(), vec![blocking_step], JobState::default());
        engine.enqueue(blocking_job).await;

        let second_id = engine.alloc_id();
        let second_step = Step {
            build: Box::new(|_state| (Command::GetRandomNumber, vec![])),
            handle: Box::new(|_state, _response| StepOutcome::StopSuccess),
        };
        let (second_job, second_rx) = Job::new(second_id, vec![second_step], JobState::default());
        engine.enqueue(second_job).await;
        engine.cancel(second_id).await;

        let outcome = second_rx.await.unwrap();
        assert!(matches!(outcome, JobOutcome::Cancelled));
    }

    #[tokio::test]
    async fn job_state_bag_carries_values_between_steps() {
        let engine = engine_with_loopback_device().await;
        let first = Step {
            build: Box::new(|_state| (Command::StatusPoll, vec![])),
            handle: Box::new(|state, _response| {
                state.set("count", 1u32);
                StepOutcome::Continue
            }),
        };
        let second = Step {
            build: Box::new(|_state| (Command::GetRandomNumber, vec![])),
            handle: Box::new(|state, _response| {
                let count: u32 = state.take("count").unwrap_or(0);
                state.set("count", count + 1);
                StepOutcome::StopSuccess
            }),
        };
        let (job, rx) = Job::new(engine.alloc_id(), vec![first, second], JobState::default());
        engine.enqueue(job).await;
        match rx.await.unwrap() {
            JobOutcome::Success(state) => assert_eq!(state.get::<u32>("count"), Some(&2)),
            _ => panic!("expected success"),
        }
    }
}
