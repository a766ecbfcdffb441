//! Bounded pool of worker threads fed from a priority queue.
//!
//! One scheduling authority (the pool state behind a mutex) routes tasks to
//! independent workers. Workers only talk to the scheduler: a job goes in
//! over a channel, the outcome comes back through [`Shared::complete`].

use crate::config::PoolConfig;
use crate::error::ErrorKind;
use crate::task_queue::{QueuedTask, TaskId, TaskQueue};

use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use web_time::Instant;

/// Work executed inside a worker. The scheduler never calls it itself.
pub trait TaskHandler: Send + Sync + 'static {
    type Input: Send + 'static;
    type Output: Send + 'static;
    type Error: fmt::Debug + fmt::Display + Send + 'static;

    fn supports(&self, task_type: &str) -> bool;

    fn handle(&self, task_type: &str, input: Self::Input) -> Result<Self::Output, Self::Error>;
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("Task cancelled: {0}")]
    Cancelled(String),

    #[error("Worker pool is shut down")]
    ShutDown,

    #[error("No handler for task type {0}")]
    UnknownTaskType(String),

    #[error("Worker panicked: {0}")]
    Panicked(String),

    #[error("Worker {0} is gone")]
    WorkerLost(usize),
}

impl PoolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PoolError::Cancelled(_) | PoolError::ShutDown => ErrorKind::Cancelled,
            PoolError::UnknownTaskType(_) => ErrorKind::Configuration,
            PoolError::Panicked(_) | PoolError::WorkerLost(_) => ErrorKind::Data,
        }
    }
}

/// Rejection of a submitted task: either the handler's error or a pool
/// condition.
#[derive(Debug, Error)]
pub enum TaskError<E> {
    #[error("{0}")]
    Failed(E),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

type Reply<H> = oneshot::Sender<
    Result<<H as TaskHandler>::Output, TaskError<<H as TaskHandler>::Error>>,
>;

/// Resolves with the task's output once a worker has run it.
pub struct TaskResult<O, E> {
    receiver: oneshot::Receiver<Result<O, TaskError<E>>>,
}

impl<O, E> Future for TaskResult<O, E> {
    type Output = Result<O, TaskError<E>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(TaskError::Pool(PoolError::ShutDown))))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Initializing,
    Ready,
    Busy,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolStatistics {
    pub completed: u64,
    pub failed: u64,
    pub total_wait: Duration,
    pub total_execution: Duration,
    pub queued: usize,
    pub busy: usize,
    pub workers: usize,
}

struct Pending<H: TaskHandler> {
    task_type: String,
    input: H::Input,
    reply: Reply<H>,
}

struct Running<H: TaskHandler> {
    task: TaskId,
    reply: Reply<H>,
    started_at: Instant,
}

struct Job<I> {
    task: TaskId,
    task_type: String,
    input: I,
}

struct Slot<H: TaskHandler> {
    id: usize,
    state: SlotState,
    current: Option<Running<H>>,
    jobs: mpsc::Sender<Job<H::Input>>,
    thread: Option<JoinHandle<()>>,
}

struct State<H: TaskHandler> {
    queue: TaskQueue<Pending<H>>,
    slots: Vec<Slot<H>>,
    next_slot_id: usize,
    stats: PoolStatistics,
    shut_down: bool,
}

struct Shared<H: TaskHandler> {
    handler: Arc<H>,
    config: PoolConfig,
    next_task_id: AtomicU64,
    state: Mutex<State<H>>,
    this: Weak<Shared<H>>,
}

pub struct WorkerPool<H: TaskHandler> {
    shared: Arc<Shared<H>>,
}

impl<H: TaskHandler> Clone for WorkerPool<H> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<H: TaskHandler> fmt::Debug for WorkerPool<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<H: TaskHandler> WorkerPool<H> {
    /// Create the pool. Unless workers start on demand, every slot is
    /// spawned here.
    pub fn new(config: PoolConfig, handler: H) -> Self {
        let shared = Arc::new_cyclic(|this| Shared {
            handler: Arc::new(handler),
            config,
            next_task_id: AtomicU64::new(1),
            state: Mutex::new(State {
                queue: TaskQueue::new(),
                slots: Vec::new(),
                next_slot_id: 0,
                stats: PoolStatistics::default(),
                shut_down: false,
            }),
            this: this.clone(),
        });

        if !shared.config.start_workers_on_demand {
            let mut state = shared.state.lock();
            for _ in 0..shared.config.max_workers {
                shared.spawn_slot(&mut state);
            }
        }
        Self { shared }
    }

    /// Queue a task. The returned future resolves with the handler's output,
    /// or rejects when the task fails, is cancelled, or the pool shuts down.
    pub fn submit(
        &self,
        task_type: &str,
        input: H::Input,
        priority: i32,
    ) -> (TaskId, TaskResult<H::Output, H::Error>) {
        let (reply, receiver) = oneshot::channel();
        let id = TaskId(self.shared.next_task_id.fetch_add(1, Ordering::Relaxed));
        let result = TaskResult { receiver };

        if !self.shared.handler.supports(task_type) {
            let _ = reply.send(Err(PoolError::UnknownTaskType(task_type.to_string()).into()));
            return (id, result);
        }

        let mut state = self.shared.state.lock();
        if state.shut_down {
            let _ = reply.send(Err(PoolError::ShutDown.into()));
            return (id, result);
        }
        state.queue.push(QueuedTask {
            id,
            priority,
            enqueued_at: Instant::now(),
            item: Pending {
                task_type: task_type.to_string(),
                input,
                reply,
            },
        });
        debug!(%id, task_type, priority, queued = state.queue.len(), "task queued");
        self.shared.assign(&mut state);
        (id, result)
    }

    /// Change the priority of a task that is still queued.
    pub fn reprioritize(&self, id: TaskId, priority: i32) -> bool {
        self.shared.state.lock().queue.reprioritize(id, priority)
    }

    /// Cancel a queued task. Running tasks cannot be cancelled.
    pub fn cancel(&self, id: TaskId, reason: &str) -> bool {
        let removed = self.shared.state.lock().queue.remove(id);
        match removed {
            Some(task) => {
                debug!(%id, reason, "task cancelled");
                let _ = task
                    .item
                    .reply
                    .send(Err(PoolError::Cancelled(reason.to_string()).into()));
                true
            }
            None => false,
        }
    }

    /// Reject queued work, stop accepting new tasks and wait for workers to
    /// finish what they are running.
    pub fn shutdown(&self) {
        let (pending, slots) = {
            let mut state = self.shared.state.lock();
            state.shut_down = true;
            let pending: Vec<_> = state.queue.drain().collect();
            (pending, std::mem::take(&mut state.slots))
        };
        info!(
            rejected = pending.len(),
            workers = slots.len(),
            "worker pool shutting down"
        );
        for task in pending {
            let _ = task.item.reply.send(Err(PoolError::ShutDown.into()));
        }
        let current = std::thread::current().id();
        for mut slot in slots {
            let thread = slot.thread.take();
            drop(slot);
            if let Some(thread) = thread.filter(|t| t.thread().id() != current) {
                let _ = thread.join();
            }
        }
    }

    pub fn stats(&self) -> PoolStatistics {
        let state = self.shared.state.lock();
        let mut stats = state.stats.clone();
        stats.queued = state.queue.len();
        stats.busy = state
            .slots
            .iter()
            .filter(|slot| slot.state == SlotState::Busy)
            .count();
        stats.workers = state.slots.len();
        stats
    }

    pub fn slot_states(&self) -> Vec<SlotState> {
        self.shared
            .state
            .lock()
            .slots
            .iter()
            .map(|slot| slot.state)
            .collect()
    }
}

impl<H: TaskHandler> Shared<H> {
    /// Hand queued tasks to ready slots, spawning slots while under the cap.
    fn assign(&self, state: &mut State<H>) {
        while !state.queue.is_empty() {
            let Some(slot) = state.slots.iter_mut().find(|s| s.state == SlotState::Ready) else {
                let initializing = state
                    .slots
                    .iter()
                    .filter(|s| s.state == SlotState::Initializing)
                    .count();
                if self.config.start_workers_on_demand
                    && state.slots.len() < self.config.max_workers
                    && initializing < state.queue.len()
                    && self.spawn_slot(state)
                {
                    continue;
                }
                break;
            };
            let Some(task) = state.queue.pop() else {
                break;
            };

            state.stats.total_wait += task.enqueued_at.elapsed();
            let Pending {
                task_type,
                input,
                reply,
            } = task.item;
            slot.state = SlotState::Busy;
            slot.current = Some(Running {
                task: task.id,
                reply,
                started_at: Instant::now(),
            });
            debug!(task = %task.id, slot = slot.id, priority = task.priority, "task assigned");

            let job = Job {
                task: task.id,
                task_type,
                input,
            };
            if slot.jobs.send(job).is_err() {
                warn!(slot = slot.id, "worker channel closed");
                let slot_id = slot.id;
                if let Some(running) = slot.current.take() {
                    let _ = running.reply.send(Err(PoolError::WorkerLost(slot_id).into()));
                }
                state.slots.retain(|s| s.id != slot_id);
            }
        }
    }

    /// Start a worker thread in the `Initializing` state. The new slot turns
    /// ready once its thread is running.
    fn spawn_slot(&self, state: &mut State<H>) -> bool {
        let id = state.next_slot_id;
        let (jobs, inbox) = mpsc::channel::<Job<H::Input>>();
        let handler = Arc::clone(&self.handler);
        let this = self.this.clone();

        let spawned = std::thread::Builder::new()
            .name(format!("decode-worker-{id}"))
            .spawn(move || worker_loop(id, this, handler, inbox));
        match spawned {
            Ok(thread) => {
                state.next_slot_id += 1;
                state.slots.push(Slot {
                    id,
                    state: SlotState::Initializing,
                    current: None,
                    jobs,
                    thread: Some(thread),
                });
                debug!(slot = id, workers = state.slots.len(), "worker spawned");
                true
            }
            Err(error) => {
                warn!(slot = id, %error, "failed to spawn worker thread");
                false
            }
        }
    }

    fn mark_ready(&self, slot_id: usize) {
        let mut state = self.state.lock();
        if let Some(slot) = state.slots.iter_mut().find(|s| s.id == slot_id) {
            slot.state = SlotState::Ready;
        }
        self.assign(&mut state);
    }

    fn complete(
        &self,
        slot_id: usize,
        task: TaskId,
        outcome: Result<Result<H::Output, H::Error>, String>,
    ) {
        let mut state = self.state.lock();
        let running = state
            .slots
            .iter_mut()
            .find(|s| s.id == slot_id)
            .and_then(|slot| {
                slot.state = SlotState::Ready;
                slot.current.take()
            });

        if let Some(running) = running.filter(|r| r.task == task) {
            state.stats.total_execution += running.started_at.elapsed();
            let reply = match outcome {
                Ok(Ok(output)) => {
                    state.stats.completed += 1;
                    Ok(output)
                }
                Ok(Err(error)) => {
                    state.stats.failed += 1;
                    debug!(%task, %error, "task failed");
                    Err(TaskError::Failed(error))
                }
                Err(panic) => {
                    state.stats.failed += 1;
                    warn!(%task, panic, "worker panicked");
                    Err(PoolError::Panicked(panic).into())
                }
            };
            let _ = running.reply.send(reply);
        }
        self.assign(&mut state);
    }
}

fn worker_loop<H: TaskHandler>(
    slot_id: usize,
    shared: Weak<Shared<H>>,
    handler: Arc<H>,
    inbox: mpsc::Receiver<Job<H::Input>>,
) {
    match shared.upgrade() {
        Some(shared) => shared.mark_ready(slot_id),
        None => return,
    }
    while let Ok(job) = inbox.recv() {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            handler.handle(&job.task_type, job.input)
        }))
        .map_err(|payload| {
            payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string())
        });
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.complete(slot_id, job.task, outcome);
    }
}
