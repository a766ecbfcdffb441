//! Priority-ordered queue of pending tasks.
//!
//! Higher priority is served first; equal priorities keep submission order.

use std::collections::VecDeque;
use std::fmt;
use web_time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) u64);

impl TaskId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

#[derive(Debug)]
pub struct QueuedTask<T> {
    pub id: TaskId,
    pub priority: i32,
    pub enqueued_at: Instant,
    pub item: T,
}

#[derive(Debug)]
pub struct TaskQueue<T> {
    tasks: VecDeque<QueuedTask<T>>,
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        Self {
            tasks: VecDeque::new(),
        }
    }
}

impl<T> TaskQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert before the first task with a strictly lower priority.
    pub fn push(&mut self, task: QueuedTask<T>) {
        let position = self
            .tasks
            .iter()
            .position(|queued| queued.priority < task.priority)
            .unwrap_or(self.tasks.len());
        self.tasks.insert(position, task);
    }

    /// Remove and return the highest priority task.
    pub fn pop(&mut self) -> Option<QueuedTask<T>> {
        self.tasks.pop_front()
    }

    pub fn remove(&mut self, id: TaskId) -> Option<QueuedTask<T>> {
        let position = self.tasks.iter().position(|queued| queued.id == id)?;
        self.tasks.remove(position)
    }

    /// Move a queued task to the slot its new priority earns. Returns `false`
    /// when the task is no longer queued.
    pub fn reprioritize(&mut self, id: TaskId, priority: i32) -> bool {
        match self.remove(id) {
            Some(mut task) => {
                task.priority = priority;
                self.push(task);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.tasks.iter().any(|queued| queued.id == id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = QueuedTask<T>> + '_ {
        self.tasks.drain(..)
    }
}
