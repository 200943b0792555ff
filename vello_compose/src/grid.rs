// Copyright 2025 the Vello Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A single-threaded dependency graph of asynchronous tasks.
//!
//! Tasks are created lazily: they only run once something [`force`]s them and
//! every task they happen after has completed. Running a task calls its
//! execute closure, which usually submits device work and then completes the
//! task from a continuation once the device reports back.
//!
//! Device completions arrive on another thread. The only thing that thread
//! can do is post a [`Completion`], which sends a message to the scheduler's
//! run queue; continuations then run on the host thread whenever the
//! scheduler is pumped.
//!
//! [`force`]: Scheduler::force

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::num::NonZeroU64;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};

use smallvec::SmallVec;

use crate::engine::{DeviceError, Downloads};
use crate::{Error, Result};

// --- MARK: Public API ---

/// A handle to a task.
///
/// Handles are generational: once a task has completed or been retired, its
/// handle goes stale and every operation on it is ignored.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TaskId {
    index: u32,
    generation: u32,
}

/// A slot which holds a task until that task starts executing.
///
/// Owners use this to find out whether a lazily created task still accepts
/// more work.
pub type TaskSlot = Rc<Cell<Option<TaskId>>>;

/// An opaque handle for a resource which is produced by some task.
///
/// A resource is mapped to its producer with [`Scheduler::map_external`]
/// until the producer completes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ExternalId(NonZeroU64);

impl ExternalId {
    pub fn next() -> Self {
        static ID_COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(NonZeroU64::MIN.saturating_add(ID_COUNTER.fetch_add(1, Ordering::Relaxed)))
    }
}

/// Something a task can happen after.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Node {
    Task(TaskId),
    External(ExternalId),
}

impl From<TaskId> for Node {
    fn from(value: TaskId) -> Self {
        Self::Task(value)
    }
}

impl From<ExternalId> for Node {
    fn from(value: ExternalId) -> Self {
        Self::External(value)
    }
}

/// The scheduler which owns the task graph and the run queue.
///
/// This is a cheap handle; clones refer to the same scheduler.
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<SchedulerInner>,
}

/// A ticket for one device submission, posted exactly once from any thread.
///
/// Dropping a completion without posting it counts as [`DeviceError::Lost`].
pub struct Completion {
    ticket: u64,
    sender: Option<Sender<Message>>,
}

static_assertions::assert_impl_all!(Completion: Send);

pub struct TaskBuilder<'a> {
    scheduler: &'a Scheduler,
    label: &'static str,
    slot: Option<TaskSlot>,
    execute: Option<ExecuteFn>,
    dispose: Option<DisposeFn>,
}

// --- MARK: Internals ---

type ExecuteFn = Box<dyn FnOnce(&Scheduler, TaskId)>;
type DisposeFn = Box<dyn FnOnce(&Scheduler)>;
type ContinuationFn = Box<dyn FnOnce(&Scheduler)>;
type CompletionFn = Box<dyn FnOnce(&Scheduler, Downloads)>;
type Message = (u64, Result<Downloads, DeviceError>);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum TaskState {
    /// Not yet runnable, either because nothing forced it or because it
    /// still waits on other tasks.
    Waiting,
    /// In the run queue.
    Scheduled,
    Executing,
}

struct Task {
    label: &'static str,
    state: TaskState,
    forced: bool,
    /// Number of incomplete tasks this one happens after.
    waiting_on: u32,
    before: SmallVec<[TaskId; 4]>,
    after: SmallVec<[TaskId; 4]>,
    execute: Option<ExecuteFn>,
    dispose: Option<DisposeFn>,
    slot: Option<TaskSlot>,
}

struct Entry {
    generation: u32,
    task: Option<Task>,
}

#[derive(Default)]
struct TaskTable {
    entries: Vec<Entry>,
    free: Vec<u32>,
    live: usize,
}

enum Job {
    Execute(TaskId),
    Continue(ContinuationFn),
}

struct SchedulerInner {
    tasks: RefCell<TaskTable>,
    externals: RefCell<HashMap<ExternalId, TaskId>>,
    queue: RefCell<VecDeque<Job>>,
    pending: RefCell<HashMap<u64, CompletionFn>>,
    next_ticket: Cell<u64>,
    sender: Sender<Message>,
    receiver: Receiver<Message>,
    poisoned: RefCell<Option<DeviceError>>,
}

impl TaskTable {
    fn get(&self, id: TaskId) -> Option<&Task> {
        let entry = self.entries.get(id.index as usize)?;
        if entry.generation != id.generation {
            return None;
        }
        entry.task.as_ref()
    }

    fn get_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        let entry = self.entries.get_mut(id.index as usize)?;
        if entry.generation != id.generation {
            return None;
        }
        entry.task.as_mut()
    }

    fn insert(&mut self, task: Task) -> TaskId {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let entry = &mut self.entries[index as usize];
            entry.task = Some(task);
            TaskId {
                index,
                generation: entry.generation,
            }
        } else {
            let index = self.entries.len() as u32;
            self.entries.push(Entry {
                generation: 0,
                task: Some(task),
            });
            TaskId {
                index,
                generation: 0,
            }
        }
    }

    fn remove(&mut self, id: TaskId) -> Option<Task> {
        let entry = self.entries.get_mut(id.index as usize)?;
        if entry.generation != id.generation {
            return None;
        }
        let task = entry.task.take()?;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;
        Some(task)
    }
}

impl Completion {
    /// Hand the result of a submission back to the scheduler.
    ///
    /// This is the only legal action of a device callback.
    pub fn post(mut self, result: Result<Downloads, DeviceError>) {
        if let Some(sender) = self.sender.take() {
            // The scheduler may already be gone, in which case nobody is waiting.
            let _ = sender.send((self.ticket, result));
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send((self.ticket, Err(DeviceError::Lost)));
        }
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("ticket", &self.ticket)
            .finish_non_exhaustive()
    }
}

impl TaskBuilder<'_> {
    /// Store the task in `slot` until it starts executing.
    pub fn invalidates(mut self, slot: &TaskSlot) -> Self {
        self.slot = Some(slot.clone());
        self
    }

    /// The closure run when the task executes.
    ///
    /// The closure is responsible for calling [`Scheduler::complete`], either
    /// directly or from a continuation. A task without one completes as soon as
    /// it runs.
    pub fn execute(mut self, f: impl FnOnce(&Scheduler, TaskId) + 'static) -> Self {
        self.execute = Some(Box::new(f));
        self
    }

    /// The closure run once the task has completed or been retired.
    pub fn dispose(mut self, f: impl FnOnce(&Scheduler) + 'static) -> Self {
        self.dispose = Some(Box::new(f));
        self
    }

    pub fn build(self) -> TaskId {
        let slot = self.slot.clone();
        let id = self.scheduler.inner.tasks.borrow_mut().insert(Task {
            label: self.label,
            state: TaskState::Waiting,
            forced: false,
            waiting_on: 0,
            before: SmallVec::new(),
            after: SmallVec::new(),
            execute: self.execute,
            dispose: self.dispose,
            slot: self.slot,
        });
        if let Some(slot) = slot {
            slot.set(Some(id));
        }
        log::trace!("created task {} {id:?}", self.label);
        id
    }
}

impl Scheduler {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            inner: Rc::new(SchedulerInner {
                tasks: RefCell::default(),
                externals: RefCell::default(),
                queue: RefCell::default(),
                pending: RefCell::default(),
                next_ticket: Cell::new(0),
                sender,
                receiver,
                poisoned: RefCell::new(None),
            }),
        }
    }

    /// Start building a lazy task.
    pub fn task(&self, label: &'static str) -> TaskBuilder<'_> {
        TaskBuilder {
            scheduler: self,
            label,
            slot: None,
            execute: None,
            dispose: None,
        }
    }

    /// Whether the task has neither completed nor been retired.
    pub fn is_pending(&self, task: TaskId) -> bool {
        self.inner.tasks.borrow().get(task).is_some()
    }

    /// Whether the task has started executing.
    pub fn is_executing(&self, task: TaskId) -> bool {
        self.inner
            .tasks
            .borrow()
            .get(task)
            .is_some_and(|t| t.state == TaskState::Executing)
    }

    /// Number of tasks which have neither completed nor been retired.
    pub fn live_tasks(&self) -> usize {
        self.inner.tasks.borrow().live
    }

    /// Number of posted completions which have not arrived yet.
    pub fn in_flight(&self) -> usize {
        self.inner.pending.borrow().len()
    }

    /// Declare that `task` must not start before `node` has completed.
    ///
    /// Nodes which already completed, and externals which are not mapped to
    /// a producer, add no edge. If `task` is already forced, so is the node.
    pub fn happens_after(&self, task: TaskId, node: impl Into<Node>) {
        let before = match node.into() {
            Node::Task(before) => before,
            Node::External(external) => match self.inner.externals.borrow().get(&external) {
                Some(&before) => before,
                None => return,
            },
        };
        if before == task {
            return;
        }
        let forced = {
            let mut tasks = self.inner.tasks.borrow_mut();
            if tasks.get(before).is_none() {
                return;
            }
            let Some(t) = tasks.get_mut(task) else {
                return;
            };
            if t.state != TaskState::Waiting {
                log::error!("task {} already started; ignoring new dependency", t.label);
                return;
            }
            if t.before.contains(&before) {
                return;
            }
            t.before.push(before);
            t.waiting_on += 1;
            let forced = t.forced;
            if let Some(b) = tasks.get_mut(before) {
                b.after.push(task);
            }
            forced
        };
        if forced {
            self.force(before);
        }
    }

    /// Make the task run as soon as everything it happens after has completed,
    /// forcing those tasks in turn.
    pub fn force(&self, task: TaskId) {
        let mut stack = vec![task];
        let mut tasks = self.inner.tasks.borrow_mut();
        while let Some(id) = stack.pop() {
            let Some(t) = tasks.get_mut(id) else {
                continue;
            };
            if t.forced {
                continue;
            }
            t.forced = true;
            stack.extend_from_slice(&t.before);
            if t.waiting_on == 0 && t.state == TaskState::Waiting {
                t.state = TaskState::Scheduled;
                log::trace!("scheduled task {} {id:?}", t.label);
                self.inner.queue.borrow_mut().push_back(Job::Execute(id));
            }
        }
    }

    /// Mark a task as complete, unblocking everything which happens after it.
    pub fn complete(&self, task: TaskId) {
        self.finish(task, "completed");
    }

    /// Complete a task which has not started executing, without running it.
    ///
    /// Tasks that are already executing are left alone; they complete on their own.
    pub fn retire(&self, task: TaskId) {
        if self.is_executing(task) {
            log::debug!("not retiring {task:?}, it is already executing");
            return;
        }
        self.finish(task, "retired");
    }

    fn finish(&self, task: TaskId, how: &str) {
        let removed = {
            let mut tasks = self.inner.tasks.borrow_mut();
            let Some(t) = tasks.remove(task) else {
                return;
            };
            for &after in &t.after {
                if let Some(a) = tasks.get_mut(after) {
                    a.waiting_on -= 1;
                    a.before.retain(|b| *b != task);
                    if a.waiting_on == 0 && a.forced && a.state == TaskState::Waiting {
                        a.state = TaskState::Scheduled;
                        self.inner.queue.borrow_mut().push_back(Job::Execute(after));
                    }
                }
            }
            for &before in &t.before {
                if let Some(b) = tasks.get_mut(before) {
                    b.after.retain(|a| *a != task);
                }
            }
            t
        };
        if let Some(slot) = &removed.slot {
            if slot.get() == Some(task) {
                slot.set(None);
            }
        }
        // A retired task may still be queued; the stale id is skipped when popped.
        log::trace!("{how} task {} {task:?}", removed.label);
        let Task {
            execute, dispose, ..
        } = removed;
        drop(execute);
        if let Some(dispose) = dispose {
            dispose(self);
        }
    }

    /// Make `task` the producer of `external` until it completes.
    pub fn map_external(&self, external: ExternalId, task: TaskId) {
        self.inner.externals.borrow_mut().insert(external, task);
    }

    pub fn unmap_external(&self, external: ExternalId) {
        self.inner.externals.borrow_mut().remove(&external);
    }

    /// The producer of `external`, if it has not completed yet.
    pub fn producer(&self, external: ExternalId) -> Option<TaskId> {
        let task = *self.inner.externals.borrow().get(&external)?;
        self.is_pending(task).then_some(task)
    }

    /// Queue a continuation to run the next time the scheduler is pumped.
    pub fn schedule(&self, f: impl FnOnce(&Scheduler) + 'static) {
        self.inner
            .queue
            .borrow_mut()
            .push_back(Job::Continue(Box::new(f)));
    }

    /// Create a ticket for one device submission.
    ///
    /// Once the ticket is posted successfully, `f` runs on the host thread
    /// with the downloaded data. A failed submission poisons the scheduler
    /// and `f` never runs.
    pub fn completion(&self, f: impl FnOnce(&Scheduler, Downloads) + 'static) -> Completion {
        let ticket = self.inner.next_ticket.get();
        self.inner.next_ticket.set(ticket + 1);
        self.inner.pending.borrow_mut().insert(ticket, Box::new(f));
        Completion {
            ticket,
            sender: Some(self.inner.sender.clone()),
        }
    }

    /// Run everything which is ready without blocking.
    pub fn yield_now(&self) -> Result<()> {
        loop {
            self.check_poisoned()?;
            self.drain_messages();
            if !self.run_one() {
                break;
            }
        }
        self.check_poisoned()
    }

    /// Pump the scheduler until `pred` returns false.
    ///
    /// This blocks on device completions when nothing is runnable. If nothing
    /// is runnable and nothing is in flight, the wait can never end and
    /// [`Error::Stalled`] is returned.
    pub fn wait_while(&self, label: &'static str, mut pred: impl FnMut() -> bool) -> Result<()> {
        loop {
            self.check_poisoned()?;
            if !pred() {
                return Ok(());
            }
            self.drain_messages();
            self.check_poisoned()?;
            if self.run_one() {
                continue;
            }
            if !self.block_on_message() {
                self.check_poisoned()?;
                log::error!("stalled waiting for {label}");
                return Err(Error::Stalled(label));
            }
        }
    }

    /// Pump the scheduler until nothing is runnable and nothing is in flight.
    ///
    /// Tasks which were never forced are not waited for.
    pub fn wait(&self) -> Result<()> {
        loop {
            self.check_poisoned()?;
            self.drain_messages();
            self.check_poisoned()?;
            if self.run_one() {
                continue;
            }
            if !self.block_on_message() {
                return self.check_poisoned();
            }
        }
    }

    fn check_poisoned(&self) -> Result<()> {
        match &*self.inner.poisoned.borrow() {
            Some(err) => Err(Error::Device(err.clone())),
            None => Ok(()),
        }
    }

    fn drain_messages(&self) {
        while let Ok(message) = self.inner.receiver.try_recv() {
            self.accept(message);
        }
    }

    /// Block until a completion arrives. Returns false if none can arrive.
    fn block_on_message(&self) -> bool {
        if self.in_flight() == 0 {
            return false;
        }
        // The scheduler holds a sender itself, so this cannot disconnect.
        match self.inner.receiver.recv() {
            Ok(message) => {
                self.accept(message);
                true
            }
            Err(_) => false,
        }
    }

    fn accept(&self, (ticket, result): Message) {
        let Some(f) = self.inner.pending.borrow_mut().remove(&ticket) else {
            return;
        };
        match result {
            Ok(downloads) => self.schedule(move |sched| f(sched, downloads)),
            Err(err) => {
                log::error!("device failure: {err}");
                let mut poisoned = self.inner.poisoned.borrow_mut();
                if poisoned.is_none() {
                    *poisoned = Some(err);
                }
            }
        }
    }

    fn run_one(&self) -> bool {
        let Some(job) = self.inner.queue.borrow_mut().pop_front() else {
            return false;
        };
        match job {
            Job::Continue(f) => f(self),
            Job::Execute(id) => {
                let execute = {
                    let mut tasks = self.inner.tasks.borrow_mut();
                    let Some(t) = tasks.get_mut(id) else {
                        return true;
                    };
                    if t.state != TaskState::Scheduled {
                        return true;
                    }
                    t.state = TaskState::Executing;
                    if let Some(slot) = &t.slot {
                        if slot.get() == Some(id) {
                            slot.set(None);
                        }
                    }
                    log::trace!("executing task {} {id:?}", t.label);
                    t.execute.take()
                };
                match execute {
                    Some(execute) => execute(self, id),
                    None => self.complete(id),
                }
            }
        }
        true
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("live_tasks", &self.live_tasks())
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::{ExternalId, Scheduler, TaskSlot};
    use crate::engine::{DeviceError, Downloads};
    use crate::Error;

    fn logger() -> (Rc<RefCell<Vec<&'static str>>>, impl Fn(&'static str) -> Box<dyn Fn()>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let log2 = log.clone();
        (log, move |name| {
            let log = log2.clone();
            Box::new(move || log.borrow_mut().push(name))
        })
    }

    #[test]
    fn lazy_until_forced() {
        let sched = Scheduler::new();
        let (log, entry) = logger();
        let a = entry("a");
        let task = sched
            .task("a")
            .execute(move |s, id| {
                a();
                s.complete(id);
            })
            .build();
        sched.wait().unwrap();
        assert!(log.borrow().is_empty());
        sched.force(task);
        sched.wait().unwrap();
        assert_eq!(*log.borrow(), ["a"]);
        assert!(!sched.is_pending(task));
    }

    #[test]
    fn force_propagates_to_dependencies() {
        let sched = Scheduler::new();
        let (log, entry) = logger();
        let (a, b) = (entry("a"), entry("b"));
        let first = sched
            .task("first")
            .execute(move |s, id| {
                a();
                s.complete(id);
            })
            .build();
        let second = sched
            .task("second")
            .execute(move |s, id| {
                b();
                s.complete(id);
            })
            .build();
        sched.happens_after(second, first);
        sched.force(second);
        sched.wait().unwrap();
        assert_eq!(*log.borrow(), ["a", "b"]);
    }

    #[test]
    fn dependency_on_started_task_is_ignored() {
        let sched = Scheduler::new();
        let (log, entry) = logger();
        let b = entry("b");
        let second = sched
            .task("second")
            .execute(move |s, id| {
                b();
                s.complete(id);
            })
            .build();
        let first = sched.task("first").build();
        // Neither has run yet, since nothing pumped the scheduler.
        sched.force(second);
        // Too late: `second` is already scheduled.
        sched.happens_after(second, first);
        sched.wait().unwrap();
        assert_eq!(*log.borrow(), ["b"]);
        assert!(sched.is_pending(first));
    }

    #[test]
    fn external_nodes_resolve_to_producers() {
        let sched = Scheduler::new();
        let (log, entry) = logger();
        let (p, c) = (entry("producer"), entry("consumer"));
        let raster = ExternalId::next();
        let producer = sched
            .task("producer")
            .execute(move |s, id| {
                p();
                s.complete(id);
            })
            .build();
        sched.map_external(raster, producer);
        let consumer = sched
            .task("consumer")
            .execute(move |s, id| {
                c();
                s.complete(id);
            })
            .build();
        sched.happens_after(consumer, raster);
        sched.force(consumer);
        sched.wait().unwrap();
        assert_eq!(*log.borrow(), ["producer", "consumer"]);
        assert_eq!(sched.producer(raster), None);
    }

    #[test]
    fn unmapped_external_adds_no_edge() {
        let sched = Scheduler::new();
        let task = sched.task("t").build();
        sched.happens_after(task, ExternalId::next());
        sched.force(task);
        sched.wait().unwrap();
        assert!(!sched.is_pending(task));
    }

    #[test]
    fn slot_cleared_when_execution_starts() {
        let sched = Scheduler::new();
        let slot = TaskSlot::default();
        let seen = Rc::new(RefCell::new(None));
        let seen2 = seen.clone();
        let slot2 = slot.clone();
        let task = sched
            .task("t")
            .invalidates(&slot)
            .execute(move |s, id| {
                *seen2.borrow_mut() = Some(slot2.get());
                s.complete(id);
            })
            .build();
        assert_eq!(slot.get(), Some(task));
        sched.force(task);
        sched.wait().unwrap();
        assert_eq!(*seen.borrow(), Some(None));
    }

    #[test]
    fn retire_unblocks_dependents_and_disposes() {
        let sched = Scheduler::new();
        let (log, entry) = logger();
        let (d, b) = (entry("disposed"), entry("b"));
        let lazy = sched
            .task("lazy")
            .execute(|_, _| panic!("retired tasks never run"))
            .dispose(move |_| d())
            .build();
        let after = sched
            .task("after")
            .execute(move |s, id| {
                b();
                s.complete(id);
            })
            .build();
        sched.happens_after(after, lazy);
        sched.retire(lazy);
        sched.force(after);
        sched.wait().unwrap();
        assert_eq!(*log.borrow(), ["disposed", "b"]);
        assert_eq!(sched.live_tasks(), 0);
    }

    #[test]
    fn completions_posted_from_another_thread() {
        let sched = Scheduler::new();
        let result = Rc::new(RefCell::new(None));
        let result2 = result.clone();
        let completion = sched.completion(move |_, downloads: Downloads| {
            *result2.borrow_mut() = Some(downloads.is_empty());
        });
        let handle = std::thread::spawn(move || completion.post(Ok(Downloads::default())));
        sched.wait_while("completion", || result.borrow().is_none()).unwrap();
        handle.join().unwrap();
        assert_eq!(*result.borrow(), Some(true));
    }

    #[test]
    fn device_failure_poisons() {
        let sched = Scheduler::new();
        let completion = sched.completion(|_, _| panic!("failed submissions never continue"));
        completion.post(Err(DeviceError::MissingResource("keys")));
        assert_eq!(
            sched.wait(),
            Err(Error::Device(DeviceError::MissingResource("keys")))
        );
        assert!(sched.yield_now().is_err());
    }

    #[test]
    fn dropped_completion_counts_as_lost() {
        let sched = Scheduler::new();
        drop(sched.completion(|_, _| {}));
        assert_eq!(sched.wait(), Err(Error::Device(DeviceError::Lost)));
    }

    #[test]
    fn device_failure_beats_stall() {
        let sched = Scheduler::new();
        let task = sched.task("lazy").build();
        sched
            .completion(|_, _| {})
            .post(Err(DeviceError::OutOfBounds("keys", "sort")));
        assert_eq!(
            sched.wait_while("lazy task", || sched.is_pending(task)),
            Err(Error::Device(DeviceError::OutOfBounds("keys", "sort")))
        );
    }

    #[test]
    fn waiting_on_unforced_work_stalls() {
        let sched = Scheduler::new();
        let task = sched.task("lazy").build();
        assert_eq!(
            sched.wait_while("lazy task", || sched.is_pending(task)),
            Err(Error::Stalled("lazy task"))
        );
    }
}
