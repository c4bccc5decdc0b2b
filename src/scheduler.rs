use std::any::{type_name, Any};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::co::{self, CoState, FiberId, Resumption, TaskBody, TaskExit, Transfer};
use crate::error::SchedulerError;
use crate::handle::FiberHandle;
use crate::stack_pool::{StackPool, StackPoolConfig};

#[derive(Clone, Debug, Default)]
pub struct SchedulerConfig {
    pub stack_pool: StackPoolConfig,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SchedulerStats {
    pub spawned: u64,
    pub completed: u64,
    /// Tasks that returned an error nobody caught.
    pub failed: u64,
    pub panicked: u64,
    pub suspensions: u64,
}

enum Runnable {
    /// Enqueued but never transferred into. The fiber is created on dispatch.
    Fresh(FiberId, TaskBody),
    /// Resumed by the host while something else was running.
    Woken(CoState, Resumption),
}

struct SharedSchedState {
    id: u64,
    free_stacks: StackPool,
    scheduled: VecDeque<Runnable>,
    next_id: u64,
    stats: SchedulerStats,
}

/// A FIFO scheduler of cooperative fibers.
///
/// `Scheduler` is a cheap handle; clones share the same queue. It is bound to
/// the thread it was created on.
///
/// The resume entry points trust their callers: every suspension must be
/// paired with exactly one resume on the handle it produced. A second resume
/// is rejected with [`SchedulerError::NotSuspended`], and a handle that is
/// never resumed keeps its fiber parked for as long as the handle lives.
#[derive(Clone)]
pub struct Scheduler {
    state: Rc<RefCell<SharedSchedState>>,
}

static NEXT_SCHEDULER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_SCHEDULER: Scheduler = Scheduler::new_default();
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Scheduler {
        Scheduler {
            state: Rc::new(RefCell::new(SharedSchedState {
                id: NEXT_SCHEDULER_ID.fetch_add(1, Ordering::Relaxed),
                free_stacks: StackPool::new(config.stack_pool),
                scheduled: VecDeque::new(),
                next_id: 0,
                stats: SchedulerStats::default(),
            })),
        }
    }

    pub fn new_default() -> Scheduler {
        Scheduler::new(SchedulerConfig::default())
    }

    /// The scheduler of the current thread, created on first use.
    pub fn current() -> Scheduler {
        CURRENT_SCHEDULER.with(|s| s.clone())
    }

    /// Appends a task to the run queue. Nothing runs until the run loop is
    /// driven.
    pub fn enqueue<F>(&self, f: F) -> FiberId
    where
        F: FnOnce() -> anyhow::Result<()> + 'static,
    {
        let mut state = self.state.borrow_mut();
        state.next_id += 1;
        state.stats.spawned += 1;
        let id = FiberId(state.next_id);
        state.scheduled.push_back(Runnable::Fresh(id, Box::new(f)));
        debug!(fiber = %id, queued = state.scheduled.len(), "task enqueued");
        id
    }

    /// Runs queued tasks in FIFO order until the queue is empty.
    ///
    /// An empty queue is idle, not an error. Returns the number of transfers.
    pub fn run_next(&self) -> Result<usize, SchedulerError> {
        self.run_once(usize::MAX)
    }

    /// Like [`run_next`](Scheduler::run_next), but stops after
    /// `max_run_count` transfers.
    pub fn run_once(&self, max_run_count: usize) -> Result<usize, SchedulerError> {
        if let Some(id) = co::current_fiber() {
            return Err(SchedulerError::Reentrant(id));
        }

        let mut ran = 0;
        while ran < max_run_count {
            let next = self.state.borrow_mut().scheduled.pop_front();
            let next = match next {
                Some(v) => v,
                None => break,
            };
            ran += 1;

            match next {
                Runnable::Fresh(id, body) => self.start(id, body),
                Runnable::Woken(co, resumption) => self.dispatch(co, resumption),
            }
        }
        Ok(ran)
    }

    /// Resumes the fiber parked on `handle`.
    ///
    /// A parked fiber belongs to the scheduler that ran it. Resuming it
    /// through any other scheduler fails with
    /// [`SchedulerError::ForeignHandle`] and leaves it parked.
    pub fn resume(&self, handle: FiberHandle) -> Result<(), SchedulerError> {
        self.deliver(handle, Resumption::unit())
    }

    /// Resumes the fiber so that its pending host call returns `value`.
    pub fn resume_with<T: Any>(&self, handle: FiberHandle, value: T) -> Result<(), SchedulerError> {
        self.deliver(handle, Resumption::Value(Box::new(value)))
    }

    /// Resumes the fiber so that its pending host call fails with `err`.
    pub fn resume_with_error<E>(&self, handle: FiberHandle, err: E) -> Result<(), SchedulerError>
    where
        E: Into<anyhow::Error>,
    {
        self.deliver(handle, Resumption::Error(err.into()))
    }

    /// See [`await_host_call`].
    pub fn await_host_call<T, F>(register: F) -> anyhow::Result<T>
    where
        T: Any,
        F: FnOnce(FiberHandle),
    {
        await_host_call(register)
    }

    /// Number of queued tasks.
    pub fn len(&self) -> usize {
        self.state.borrow().scheduled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Nothing queued and nothing running.
    pub fn is_idle(&self) -> bool {
        self.is_empty() && co::current_fiber().is_none()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.state.borrow().stats
    }

    /// Idle stacks kept for reuse.
    pub fn pooled_stacks(&self) -> usize {
        self.state.borrow().free_stacks.len()
    }

    fn deliver(&self, handle: FiberHandle, resumption: Resumption) -> Result<(), SchedulerError> {
        let id = handle.id();
        let owner = self.state.borrow().id;
        let (co, resumption) = match handle.wake(owner, resumption) {
            Ok(Some(v)) => v,
            Ok(None) => {
                debug!(fiber = %id, "resumed before suspending");
                return Ok(());
            }
            Err(e) => {
                warn!(fiber = %id, "rejected resume: {}", e);
                return Err(e);
            }
        };

        if co::current_fiber().is_some() {
            debug!(fiber = %id, "resumed from inside a fiber; queued");
            self.state
                .borrow_mut()
                .scheduled
                .push_back(Runnable::Woken(co, resumption));
            return Ok(());
        }

        debug!(fiber = %id, "resuming");
        self.dispatch(co, resumption);
        self.run_next().map(|_| ())
    }

    fn start(&self, id: FiberId, body: TaskBody) {
        let stack = self.state.borrow().free_stacks.get();
        match stack {
            Ok(stack) => self.dispatch(CoState::new(id, stack, body), Resumption::unit()),
            Err(e) => {
                let e = SchedulerError::from(e);
                error!(fiber = %id, "{}", e);
                self.state.borrow_mut().stats.failed += 1;
            }
        }
    }

    fn dispatch(&self, mut co: CoState, resumption: Resumption) {
        let id = co.id();
        let result = catch_unwind(AssertUnwindSafe(|| co.transfer(resumption)));

        match result {
            Ok(Transfer::Suspended(handle)) => {
                let owner = {
                    let mut state = self.state.borrow_mut();
                    state.stats.suspensions += 1;
                    state.id
                };
                debug!(fiber = %id, "suspended awaiting host");
                if let Some((co, resumption)) = handle.park(co, owner) {
                    self.state
                        .borrow_mut()
                        .scheduled
                        .push_back(Runnable::Woken(co, resumption));
                }
            }
            Ok(Transfer::Finished(exit)) => {
                match exit {
                    TaskExit::Completed => {
                        self.state.borrow_mut().stats.completed += 1;
                        debug!(fiber = %id, "task finished");
                    }
                    TaskExit::Failed(e) => {
                        self.state.borrow_mut().stats.failed += 1;
                        warn!(fiber = %id, "task failed: {:#}", e);
                    }
                }
                if let Some(stack) = co.take_stack() {
                    self.state.borrow().free_stacks.put(stack);
                }
            }
            Err(payload) => {
                self.state.borrow_mut().stats.panicked += 1;
                error!(fiber = %id, "Error in coroutine: {}", panic_message(&*payload));
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

/// Blocks the current task until a host operation resumes it.
///
/// `register` receives the handle of the current fiber and must arrange for
/// exactly one later call to [`Scheduler::resume`],
/// [`Scheduler::resume_with`] or [`Scheduler::resume_with_error`] on it. The
/// fiber then suspends and the run loop moves on to the next queued task.
///
/// Returns the resumption value, or the resumption error exactly as the host
/// delivered it.
pub fn await_host_call<T, F>(register: F) -> anyhow::Result<T>
where
    T: Any,
    F: FnOnce(FiberHandle),
{
    let id = co::current_fiber().ok_or(SchedulerError::NotInFiber)?;
    let handle = FiberHandle::new(id);
    register(handle.clone());

    match co::suspend_current(handle)? {
        Resumption::Value(v) => match v.downcast::<T>() {
            Ok(v) => Ok(*v),
            Err(_) => Err(SchedulerError::UnexpectedValue {
                expected: type_name::<T>(),
            }
            .into()),
        },
        Resumption::Error(e) => Err(e),
    }
}
