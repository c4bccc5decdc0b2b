use std::any::Any;
use std::cell::Cell;
use std::fmt;
use std::ptr::NonNull;

use corosensei::{Coroutine, CoroutineResult, Yielder};

use crate::error::SchedulerError;
use crate::handle::FiberHandle;
use crate::stack::Stack;

/// A type-erased resumption payload.
pub type Value = Box<dyn Any>;

/// The work a task fiber runs to completion.
pub type TaskBody = Box<dyn FnOnce() -> anyhow::Result<()>>;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct FiberId(pub(crate) u64);

impl FiberId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fiber#{}", self.0)
    }
}

/// What a fiber receives when control is transferred into it.
pub enum Resumption {
    Value(Value),
    /// Raised at the point where the fiber suspended.
    Error(anyhow::Error),
}

impl Resumption {
    pub fn unit() -> Resumption {
        Resumption::Value(Box::new(()))
    }
}

impl fmt::Debug for Resumption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resumption::Value(_) => f.write_str("Value(..)"),
            Resumption::Error(e) => f.debug_tuple("Error").field(e).finish(),
        }
    }
}

/// How a transfer into a fiber came back.
pub enum Transfer {
    /// The fiber is waiting on a host call; the handle is its resume ticket.
    Suspended(FiberHandle),
    Finished(TaskExit),
}

pub enum TaskExit {
    Completed,
    Failed(anyhow::Error),
}

type Inner = Coroutine<Resumption, FiberHandle, TaskExit, Stack>;

/// The state of a fiber.
///
/// Must not be accessed by the fiber itself.
pub struct CoState {
    id: FiberId,
    inner: Inner,
}

/// A fiber's view of itself. Lives on the fiber's own stack for as long as
/// its body runs.
struct FiberContext {
    id: FiberId,
    yielder: NonNull<Yielder<Resumption, FiberHandle>>,
    // Whatever was current before control entered this fiber.
    outer: Cell<Option<NonNull<FiberContext>>>,
}

thread_local! {
    static CURRENT: Cell<Option<NonNull<FiberContext>>> = const { Cell::new(None) };
}

struct Active<'a> {
    ctx: &'a FiberContext,
}

impl<'a> Active<'a> {
    fn enter(ctx: &'a FiberContext) -> Active<'a> {
        ctx.outer
            .set(CURRENT.with(|c| c.replace(Some(NonNull::from(ctx)))));
        Active { ctx }
    }
}

impl<'a> Drop for Active<'a> {
    fn drop(&mut self) {
        let me = NonNull::from(self.ctx);
        CURRENT.with(|c| {
            // A fiber unwound while parked is no longer the current one.
            if c.get() == Some(me) {
                c.set(self.ctx.outer.take());
            }
        });
    }
}

impl CoState {
    pub fn new(id: FiberId, stack: Stack, body: TaskBody) -> CoState {
        let inner = Coroutine::with_stack(
            stack,
            move |yielder: &Yielder<Resumption, FiberHandle>, first: Resumption| {
                let ctx = FiberContext {
                    id,
                    yielder: NonNull::from(yielder),
                    outer: Cell::new(None),
                };
                let _active = Active::enter(&ctx);

                if let Resumption::Error(e) = first {
                    return TaskExit::Failed(e);
                }
                match body() {
                    Ok(()) => TaskExit::Completed,
                    Err(e) => TaskExit::Failed(e),
                }
            },
        );

        CoState { id, inner }
    }

    pub fn id(&self) -> FiberId {
        self.id
    }

    /// Transfers control into the fiber until it suspends or finishes.
    ///
    /// A panic in the fiber body propagates out of this call. Transferring
    /// into a finished fiber panics.
    pub fn transfer(&mut self, resumption: Resumption) -> Transfer {
        match self.inner.resume(resumption) {
            CoroutineResult::Yield(handle) => Transfer::Suspended(handle),
            CoroutineResult::Return(exit) => Transfer::Finished(exit),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.inner.done()
    }

    /// Gives back the stack of a fiber that is not suspended.
    ///
    /// Returns `None` for a suspended fiber, which is then discarded.
    pub fn take_stack(self) -> Option<Stack> {
        if self.inner.started() && !self.inner.done() {
            return None;
        }
        Some(self.inner.into_stack())
    }
}

impl fmt::Debug for CoState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoState")
            .field("id", &self.id)
            .field("started", &self.inner.started())
            .field("done", &self.inner.done())
            .finish()
    }
}

/// The fiber control is currently inside of, if any.
pub fn current_fiber() -> Option<FiberId> {
    CURRENT.with(|c| c.get()).map(|ctx| unsafe { ctx.as_ref() }.id)
}

/// Suspends the current fiber, handing `handle` to whoever transferred into
/// it, and returns the resumption delivered on the next transfer.
pub(crate) fn suspend_current(handle: FiberHandle) -> Result<Resumption, SchedulerError> {
    let ptr = CURRENT
        .with(|c| c.get())
        .ok_or(SchedulerError::NotInFiber)?;
    // The context outlives every suspension: it is only dropped when the
    // fiber body returns or unwinds.
    let ctx = unsafe { ptr.as_ref() };

    CURRENT.with(|c| c.set(ctx.outer.take()));
    let resumption = unsafe { ctx.yielder.as_ref() }.suspend(handle);
    ctx.outer.set(CURRENT.with(|c| c.replace(Some(ptr))));

    Ok(resumption)
}
