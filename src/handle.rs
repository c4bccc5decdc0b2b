use std::cell::RefCell;
use std::fmt;
use std::mem;
use std::rc::Rc;

use crate::co::{CoState, FiberId, Resumption};
use crate::error::SchedulerError;

enum Slot {
    /// Handed to the host; the fiber has not finished suspending yet.
    Pending,
    /// Resumed before the fiber got to suspend.
    Woken(Resumption),
    /// Suspended by the scheduler with the given id.
    Parked(CoState, u64),
    /// The one resumption has been delivered.
    Spent,
}

/// A one-shot ticket for resuming a fiber that awaits a host call.
///
/// While the fiber is parked the handle owns it. Dropping every clone of a
/// parked handle discards the fiber, unwinding its stack.
#[derive(Clone)]
pub struct FiberHandle {
    id: FiberId,
    slot: Rc<RefCell<Slot>>,
}

impl FiberHandle {
    pub(crate) fn new(id: FiberId) -> FiberHandle {
        FiberHandle {
            id,
            slot: Rc::new(RefCell::new(Slot::Pending)),
        }
    }

    pub fn id(&self) -> FiberId {
        self.id
    }

    /// Whether the fiber is suspended and waiting for this handle.
    pub fn is_parked(&self) -> bool {
        matches!(*self.slot.borrow(), Slot::Parked(..))
    }

    /// Stores the suspended fiber on behalf of scheduler `owner`. If a
    /// resumption already arrived, both are handed back to be queued.
    ///
    /// A handle that was already used cannot hold the fiber. The fiber is
    /// handed back with a `NotSuspended` error to raise where it suspended.
    pub(crate) fn park(self, co: CoState, owner: u64) -> Option<(CoState, Resumption)> {
        let mut slot = self.slot.borrow_mut();
        match mem::replace(&mut *slot, Slot::Spent) {
            Slot::Pending => {
                if Rc::strong_count(&self.slot) == 1 {
                    warn!(fiber = %self.id, "no host holds the handle of a suspended fiber; discarding it");
                }
                *slot = Slot::Parked(co, owner);
                None
            }
            Slot::Woken(resumption) => Some((co, resumption)),
            prev @ (Slot::Parked(..) | Slot::Spent) => {
                *slot = prev;
                warn!(fiber = %co.id(), "suspended on a handle that was already used");
                let err = SchedulerError::NotSuspended(co.id());
                Some((co, Resumption::Error(err.into())))
            }
        }
    }

    /// Delivers a resumption through scheduler `owner`. Returns the fiber if
    /// it is parked and ready to be transferred into.
    pub(crate) fn wake(
        self,
        owner: u64,
        resumption: Resumption,
    ) -> Result<Option<(CoState, Resumption)>, SchedulerError> {
        let mut slot = self.slot.borrow_mut();
        match mem::replace(&mut *slot, Slot::Spent) {
            Slot::Parked(co, o) if o == owner => Ok(Some((co, resumption))),
            Slot::Pending => {
                *slot = Slot::Woken(resumption);
                Ok(None)
            }
            prev @ Slot::Parked(..) => {
                *slot = prev;
                Err(SchedulerError::ForeignHandle(self.id))
            }
            prev @ (Slot::Woken(_) | Slot::Spent) => {
                *slot = prev;
                Err(SchedulerError::NotSuspended(self.id))
            }
        }
    }
}

impl fmt::Debug for FiberHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match *self.slot.borrow() {
            Slot::Pending => "pending",
            Slot::Woken(_) => "woken",
            Slot::Parked(..) => "parked",
            Slot::Spent => "spent",
        };
        f.debug_struct("FiberHandle")
            .field("id", &self.id)
            .field("state", &state)
            .finish()
    }
}
