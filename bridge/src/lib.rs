use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int, c_void};
use std::ptr;

use fiberloop::{await_host_call, FiberHandle, Scheduler, SchedulerConfig, StackPoolConfig};
use tracing::warn;

pub type TaskEntry = extern "C" fn(user_data: *mut c_void);
pub type RegisterEntry = extern "C" fn(handle: *mut FiberHandle, user_data: *mut c_void);

thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

/// A pointer travelling through the scheduler. The C side owns what it
/// points to.
struct UserData(*mut c_void);

fn set_last_error(e: impl std::fmt::Display) {
    let msg = CString::new(e.to_string().replace('\0', " ")).unwrap_or_default();
    LAST_ERROR.with(|cell| *cell.borrow_mut() = Some(msg));
}

#[no_mangle]
pub extern "C" fn fl_scheduler_new() -> *mut Scheduler {
    Box::into_raw(Box::new(Scheduler::new_default()))
}

#[no_mangle]
pub extern "C" fn fl_scheduler_new_with_config(
    stack_size: usize,
    max_pool_size: usize,
) -> *mut Scheduler {
    Box::into_raw(Box::new(Scheduler::new(SchedulerConfig {
        stack_pool: StackPoolConfig {
            default_stack_size: stack_size,
            max_pool_size,
        },
    })))
}

#[no_mangle]
pub unsafe extern "C" fn fl_scheduler_destroy(sch: *mut Scheduler) {
    if !sch.is_null() {
        drop(Box::from_raw(sch));
    }
}

/// Queues `entry(user_data)` to run as a task. Returns the fiber id.
#[no_mangle]
pub extern "C" fn fl_scheduler_enqueue(
    sch: &Scheduler,
    entry: TaskEntry,
    user_data: *mut c_void,
) -> u64 {
    let user_data = UserData(user_data);
    sch.enqueue(move || {
        let user_data = user_data;
        entry(user_data.0);
        Ok(())
    })
    .as_u64()
}

/// Drains the run queue. Returns the number of transfers, or -1 when called
/// from inside a task.
#[no_mangle]
pub extern "C" fn fl_scheduler_run_next(sch: &Scheduler) -> isize {
    fl_scheduler_run_once(sch, usize::MAX)
}

#[no_mangle]
pub extern "C" fn fl_scheduler_run_once(sch: &Scheduler, max_run_count: usize) -> isize {
    match sch.run_once(max_run_count) {
        Ok(n) => n as isize,
        Err(e) => {
            set_last_error(e);
            -1
        }
    }
}

#[no_mangle]
pub extern "C" fn fl_scheduler_pending(sch: &Scheduler) -> usize {
    sch.len()
}

/// Blocks the calling task until its handle is resumed.
///
/// `register` receives an owned handle that must be passed to exactly one of
/// `fl_resume`, `fl_resume_error` or `fl_handle_destroy`. Returns the value
/// given to `fl_resume`, or null on failure with the reason available from
/// `fl_last_error`.
#[no_mangle]
pub extern "C" fn fl_await_host(register: RegisterEntry, user_data: *mut c_void) -> *mut c_void {
    let result = await_host_call::<UserData, _>(|handle| {
        register(Box::into_raw(Box::new(handle)), user_data);
    });
    match result {
        Ok(v) => v.0,
        Err(e) => {
            set_last_error(format!("{:#}", e));
            ptr::null_mut()
        }
    }
}

/// Takes ownership of a handle given out by `fl_await_host`.
unsafe fn take_handle(handle: *mut FiberHandle) -> Option<FiberHandle> {
    if handle.is_null() {
        set_last_error("null fiber handle");
        return None;
    }
    Some(*Box::from_raw(handle))
}

/// Resumes the task parked on `handle` so that `fl_await_host` returns
/// `value`. Consumes the handle. Returns 0, or -1 on failure.
#[no_mangle]
pub unsafe extern "C" fn fl_resume(
    sch: &Scheduler,
    handle: *mut FiberHandle,
    value: *mut c_void,
) -> c_int {
    let handle = match take_handle(handle) {
        Some(h) => h,
        None => return -1,
    };
    match sch.resume_with(handle, UserData(value)) {
        Ok(()) => 0,
        Err(e) => {
            set_last_error(e);
            -1
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn fl_resume_error(
    sch: &Scheduler,
    handle: *mut FiberHandle,
    message: *const c_char,
) -> c_int {
    let handle = match take_handle(handle) {
        Some(h) => h,
        None => return -1,
    };
    let message = if message.is_null() {
        "host call failed".to_string()
    } else {
        CStr::from_ptr(message).to_string_lossy().into_owned()
    };
    match sch.resume_with_error(handle, anyhow::Error::msg(message)) {
        Ok(()) => 0,
        Err(e) => {
            set_last_error(e);
            -1
        }
    }
}

/// Gives up on a handle without resuming it. The waiting task is discarded.
#[no_mangle]
pub unsafe extern "C" fn fl_handle_destroy(handle: *mut FiberHandle) {
    if !handle.is_null() {
        let handle = Box::from_raw(handle);
        warn!(fiber = %handle.id(), "handle destroyed without resuming");
    }
}

/// The last error on this thread, or null. Valid until the next failing call.
#[no_mangle]
pub extern "C" fn fl_last_error() -> *const c_char {
    LAST_ERROR.with(|cell| match *cell.borrow() {
        Some(ref msg) => msg.as_ptr(),
        None => ptr::null(),
    })
}
