//! An outer driver loop that runs host operations on a current-thread tokio
//! runtime and resumes the fibers waiting on them.

use std::cell::{Cell, RefCell};
use std::mem;
use std::future::Future;
use std::io;
use std::rc::Rc;
use std::time::Duration;

use tokio::runtime::{Builder, Runtime};
use tokio::sync::Notify;
use tokio::task::LocalSet;

use crate::error::SchedulerError;
use crate::handle::FiberHandle;
use crate::scheduler::{await_host_call, Scheduler};

struct Inflight {
    count: Cell<usize>,
    done: Notify,
    /// Fibers blocked in `Host::await_all`.
    waiting: RefCell<Vec<FiberHandle>>,
}

/// Decrements the in-flight count even if the host future is dropped early.
struct InflightGuard(Rc<Inflight>);

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.0.count.set(self.0.count.get() - 1);
        self.0.done.notify_one();
    }
}

pub struct HostDriver {
    scheduler: Scheduler,
    runtime: Runtime,
    inflight: Rc<Inflight>,
}

/// What tasks use to issue host calls. Only usable from fibers that run
/// inside [`HostDriver::run`].
#[derive(Clone)]
pub struct Host {
    scheduler: Scheduler,
    inflight: Rc<Inflight>,
}

impl HostDriver {
    pub fn new(scheduler: Scheduler) -> io::Result<HostDriver> {
        let runtime = Builder::new_current_thread().enable_time().build()?;
        Ok(HostDriver {
            scheduler,
            runtime,
            inflight: Rc::new(Inflight {
                count: Cell::new(0),
                done: Notify::new(),
                waiting: RefCell::new(Vec::new()),
            }),
        })
    }

    pub fn host(&self) -> Host {
        Host {
            scheduler: self.scheduler.clone(),
            inflight: self.inflight.clone(),
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Drains the scheduler, then keeps waiting for host operations and
    /// draining again until no task is queued, no host operation is in flight
    /// and no fiber is blocked in [`Host::await_all`].
    ///
    /// Loops instead of waiting once so that tasks may issue several host
    /// calls in a row, and so that tasks enqueued by other tasks are picked up.
    pub fn run(&self) -> Result<(), SchedulerError> {
        let local = LocalSet::new();
        local.block_on(&self.runtime, async {
            loop {
                self.scheduler.run_next()?;
                if self.inflight.count.get() > 0 {
                    self.inflight.done.notified().await;
                    continue;
                }

                let waiting = mem::take(&mut *self.inflight.waiting.borrow_mut());
                if waiting.is_empty() {
                    break;
                }
                debug!(fibers = waiting.len(), "host work settled; resuming waiters");
                for handle in waiting {
                    let id = handle.id();
                    if let Err(e) = self.scheduler.resume(handle) {
                        warn!(fiber = %id, "could not resume waiter: {}", e);
                    }
                }
            }
            debug!("host driver idle");
            Ok::<(), SchedulerError>(())
        })
    }
}

impl Host {
    /// Blocks the current task on `fut`. Resumes with its `Ok` value or raises
    /// its `Err` at the call site.
    pub fn call<T, E, F>(&self, fut: F) -> anyhow::Result<T>
    where
        T: 'static,
        E: Into<anyhow::Error> + 'static,
        F: Future<Output = Result<T, E>> + 'static,
    {
        await_host_call(|handle| {
            let scheduler = self.scheduler.clone();
            self.spawn(async move {
                let id = handle.id();
                let delivered = match fut.await {
                    Ok(v) => scheduler.resume_with(handle, v),
                    Err(e) => scheduler.resume_with_error(handle, e),
                };
                if let Err(e) = delivered {
                    warn!(fiber = %id, "host call finished but its fiber could not be resumed: {}", e);
                }
            })
        })
    }

    pub fn sleep(&self, duration: Duration) -> anyhow::Result<()> {
        self.call(async move {
            tokio::time::sleep(duration).await;
            Ok::<(), anyhow::Error>(())
        })
    }

    /// Runs `f` on the blocking thread pool. The fiber is resumed on the
    /// driver thread once `f` returns.
    pub fn call_blocking<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        self.call(async move {
            match tokio::task::spawn_blocking(f).await {
                Ok(r) => r,
                Err(e) => Err(anyhow::Error::new(e)),
            }
        })
    }

    /// Blocks the current task until every host operation issued through
    /// this driver has completed and the run queue has drained.
    ///
    /// Host calls issued after this one, by any task, are waited for too.
    pub fn await_all(&self) -> anyhow::Result<()> {
        await_host_call(|handle| self.inflight.waiting.borrow_mut().push(handle))
    }

    /// Number of host operations that have not completed yet.
    pub fn in_flight(&self) -> usize {
        self.inflight.count.get()
    }

    fn spawn<F: Future<Output = ()> + 'static>(&self, fut: F) {
        self.inflight.count.set(self.inflight.count.get() + 1);
        let guard = InflightGuard(self.inflight.clone());
        tokio::task::spawn_local(async move {
            let _guard = guard;
            fut.await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    type Log = Rc<RefCell<Vec<String>>>;

    fn driver() -> HostDriver {
        HostDriver::new(Scheduler::new_default()).unwrap()
    }

    #[test]
    fn idle_driver_should_return() {
        let d = driver();
        d.run().unwrap();
        assert!(d.scheduler().is_idle());
    }

    #[test]
    fn sleeping_tasks_should_finish_in_duration_order() {
        let d = driver();
        let log: Log = Rc::new(RefCell::new(Vec::new()));

        for (name, ms) in [("1", 80u64), ("2", 10)] {
            let (host, log) = (d.host(), log.clone());
            d.scheduler().enqueue(move || {
                log.borrow_mut().push(format!("begin {}", name));
                host.sleep(Duration::from_millis(ms))?;
                log.borrow_mut().push(format!("end {}", name));
                Ok(())
            });
        }

        d.run().unwrap();
        assert_eq!(
            *log.borrow(),
            vec!["begin 1", "begin 2", "end 2", "end 1"]
        );
        assert_eq!(d.host().in_flight(), 0);
    }

    #[test]
    fn task_should_make_several_host_calls() {
        let d = driver();
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        {
            let (host, log) = (d.host(), log.clone());
            d.scheduler().enqueue(move || {
                host.sleep(Duration::from_millis(5))?;
                log.borrow_mut().push("do 1".to_string());
                host.sleep(Duration::from_millis(5))?;
                log.borrow_mut().push("do 2".to_string());
                Ok(())
            });
        }

        d.run().unwrap();
        assert_eq!(*log.borrow(), vec!["do 1", "do 2"]);
        assert_eq!(d.scheduler().stats().completed, 1);
    }

    #[test]
    fn failing_host_call_should_raise_at_await() {
        let d = driver();
        let msg = Rc::new(RefCell::new(None));
        {
            let (host, msg) = (d.host(), msg.clone());
            d.scheduler().enqueue(move || {
                let r: anyhow::Result<u32> =
                    host.call(async { Err(io::Error::new(io::ErrorKind::Other, "device gone")) });
                let e = r.unwrap_err();
                assert!(e.downcast_ref::<io::Error>().is_some());
                *msg.borrow_mut() = Some(e.to_string());
                Ok(())
            });
        }

        d.run().unwrap();
        assert_eq!(msg.borrow().as_deref(), Some("device gone"));
    }

    #[test]
    fn blocking_call_should_resume_with_value() {
        let d = driver();
        let got = Rc::new(Cell::new(0));
        {
            let (host, got) = (d.host(), got.clone());
            d.scheduler().enqueue(move || {
                got.set(host.call_blocking(|| Ok(21 * 2))?);
                Ok(())
            });
        }

        d.run().unwrap();
        assert_eq!(got.get(), 42);
    }

    #[test]
    fn await_all_should_wait_for_outstanding_host_calls() {
        let d = driver();
        let log: Log = Rc::new(RefCell::new(Vec::new()));

        for (name, ms) in [("slow", 40u64), ("fast", 5)] {
            let (host, log) = (d.host(), log.clone());
            d.scheduler().enqueue(move || {
                host.sleep(Duration::from_millis(ms))?;
                log.borrow_mut().push(format!("{} done", name));
                Ok(())
            });
        }
        {
            let (host, log) = (d.host(), log.clone());
            d.scheduler().enqueue(move || {
                log.borrow_mut().push("waiting".to_string());
                host.await_all()?;
                assert_eq!(host.in_flight(), 0);
                log.borrow_mut().push("all settled".to_string());
                host.sleep(Duration::from_millis(5))?;
                log.borrow_mut().push("slept after".to_string());
                Ok(())
            });
        }

        d.run().unwrap();
        assert_eq!(
            *log.borrow(),
            vec!["waiting", "fast done", "slow done", "all settled", "slept after"]
        );
        assert_eq!(d.scheduler().stats().completed, 3);
    }

    #[test]
    fn await_all_without_host_work_should_resume() {
        let d = driver();
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        for name in ["first", "second"] {
            let (host, log) = (d.host(), log.clone());
            d.scheduler().enqueue(move || {
                host.await_all()?;
                log.borrow_mut().push(name.to_string());
                Ok(())
            });
        }

        d.run().unwrap();
        assert_eq!(*log.borrow(), vec!["first", "second"]);
        assert!(d.scheduler().is_idle());
    }

    #[test]
    fn tasks_spawned_during_host_wait_should_run() {
        let d = driver();
        let log: Log = Rc::new(RefCell::new(Vec::new()));
        {
            let (host, log, sched) = (d.host(), log.clone(), d.scheduler().clone());
            d.scheduler().enqueue(move || {
                host.sleep(Duration::from_millis(5))?;
                let log2 = log.clone();
                sched.enqueue(move || {
                    log2.borrow_mut().push("spawned".to_string());
                    Ok(())
                });
                log.borrow_mut().push("woke".to_string());
                Ok(())
            });
        }

        d.run().unwrap();
        assert_eq!(*log.borrow(), vec!["woke", "spawned"]);
    }
}
