#[macro_use]
extern crate criterion;
extern crate fiberloop;

use std::cell::RefCell;
use std::rc::Rc;

use criterion::Criterion;
use fiberloop::{await_host_call, FiberHandle, Scheduler};

fn bench_run(c: &mut Criterion) {
    let sched = Scheduler::new_default();
    c.bench_function("enqueue_and_run", |b| {
        b.iter(|| {
            sched.enqueue(|| Ok(()));
            sched.run_next().unwrap();
        })
    });
}

fn bench_suspend_resume(c: &mut Criterion) {
    let sched = Scheduler::new_default();
    let slot: Rc<RefCell<Option<FiberHandle>>> = Rc::new(RefCell::new(None));
    {
        let slot = slot.clone();
        sched.enqueue(move || loop {
            let stop: bool = await_host_call(|h| *slot.borrow_mut() = Some(h))?;
            if stop {
                return Ok(());
            }
        });
    }
    sched.run_next().unwrap();

    c.bench_function("suspend_resume", |b| {
        b.iter(|| {
            let h = slot.borrow_mut().take().unwrap();
            sched.resume_with(h, false).unwrap();
        })
    });

    let h = slot.borrow_mut().take().unwrap();
    sched.resume_with(h, true).unwrap();
    assert!(slot.borrow().is_none());
}

criterion_group!(benches, bench_run, bench_suspend_resume);
criterion_main!(benches);
