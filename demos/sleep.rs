extern crate fiberloop;

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use fiberloop::{HostDriver, Scheduler};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let driver = HostDriver::new(Scheduler::current())?;
    let done_count = Rc::new(Cell::new(0));

    for (name, ms) in [("1", 500u64), ("2", 250)] {
        let host = driver.host();
        let done_count = done_count.clone();
        driver.scheduler().enqueue(move || {
            println!("Begin {}", name);
            host.sleep(Duration::from_millis(ms))?;
            println!("End {}", name);
            done_count.set(done_count.get() + 1);
            Ok(())
        });
    }

    driver.scheduler().enqueue(|| {
        println!("Queued after both sleepers, runs before either wakes");
        Ok(())
    });

    driver.run()?;
    println!("{} sleepers done", done_count.get());
    Ok(())
}
