use anyhow::Result;
use static_assertions::{assert_impl_all, assert_not_impl_any};
use std::cell::Cell;
use std::io::Write;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use crate as arbor;
use crate::runtime::{Blocker, Builder, Handle, Interest, ParkSelector, Scheduler};
use crate::sync::{LimitedQueue, PriorityQueue, Promise, Queue};
use crate::task::Task;
use crate::time::sleep;
use crate::utils::tracker::{Call, Method};
use crate::Error;

// Reachable from other threads.
assert_impl_all!(Handle: Send, Sync);
assert_impl_all!(Blocker: Send, Sync);
assert_impl_all!(Queue<u32>: Send, Sync);
assert_impl_all!(LimitedQueue<u32>: Send, Sync);
assert_impl_all!(PriorityQueue<u32>: Send, Sync);
assert_impl_all!(Promise<u32>: Send, Sync);

// Bound to the scheduler's thread.
assert_not_impl_any!(Scheduler: Send, Sync);
assert_not_impl_any!(Task: Send, Sync);

#[test]
fn test_run_once_without_work() -> Result<()> {
    let scheduler = Builder::new().try_build()?;
    assert!(!scheduler.run_once(Some(Duration::ZERO))?);
    scheduler.close()?;
    assert!(scheduler.is_closed());
    Ok(())
}

#[test]
fn test_block_on_returns_entry_value() -> Result<()> {
    let value = Builder::new().try_build()?.block_on(|task| async move {
        let child = task.spawn(|t| async move {
            sleep(&t, Duration::from_millis(1)).await?;
            Ok(20)
        });
        Ok(child.wait(&task).await?.unwrap_or_default() + 1)
    })?;

    assert_eq!(value, 21);
    Ok(())
}

#[test]
fn test_block_on_surfaces_failure() -> Result<()> {
    let res = Builder::new()
        .try_build()?
        .block_on(|_| async { Err::<(), _>(Error::failed("boom")) });

    assert!(matches!(res, Err(Error::Failed(_))));
    Ok(())
}

#[test]
fn test_transient_child_does_not_keep_loop_alive() -> Result<()> {
    let scheduler = Builder::new().try_build()?;

    let transient = scheduler
        .spawn_builder()
        .transient()
        .spawn(|t| async move { sleep(&t, Duration::from_secs(60)).await });
    let durable = scheduler.spawn(|t| async move {
        sleep(&t, Duration::from_millis(1)).await?;
        Ok(7)
    });

    scheduler.run()?;
    assert_eq!(durable.result(), Some(7));
    assert!(transient.is_running());

    scheduler.close()?;
    assert!(transient.is_stopped());
    Ok(())
}

#[test]
fn test_interrupt_from_other_thread() -> Result<()> {
    let scheduler = Builder::new().try_build()?;
    let sleeper = scheduler.spawn(|t| async move { sleep(&t, Duration::from_secs(60)).await });

    let handle = scheduler.handle();
    let interrupter = thread::spawn(move || {
        thread::sleep(Duration::from_millis(5));
        handle.interrupt();
    });

    assert_eq!(scheduler.run(), Err(Error::Interrupted));
    interrupter.join().expect("interrupter panicked");
    assert!(sleeper.is_running());

    scheduler.close()?;
    assert!(sleeper.is_stopped());
    assert!(scheduler.handle().is_closed());
    Ok(())
}

#[test]
fn test_close_reports_leaked_block() -> Result<()> {
    let scheduler = Builder::new().try_build()?;

    scheduler.spawn(|t| async move {
        let scheduler = t.scheduler()?;
        let mut block = Box::pin(scheduler.block(&t, None));
        assert!(futures::poll!(block.as_mut()).is_pending());
        std::mem::forget(block);
        Ok(())
    });

    assert_eq!(scheduler.close(), Err(Error::BlockedOnClose { blocked: 1 }));
    assert!(!scheduler.is_closed());
    Ok(())
}

#[test]
fn test_close_clears_pending_interrupt() -> Result<()> {
    let scheduler = Builder::new().try_build()?;
    let sleeper = scheduler.spawn(|t| async move { sleep(&t, Duration::from_secs(60)).await });

    scheduler.interrupt();
    scheduler.close()?;
    assert!(sleeper.is_stopped());
    assert!(scheduler.is_closed());
    assert_eq!(scheduler.run(), Ok(()));
    Ok(())
}

#[test]
fn test_unblock_after_close_is_noop() -> Result<()> {
    let scheduler = Builder::new().selector(ParkSelector::new()).try_build()?;

    let blocker = Rc::new(Cell::new(None));
    let b = Rc::clone(&blocker);
    let blocked = scheduler.spawn(move |t| async move {
        let scheduler = t.scheduler()?;
        let block = scheduler.block(&t, None);
        b.set(Some(block.blocker()));
        block.await
    });

    scheduler.close()?;
    assert!(blocked.is_stopped());

    let blocker = blocker.take().expect("blocker handed out");
    blocker.unblock();
    assert!(!blocker.is_unblocked());
    Ok(())
}

#[arbor::test]
async fn test_block_unblocked_from_thread(task: Task) -> Result<()> {
    let scheduler = task.scheduler()?;
    let block = scheduler.block(&task, None);

    let blocker = block.blocker();
    let releaser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(2));
        blocker.unblock();
    });

    assert!(block.await?);
    releaser.join().expect("releaser panicked");
    Ok(())
}

#[arbor::test]
async fn test_block_timeout(task: Task) -> Result<()> {
    let scheduler = task.scheduler()?;
    assert!(!scheduler.block(&task, Some(Duration::from_millis(2))).await?);
    assert_eq!(scheduler.core().num_timers(), 0);
    Ok(())
}

#[arbor::test]
async fn test_after_runs_unless_cancelled(task: Task) -> Result<()> {
    let scheduler = task.scheduler()?;
    let fired = Rc::new(Cell::new(0));

    let f = Rc::clone(&fired);
    let timer = scheduler.after(Duration::from_millis(1), move || f.set(f.get() + 1));
    assert!(timer.is_pending());

    let f = Rc::clone(&fired);
    let cancelled = scheduler.after(Duration::from_millis(1), move || f.set(f.get() + 10));
    cancelled.cancel();
    assert!(!cancelled.is_pending());

    sleep(&task, Duration::from_millis(5)).await?;
    assert_eq!(fired.get(), 1);
    assert!(!timer.is_pending());
    Ok(())
}

#[arbor::test]
async fn test_io_wait(task: Task) -> Result<()> {
    let scheduler = task.scheduler()?;
    let (reader, mut writer) = UnixStream::pair()?;

    let producer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(2));
        writer.write_all(b"x")
    });

    let ready = scheduler
        .io_wait(&task, reader.as_raw_fd(), Interest::READABLE, None)
        .await?;
    assert_eq!(ready, Some(Interest::READABLE));
    producer.join().expect("producer panicked")?;

    let (idle, _other) = UnixStream::pair()?;
    let ready = scheduler
        .io_wait(&task, idle.as_raw_fd(), Interest::READABLE, Some(Duration::from_millis(2)))
        .await?;
    assert_eq!(ready, None);
    Ok(())
}

#[arbor::test]
async fn test_stop_self_later(task: Task) -> Result<()> {
    let child = task.spawn(|t| async move {
        // Current task, so this only schedules the stop.
        t.stop(true)?;
        sleep(&t, Duration::from_secs(60)).await
    });
    assert!(child.is_running());

    child.wait(&task).await?;
    assert!(child.is_stopped());

    let scheduler = task.scheduler()?;
    let calls = scheduler.core().tracker.get_calls(&Method::StopLater);
    assert_eq!(calls, vec![Call::StopLater { id: child.id() }]);
    Ok(())
}

#[arbor::test]
async fn test_stop_self_now(task: Task) -> Result<()> {
    let reached = Rc::new(Cell::new(false));

    let r = Rc::clone(&reached);
    let child = task.spawn(move |t| async move {
        t.stop(false)?;
        r.set(true);
        Ok(())
    });

    assert!(child.is_stopped());
    assert!(!reached.get());
    Ok(())
}

#[arbor::test]
async fn test_load_stays_in_range(task: Task) -> Result<()> {
    let scheduler = task.scheduler()?;

    for _ in 0..5 {
        sleep(&task, Duration::from_millis(1)).await?;
        let load = scheduler.load();
        assert!((0.0..=1.0).contains(&load), "load out of range: {load}");
    }
    Ok(())
}
