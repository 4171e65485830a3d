//! 按需唤醒的后台线程
//!
//! 线程平时睡在 [`Event`] 上，每次被唤醒执行一轮工作。RBIN 堆的页池维护和
//! 各个堆的延迟释放都由它驱动。

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use event_listener::{Event, Listener};

use super::error::{IonError, IonResult};

/// 后台线程与唤醒者之间共享的状态
#[derive(Default)]
struct DaemonShared {
    wake: Event,
    idle: Event,
    requested: AtomicBool,
    running: AtomicBool,
    shutdown: AtomicBool,
    passes: AtomicUsize,
}

/// 一个睡眠直到被唤醒、每次唤醒执行一轮的后台线程
///
/// 多次唤醒在线程忙碌时合并为一轮。析构时通知线程退出并等待它结束。
pub(crate) struct ReclaimDaemon {
    shared: Arc<DaemonShared>,
    thread: Option<JoinHandle<()>>,
}

impl ReclaimDaemon {
    pub(crate) fn spawn<F>(name: &str, pass: F) -> IonResult<Self>
    where
        F: Fn() + Send + 'static,
    {
        let shared = Arc::new(DaemonShared::default());
        let thread = thread::Builder::new()
            .name(name.into())
            .spawn({
                let shared = shared.clone();
                move || Self::run(&shared, pass)
            })
            .map_err(|err| {
                error!("failed to spawn {}: {}", name, err);
                IonError::NoMemory
            })?;
        info!("{} started", name);
        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    fn run(shared: &DaemonShared, pass: impl Fn()) {
        loop {
            shared.running.store(true, Ordering::SeqCst);
            if shared.requested.swap(false, Ordering::SeqCst) {
                pass();
                shared.passes.fetch_add(1, Ordering::SeqCst);
            }
            shared.running.store(false, Ordering::SeqCst);
            shared.idle.notify(usize::MAX);

            let listener = shared.wake.listen();
            if shared.shutdown.load(Ordering::SeqCst) {
                break;
            }
            if shared.requested.load(Ordering::SeqCst) {
                continue;
            }
            listener.wait();
        }
    }

    pub(crate) fn wake(&self) {
        self.shared.requested.store(true, Ordering::SeqCst);
        self.shared.wake.notify(usize::MAX);
    }

    /// 等待线程处理完所有已经发出的唤醒
    pub(crate) fn wait_idle(&self) {
        loop {
            let listener = self.shared.idle.listen();
            let busy = self.shared.requested.load(Ordering::SeqCst)
                || self.shared.running.load(Ordering::SeqCst);
            if !busy || self.thread.as_ref().is_none_or(JoinHandle::is_finished) {
                return;
            }
            listener.wait();
        }
    }

    pub(crate) fn passes(&self) -> usize {
        self.shared.passes.load(Ordering::SeqCst)
    }
}

impl Drop for ReclaimDaemon {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.wake.notify(usize::MAX);
        let Some(thread) = self.thread.take() else {
            return;
        };
        // 在自己的线程上析构时不能等待自己
        if thread.thread().id() == thread::current().id() {
            return;
        }
        if thread.join().is_err() {
            error!("reclaim daemon panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wakes_coalesce_into_passes() {
        let count = Arc::new(AtomicUsize::new(0));
        let daemon = ReclaimDaemon::spawn("counter", {
            let count = count.clone();
            move || {
                count.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();
        daemon.wait_idle();
        assert_eq!(daemon.passes(), 0);

        daemon.wake();
        daemon.wait_idle();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        for _ in 0..8 {
            daemon.wake();
        }
        daemon.wait_idle();
        let passes = daemon.passes();
        assert!((2..=9).contains(&passes));
        assert_eq!(count.load(Ordering::SeqCst), passes);
    }

    #[test]
    fn drop_stops_the_thread() {
        let daemon = ReclaimDaemon::spawn("idle", || {}).unwrap();
        daemon.wake();
        drop(daemon);
    }
}
