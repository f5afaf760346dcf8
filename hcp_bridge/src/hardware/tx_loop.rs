//! 周期性的后台发送循环。
//!
//! 每个设备同一时刻最多只有一次发送在进行；上一次还没写完时到期的节拍直接跳过（计数），不会排队。

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct TxCounters {
    in_flight: AtomicBool,
    completed: AtomicU64,
    skipped: AtomicU64,
}

pub struct TxLoop {
    name: String,
    counters: Arc<TxCounters>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl TxLoop {
    /// 以 `period` 为周期启动发送循环。`cancel` 被取消或调用 `stop` 后循环结束。
    pub fn spawn<F, Fut>(name: impl Into<String>, period: Duration, cancel: CancellationToken, tick: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let counters = Arc::new(TxCounters::default());
        let handle = tokio::spawn(run(name.clone(), period, counters.clone(), cancel.clone(), tick));
        info!("[发送循环 {}] 已启动，周期 {:?}", name, period);
        Self {
            name,
            counters,
            cancel,
            handle: Some(handle),
        }
    }

    /// 已完成的发送次数
    pub fn completed(&self) -> u64 {
        self.counters.completed.load(Ordering::SeqCst)
    }

    /// 因上一次发送未完成而跳过的节拍数
    pub fn skipped(&self) -> u64 {
        self.counters.skipped.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// 停止循环并等待它退出。正在进行的那一次发送会被放弃。
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        info!(
            "[发送循环 {}] 已停止 (完成 {} 次，跳过 {} 次)",
            self.name,
            self.completed(),
            self.skipped()
        );
    }
}

impl Drop for TxLoop {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run<F, Fut>(name: String, period: Duration, counters: Arc<TxCounters>, cancel: CancellationToken, tick: F)
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        if counters
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            counters.skipped.fetch_add(1, Ordering::SeqCst);
            continue;
        }

        let fut = tick();
        let counters = counters.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = fut => {
                    counters.completed.fetch_add(1, Ordering::SeqCst);
                }
            }
            counters.in_flight.store(false, Ordering::SeqCst);
        });
    }
    debug!("[发送循环 {}] 循环已退出", name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn test_slow_ticks_are_skipped_not_queued() {
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));
        let tx_loop = {
            let active = active.clone();
            let max_active = max_active.clone();
            TxLoop::spawn("test", Duration::from_millis(10), CancellationToken::new(), move || {
                let active = active.clone();
                let max_active = max_active.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_active.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(35)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                }
            })
        };

        tokio::time::sleep(Duration::from_millis(205)).await;
        assert_eq!(max_active.load(Ordering::SeqCst), 1);
        assert!(tx_loop.completed() >= 3, "completed = {}", tx_loop.completed());
        assert!(tx_loop.skipped() >= 6, "skipped = {}", tx_loop.skipped());
        tx_loop.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_loop() {
        let count = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let tx_loop = {
            let count = count.clone();
            TxLoop::spawn("cancel", Duration::from_millis(10), cancel.clone(), move || {
                let count = count.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                }
            })
        };
        tokio::time::sleep(Duration::from_millis(55)).await;
        cancel.cancel();
        assert!(!tx_loop.is_running());
        tokio::time::sleep(Duration::from_millis(5)).await;
        let after_cancel = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), after_cancel);
        tx_loop.stop().await;
    }
}
