//! 阶段运行时上下文 (Stage Context)
//!
//! 维护单个测试阶段内并发任务间的共享状态、并发配额及进度统计。

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::core::error::{PilotError, Result};
use crate::core::event::{EventSender, PilotEvent};
use crate::probe::ProgressFn;

/// 阶段执行上下文
///
/// 可被克隆进每个节点任务，所有克隆共享同一组计数器。
#[derive(Clone)]
pub struct StageContext {
    /// 并发控制信号量
    pub semaphore: Arc<Semaphore>,
    /// 本阶段节点总数
    pub total: usize,
    /// 原子计数：已完成的节点数
    pub completed: Arc<AtomicUsize>,
    /// 事件分发句柄
    pub events: Option<EventSender>,
    pub cancel: CancellationToken,
}

impl StageContext {
    pub fn new(
        concurrency: usize,
        total: usize,
        events: Option<EventSender>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            total,
            completed: Arc::new(AtomicUsize::new(0)),
            events,
            cancel,
        }
    }

    /// 向事件总线推送消息
    pub fn emit(&self, event: PilotEvent) {
        if let Some(ref sender) = self.events {
            sender.emit(event);
        }
    }

    /// 记一个节点完成并推送进度
    pub fn tick(&self) -> usize {
        let done = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
        self.emit(PilotEvent::Progress {
            completed: done,
            total: self.total,
        });
        done
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn check_cancel(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(PilotError::Canceled)
        } else {
            Ok(())
        }
    }

    /// 供批量探测函数使用的进度回调
    pub fn progress_fn(&self) -> ProgressFn {
        let events = self.events.clone();
        Arc::new(move |completed, total| {
            if let Some(ref sender) = events {
                sender.progress(completed, total);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::create_event_channel;

    #[test]
    fn clones_share_progress() {
        let (tx, rx) = create_event_channel();
        let ctx = StageContext::new(2, 3, Some(tx), CancellationToken::new());
        let other = ctx.clone();

        ctx.tick();
        other.tick();
        assert_eq!(ctx.completed(), 2);

        let last = rx.drain().pop();
        assert!(matches!(
            last,
            Some(PilotEvent::Progress {
                completed: 2,
                total: 3
            })
        ));
    }

    #[test]
    fn cancellation_is_reported_as_error() {
        let ctx = StageContext::new(1, 0, None, CancellationToken::new());
        assert!(ctx.check_cancel().is_ok());
        ctx.cancel.cancel();
        assert!(ctx.check_cancel().unwrap_err().is_canceled());
    }
}
