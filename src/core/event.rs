//! 事件系统定义
//!
//! 用于测试管线与终端 UI 之间的解耦通信

use flume::{Receiver, Sender};
use serde::Serialize;
use strum::Display;

/// 自动测试阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum AutoTestStage {
    Idle,
    FetchNodes,
    UrlTest,
    LatencyTest,
    FilterLatency,
    BandwidthTest,
    FilterBandwidth,
    UnlockTest,
    Done,
    Canceled,
    Failed,
}

impl AutoTestStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Canceled | Self::Failed)
    }
}

/// 阶段进度快照
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageProgress {
    pub stage: AutoTestStage,
    pub message: String,
    pub completed: usize,
    pub total: usize,
}

/// 管线事件类型
#[derive(Debug, Clone)]
pub enum PilotEvent {
    /// 进入新阶段
    StageChanged(StageProgress),

    /// 阶段内进度
    Progress { completed: usize, total: usize },

    /// 单节点测量完成
    NodeMeasured {
        node_id: String,
        name: String,
        detail: String,
    },

    /// 带宽瞬时采样
    BandwidthSample { node_id: String, mbps: f64 },

    /// 管线完成
    Finished { summary: String },

    /// 管线失败
    Failed { error: String },

    /// 管线被取消
    Canceled,

    /// 日志消息（用于 UI 显示）
    Log { level: LogLevel, message: String },
}

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// 事件发送器
#[derive(Clone)]
pub struct EventSender {
    tx: Sender<PilotEvent>,
}

impl EventSender {
    pub fn new(tx: Sender<PilotEvent>) -> Self {
        Self { tx }
    }

    /// 发送事件
    pub fn emit(&self, event: PilotEvent) {
        let _ = self.tx.send(event);
    }

    pub fn stage(&self, stage: AutoTestStage, message: impl Into<String>, total: usize) {
        self.emit(PilotEvent::StageChanged(StageProgress {
            stage,
            message: message.into(),
            completed: 0,
            total,
        }));
    }

    pub fn progress(&self, completed: usize, total: usize) {
        self.emit(PilotEvent::Progress { completed, total });
    }

    pub fn node_measured(&self, node_id: &str, name: &str, detail: impl Into<String>) {
        self.emit(PilotEvent::NodeMeasured {
            node_id: node_id.to_string(),
            name: name.to_string(),
            detail: detail.into(),
        });
    }

    /// 发送日志事件
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.emit(PilotEvent::Log {
            level,
            message: message.into(),
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message);
    }
}

/// 事件接收器
pub struct EventReceiver {
    rx: Receiver<PilotEvent>,
}

impl EventReceiver {
    pub fn new(rx: Receiver<PilotEvent>) -> Self {
        Self { rx }
    }

    /// 非阻塞接收事件
    pub fn try_recv(&self) -> Option<PilotEvent> {
        self.rx.try_recv().ok()
    }

    /// 异步接收事件
    pub async fn recv_async(&self) -> Option<PilotEvent> {
        self.rx.recv_async().await.ok()
    }

    /// 取出当前已缓冲的全部事件
    pub fn drain(&self) -> Vec<PilotEvent> {
        self.rx.drain().collect()
    }
}

/// 创建事件通道
pub fn create_event_channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = flume::unbounded();
    (EventSender::new(tx), EventReceiver::new(rx))
}
