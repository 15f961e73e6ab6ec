//! 终端进度渲染引擎 (Terminal UI Progress Engine)
//!
//! 基于 `indicatif` 实现非阻塞式进度条编排，随测试阶段切换同步刷新。

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use parking_lot::RwLock;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::core::event::{AutoTestStage, EventReceiver, PilotEvent};

/// 全局 TUI 容器 (Singleton)
static MULTI: OnceLock<MultiProgress> = OnceLock::new();

/// 获取全局进度容器实例
pub fn get_multi() -> &'static MultiProgress {
    MULTI.get_or_init(MultiProgress::new)
}

/// TUI 状态容器
#[derive(Default)]
pub struct UiState {
    /// 全局阶段状态条
    main_bar: Option<ProgressBar>,
    /// 阶段内节点进度条
    stage_bar: Option<ProgressBar>,
}

static STATE: OnceLock<Arc<RwLock<UiState>>> = OnceLock::new();

fn get_state() -> &'static Arc<RwLock<UiState>> {
    STATE.get_or_init(|| Arc::new(RwLock::new(UiState::default())))
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{spinner:.cyan} [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
}

fn stage_icon(stage: AutoTestStage) -> &'static str {
    match stage {
        AutoTestStage::FetchNodes => "📥",
        AutoTestStage::UrlTest | AutoTestStage::LatencyTest => "📡",
        AutoTestStage::BandwidthTest => "🚀",
        AutoTestStage::UnlockTest => "🔓",
        AutoTestStage::FilterLatency | AutoTestStage::FilterBandwidth => "🧹",
        _ => "•",
    }
}

/// 进度协调器 (Progress Orchestrator)
pub struct Ui;

impl Ui {
    /// 激活事件监听循环，启动异步渲染管线
    pub fn run(receiver: EventReceiver) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = receiver.recv_async().await {
                Self::handle_event(event);
            }
        })
    }

    /// 执行 UI 状态转换与渲染更新
    fn handle_event(event: PilotEvent) {
        let multi = get_multi();
        let state = get_state();
        let mut ui = state.write();

        match event {
            PilotEvent::StageChanged(p) if p.stage.is_terminal() => {
                if let Some(bar) = ui.stage_bar.take() {
                    bar.finish_and_clear();
                }
                if let Some(ref bar) = ui.main_bar {
                    match p.stage {
                        AutoTestStage::Done => bar.finish_with_message(format!("✅ {}", p.message)),
                        _ => bar.abandon_with_message(format!("❌ {}", p.message)),
                    }
                }
            }
            PilotEvent::StageChanged(p) => {
                let main = ui.main_bar.get_or_insert_with(|| {
                    let bar = multi.add(ProgressBar::new_spinner());
                    bar.set_style(spinner_style());
                    bar.enable_steady_tick(Duration::from_millis(100));
                    bar
                });
                main.set_message(format!("{} {}", stage_icon(p.stage), p.message));

                if let Some(bar) = ui.stage_bar.take() {
                    bar.finish_and_clear();
                }
                if p.total > 0 {
                    let bar = multi.add(ProgressBar::new(p.total as u64));
                    bar.set_style(bar_style());
                    ui.stage_bar = Some(bar);
                }
            }
            PilotEvent::Progress { completed, total } => {
                if let Some(ref bar) = ui.stage_bar {
                    bar.set_length(total as u64);
                    bar.set_position(completed as u64);
                }
            }
            PilotEvent::NodeMeasured { name, detail, .. } => {
                if let Some(ref bar) = ui.stage_bar {
                    bar.set_message(format!("{} {}", truncate_string(&name, 24), detail));
                }
            }
            PilotEvent::BandwidthSample { mbps, .. } => {
                if let Some(ref bar) = ui.stage_bar {
                    bar.set_message(format!("{:.1} Mbps", mbps));
                }
            }
            _ => {}
        }
    }
}

/// 执行语义化字符串截断
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", truncated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_by_characters() {
        assert_eq!(truncate_string("香港 01", 10), "香港 01");
        assert_eq!(truncate_string("🇯🇵 日本东京高速节点", 8), "🇯🇵 日本...");
    }
}
