//! 自动化测试调度器 (Automated Test Orchestrator)
//!
//! 阶段严格顺序执行：获取节点 -> 延迟 -> 延迟筛选 -> 带宽 -> 带宽筛选 -> 解锁 -> 完成。
//! 每个阶段都可由偏好模式关闭；任一阶段出错进入 FAILED，取消进入 CANCELED，
//! 两种情况下已取得的测量结果都保留在节点存储中。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::actors::store::{Measurement, NodeStore};
use crate::core::config::AppConfig;
use crate::core::error::{PilotError, Result};
use crate::core::event::{AutoTestStage, EventSender, PilotEvent};
use crate::core::model::{AutoTestStatus, NodeRecord};
use crate::core::prefer::{LatencyMode, TestPreferMode};
use crate::probe::bandwidth::{MB, SampleFn};
use crate::probe::{BandwidthProbe, LatencyResult, UnlockReport, UnlockRunner, probe_all, url_test_all};
use crate::utils::singbox::CoreLauncher;
use crate::utils::subscription::NodeSource;

use super::context::StageContext;
use super::selector::{rank_by_latency, sample, select_best};
use super::session::MeasurementSessionManager;

/// 单次带宽测试的客户端超时
const BANDWIDTH_TIMEOUT: Duration = Duration::from_secs(60);

/// 一次自动测试的结果
#[derive(Debug, Clone)]
pub struct AutoTestReport {
    /// `Done`、`Canceled` 或 `Failed`
    pub outcome: AutoTestStage,
    pub message: String,
    pub total: usize,
    pub latency_passed: usize,
    pub bandwidth_passed: usize,
    pub unlock_passed: usize,
    /// 最后一个完成阶段后仍在候选中的节点
    pub nodes: Vec<NodeRecord>,
    pub best: Option<NodeRecord>,
}

#[derive(Default)]
struct RunState {
    total: usize,
    latency_passed: usize,
    bandwidth_passed: usize,
    unlock_passed: usize,
    nodes: Vec<NodeRecord>,
}

/// 自动测试调度器
pub struct AutoTestOrchestrator {
    config: Arc<AppConfig>,
    store: NodeStore,
    source: Option<Arc<dyn NodeSource>>,
    sessions: Arc<MeasurementSessionManager>,
    unlock: UnlockRunner,
    events: Option<EventSender>,
    cancel: CancellationToken,
}

impl AutoTestOrchestrator {
    pub fn new(config: Arc<AppConfig>, store: NodeStore, launcher: Arc<dyn CoreLauncher>) -> Self {
        let sessions = Arc::new(MeasurementSessionManager::new(
            launcher,
            config.probe.unlock_concurrency,
        ));
        let unlock = UnlockRunner::new(
            &config.probe.unlock_bin,
            Duration::from_secs(config.probe.unlock_timeout_secs),
        );
        Self {
            config,
            store,
            source: None,
            sessions,
            unlock,
            events: None,
            cancel: CancellationToken::new(),
        }
    }

    /// 设置 FETCH_NODES 阶段的节点来源；未设置时直接使用已保存的节点
    pub fn with_source(mut self, source: Arc<dyn NodeSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn emit(&self, event: PilotEvent) {
        if let Some(ref sender) = self.events {
            sender.emit(event);
        }
    }

    fn enter(&self, stage: AutoTestStage, message: impl Into<String>, total: usize) {
        let message = message.into();
        info!("[{}] {}", stage, message);
        if let Some(ref sender) = self.events {
            sender.stage(stage, message, total);
        }
    }

    fn stage_context(&self, concurrency: usize, total: usize) -> StageContext {
        StageContext::new(concurrency, total, self.events.clone(), self.cancel.clone())
    }

    fn check_cancel(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(PilotError::Canceled)
        } else {
            Ok(())
        }
    }

    /// 执行完整流程，总是返回报告而不是错误
    pub async fn run(&self, mode: &TestPreferMode) -> AutoTestReport {
        let mode = mode.clone().normalized();
        let mut state = RunState::default();
        info!("开始自动测试 (模式: {})", mode.name);

        let (outcome, message) = match self.execute(&mode, &mut state).await {
            Ok(()) => (
                AutoTestStage::Done,
                format!(
                    "测试完成: 共 {} 个节点，延迟通过 {}，带宽通过 {}，解锁通过 {}",
                    state.total, state.latency_passed, state.bandwidth_passed, state.unlock_passed
                ),
            ),
            Err(e) if e.is_canceled() => {
                self.sessions.release_all().await;
                (AutoTestStage::Canceled, "测试已取消".to_string())
            }
            Err(e) => {
                self.sessions.release_all().await;
                error!("自动测试失败: {}", e);
                (AutoTestStage::Failed, format!("测试失败: {}", e))
            }
        };

        // 保留已有的测量结果
        if let Ok(fresh) = self.refresh(&state.nodes).await {
            state.nodes = fresh;
        }

        let best = match outcome {
            AutoTestStage::Done => select_best(
                &state.nodes,
                mode.default_priority,
                mode.unlock_priority_mode,
                &mode.unlock_priority_target_site_ids,
            )
            .cloned(),
            _ => None,
        };

        self.enter(outcome, message.clone(), state.total);
        match outcome {
            AutoTestStage::Done => self.emit(PilotEvent::Finished {
                summary: message.clone(),
            }),
            AutoTestStage::Canceled => self.emit(PilotEvent::Canceled),
            _ => self.emit(PilotEvent::Failed {
                error: message.clone(),
            }),
        }

        AutoTestReport {
            outcome,
            message,
            total: state.total,
            latency_passed: state.latency_passed,
            bandwidth_passed: state.bandwidth_passed,
            unlock_passed: state.unlock_passed,
            nodes: state.nodes,
            best,
        }
    }

    async fn execute(&self, mode: &TestPreferMode, state: &mut RunState) -> Result<()> {
        // 1. 获取节点
        self.fetch_nodes(state).await?;
        self.check_cancel()?;

        // 2. 延迟与筛选
        if mode.latency_enabled {
            self.latency_stage(mode, state).await?;
            self.check_cancel()?;
            self.filter_latency(mode, state).await?;
        } else {
            state.latency_passed = state.nodes.len();
        }
        self.check_cancel()?;

        // 3. 昂贵阶段之前采样
        if mode.bandwidth_active() || mode.unlock_enabled {
            let before = state.nodes.len();
            state.nodes = sample(
                std::mem::take(&mut state.nodes),
                mode.node_limit,
                mode.by_region,
            );
            if state.nodes.len() < before {
                info!("采样 {} / {} 个节点进入后续测试", state.nodes.len(), before);
            }
        }

        // 4. 带宽与筛选
        if mode.bandwidth_active() {
            self.bandwidth_stage(mode, state).await?;
            self.check_cancel()?;
            self.filter_bandwidth(mode, state).await?;
        } else {
            state.bandwidth_passed = state.nodes.len();
        }
        self.check_cancel()?;

        // 5. 解锁
        if mode.unlock_enabled {
            self.unlock_stage(state).await?;
        }
        self.check_cancel()
    }

    /// 按原有顺序从存储重新读取节点
    async fn refresh(&self, nodes: &[NodeRecord]) -> Result<Vec<NodeRecord>> {
        let mut by_id: HashMap<String, NodeRecord> = self
            .store
            .list()
            .await?
            .into_iter()
            .map(|n| (n.id.clone(), n))
            .collect();
        Ok(nodes.iter().filter_map(|n| by_id.remove(&n.id)).collect())
    }

    async fn fetch_nodes(&self, state: &mut RunState) -> Result<()> {
        self.enter(AutoTestStage::FetchNodes, "正在获取节点列表", 0);

        if let Some(source) = &self.source {
            match source.fetch_nodes().await {
                Ok(nodes) if !nodes.is_empty() => {
                    let count = self.store.replace(nodes).await?;
                    info!("订阅已更新: {} 个节点", count);
                }
                Ok(_) => warn!("订阅中没有解析出节点，使用已保存的节点"),
                Err(e) => warn!("获取订阅失败，使用已保存的节点: {}", e),
            }
        }

        self.store.reset_status().await?;
        state.nodes = self.store.list().await?;
        state.total = state.nodes.len();
        if state.nodes.is_empty() {
            return Err(PilotError::Custom("没有可测试的节点".to_string()));
        }
        Ok(())
    }

    async fn latency_stage(&self, mode: &TestPreferMode, state: &mut RunState) -> Result<()> {
        let nodes = state.nodes.clone();

        let results = match mode.latency_mode {
            LatencyMode::UrlTest => match self.url_test(&nodes).await {
                Ok(r) => r,
                Err(e) if e.is_canceled() => return Err(e),
                Err(e) => {
                    warn!("URL 测试不可用，改用 TCPing: {}", e);
                    self.tcping(&nodes).await
                }
            },
            LatencyMode::Tcping => self.tcping(&nodes).await,
        };
        self.check_cancel()?;

        let names: HashMap<&str, &str> = nodes
            .iter()
            .map(|n| (n.id.as_str(), n.name.as_str()))
            .collect();
        for r in &results {
            if let Some(ref sender) = self.events {
                let name = names.get(r.node_id.as_str()).copied().unwrap_or_default();
                let detail = match r.latency.millis() {
                    Some(ms) => format!("{}ms", ms),
                    None => "超时".to_string(),
                };
                sender.node_measured(&r.node_id, name, detail);
            }
        }

        self.store
            .update(
                results
                    .into_iter()
                    .map(|r| (r.node_id, Measurement::Latency(r.latency)))
                    .collect(),
            )
            .await?;
        state.nodes = self.refresh(&nodes).await?;
        Ok(())
    }

    async fn url_test(&self, nodes: &[NodeRecord]) -> Result<Vec<LatencyResult>> {
        self.enter(
            AutoTestStage::UrlTest,
            format!("正在进行 URL 测试 ({} 个节点)", nodes.len()),
            nodes.len(),
        );
        let singbox = &self.config.singbox;
        let session = self
            .sessions
            .acquire_url_test(
                nodes,
                singbox.headless_api_port,
                singbox.bind_interface.as_deref(),
                &self.cancel,
            )
            .await?;

        let probe = &self.config.probe;
        let ctx = self.stage_context(probe.url_concurrency, nodes.len());
        let results = url_test_all(
            session.core(),
            nodes,
            probe.url_concurrency,
            &probe.test_url,
            probe.url_timeout_ms,
            &self.cancel,
            Some(ctx.progress_fn()),
        )
        .await;
        self.sessions.release(session).await;
        Ok(results)
    }

    async fn tcping(&self, nodes: &[NodeRecord]) -> Vec<LatencyResult> {
        self.enter(
            AutoTestStage::LatencyTest,
            format!("正在进行 TCPing ({} 个节点)", nodes.len()),
            nodes.len(),
        );
        let probe = &self.config.probe;
        let ctx = self.stage_context(probe.tcp_concurrency, nodes.len());
        probe_all(
            nodes,
            probe.tcp_concurrency,
            probe.tcp_timeout_ms,
            &self.cancel,
            Some(ctx.progress_fn()),
        )
        .await
    }

    /// 按结论标注节点；仅在开启过滤时移除未通过者
    async fn apply_filter(
        &self,
        state: &mut RunState,
        filter: bool,
        passes: impl Fn(&NodeRecord) -> bool,
        statuses: (AutoTestStatus, AutoTestStatus),
    ) -> Result<usize> {
        let (passed, failed): (Vec<&NodeRecord>, Vec<&NodeRecord>) =
            state.nodes.iter().partition(|n| passes(*n));
        let passed_ids: Vec<String> = passed.iter().map(|n| n.id.clone()).collect();
        let failed_ids: Vec<String> = failed.iter().map(|n| n.id.clone()).collect();

        self.store.set_status(&passed_ids, statuses.0).await?;
        self.store.set_status(&failed_ids, statuses.1).await?;

        let count = passed_ids.len();
        if filter {
            state.nodes.retain(|n| passed_ids.contains(&n.id));
        }
        state.nodes = self.refresh(&state.nodes).await?;
        Ok(count)
    }

    async fn filter_latency(&self, mode: &TestPreferMode, state: &mut RunState) -> Result<()> {
        let threshold = mode.latency_threshold_ms;
        self.enter(
            AutoTestStage::FilterLatency,
            format!("筛选延迟不高于 {}ms 的节点", threshold),
            state.nodes.len(),
        );

        state.latency_passed = self
            .apply_filter(
                state,
                mode.filter_unavailable,
                |n| n.latency.millis().is_some_and(|ms| ms <= threshold),
                (AutoTestStatus::LatencyPassed, AutoTestStatus::LatencyFiltered),
            )
            .await?;
        rank_by_latency(&mut state.nodes);
        info!("延迟通过 {} / {}", state.latency_passed, state.total);
        Ok(())
    }

    async fn bandwidth_stage(&self, mode: &TestPreferMode, state: &mut RunState) -> Result<()> {
        let nodes = state.nodes.clone();
        let ctx = self.stage_context(1, nodes.len());
        self.enter(
            AutoTestStage::BandwidthTest,
            format!("正在测速 ({} 个节点)", nodes.len()),
            nodes.len(),
        );

        let mut launch_failures = 0;
        for node in &nodes {
            ctx.check_cancel()?;
            let measured = match self.measure_bandwidth(node, mode, &ctx).await {
                Ok(m) => m,
                Err(e) if e.is_canceled() => return Err(e),
                Err(e) => {
                    if matches!(e, PilotError::Core(_)) {
                        launch_failures += 1;
                    }
                    warn!("节点 {} 测速失败: {}", node.name, e);
                    // 失败记为 0，避免沿用上一次的结果
                    (
                        mode.bandwidth_download_enabled.then_some(0.0),
                        mode.bandwidth_upload_enabled.then_some(0.0),
                    )
                }
            };

            if let Some(ref sender) = self.events {
                sender.node_measured(
                    &node.id,
                    &node.name,
                    format!(
                        "↓ {:.1} Mbps / ↑ {:.1} Mbps",
                        measured.0.unwrap_or(0.0),
                        measured.1.unwrap_or(0.0)
                    ),
                );
            }
            self.store
                .update(vec![(
                    node.id.clone(),
                    Measurement::Bandwidth {
                        download_mbps: measured.0,
                        upload_mbps: measured.1,
                    },
                )])
                .await?;
            ctx.tick();
        }

        if !nodes.is_empty() && launch_failures == nodes.len() {
            return Err(PilotError::Core("所有节点的测试会话均启动失败".to_string()));
        }
        state.nodes = self.refresh(&nodes).await?;
        Ok(())
    }

    async fn measure_bandwidth(
        &self,
        node: &NodeRecord,
        mode: &TestPreferMode,
        ctx: &StageContext,
    ) -> Result<(Option<f64>, Option<f64>)> {
        let session = self.sessions.acquire(node, &ctx.cancel).await?;
        let result = async {
            let probe = BandwidthProbe::new(
                &self.config.probe.download_url,
                &self.config.probe.upload_url,
                Some(session.port()),
                BANDWIDTH_TIMEOUT,
            )?;
            let events = ctx.events.clone();
            let node_id = node.id.clone();
            let on_sample: SampleFn = &move |mbps| {
                if let Some(ref sender) = events {
                    sender.emit(PilotEvent::BandwidthSample {
                        node_id: node_id.clone(),
                        mbps,
                    });
                }
            };

            let mut download = None;
            if mode.bandwidth_download_enabled {
                let size = u64::from(mode.bandwidth_download_size_mb) * MB;
                let r = probe.download_test(size, &ctx.cancel, Some(on_sample)).await?;
                if r.canceled {
                    return Err(PilotError::Canceled);
                }
                download = Some(r.avg_mbps);
            }

            let mut upload = None;
            if mode.bandwidth_upload_enabled {
                let size = u64::from(mode.bandwidth_upload_size_mb) * MB;
                let r = probe.upload_test(size, &ctx.cancel, Some(on_sample)).await?;
                if r.canceled {
                    return Err(PilotError::Canceled);
                }
                upload = Some(r.avg_mbps);
            }
            Ok((download, upload))
        }
        .await;
        self.sessions.release(session).await;
        result
    }

    async fn filter_bandwidth(&self, mode: &TestPreferMode, state: &mut RunState) -> Result<()> {
        self.enter(
            AutoTestStage::FilterBandwidth,
            format!(
                "筛选下载不低于 {} Mbps、上传不低于 {} Mbps 的节点",
                mode.bandwidth_download_threshold_mbps, mode.bandwidth_upload_threshold_mbps
            ),
            state.nodes.len(),
        );

        let passes = |n: &NodeRecord| {
            let down_ok = !mode.bandwidth_download_enabled
                || n.download_mbps.unwrap_or(0.0) >= mode.bandwidth_download_threshold_mbps;
            let up_ok = !mode.bandwidth_upload_enabled
                || n.upload_mbps.unwrap_or(0.0) >= mode.bandwidth_upload_threshold_mbps;
            down_ok && up_ok
        };
        state.bandwidth_passed = self
            .apply_filter(
                state,
                mode.filter_unavailable,
                passes,
                (AutoTestStatus::BandwidthPassed, AutoTestStatus::BandwidthFiltered),
            )
            .await?;
        info!("带宽通过 {} / {}", state.bandwidth_passed, state.total);
        Ok(())
    }

    async fn unlock_stage(&self, state: &mut RunState) -> Result<()> {
        let nodes = state.nodes.clone();
        let ctx = self.stage_context(self.config.probe.unlock_concurrency, nodes.len());
        self.enter(
            AutoTestStage::UnlockTest,
            format!("正在进行解锁检测 ({} 个节点)", nodes.len()),
            nodes.len(),
        );

        let mut join_set = JoinSet::new();
        for node in nodes.iter().cloned() {
            let ctx = ctx.clone();
            let sessions = self.sessions.clone();
            let runner = self.unlock.clone();

            join_set.spawn(async move {
                let _permit = ctx
                    .semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| PilotError::Canceled)?;
                ctx.check_cancel()?;

                let acquired = sessions.acquire(&node, &ctx.cancel).await;
                let outcome: Result<UnlockReport> = match acquired {
                    Ok(session) => {
                        let r = runner.run(session.port(), &ctx.cancel).await;
                        sessions.release(session).await;
                        r
                    }
                    Err(e) => Err(e),
                };
                ctx.tick();
                Ok::<_, PilotError>((node, outcome))
            });
        }

        let mut updates = Vec::new();
        let mut launch_failures = 0;
        while let Some(res) = join_set.join_next().await {
            let (node, outcome) = match res {
                Ok(Ok(r)) => r,
                Ok(Err(e)) => {
                    debug!("解锁任务中止: {}", e);
                    continue;
                }
                Err(e) => {
                    error!("并发调度错误: {}", e);
                    continue;
                }
            };

            match outcome {
                Ok(report) => {
                    if report.passed {
                        state.unlock_passed += 1;
                    }
                    if let Some(ref sender) = self.events {
                        sender.node_measured(
                            &node.id,
                            &node.name,
                            format!("解锁 YES={} NO={}", report.yes, report.no),
                        );
                    }
                    let status = if report.passed {
                        AutoTestStatus::UnlockPassed
                    } else {
                        AutoTestStatus::UnlockFailed
                    };
                    updates.push((
                        node.id.clone(),
                        Measurement::Unlock {
                            summary: report.summary(),
                            passed: report.passed,
                        },
                    ));
                    updates.push((node.id, Measurement::Status(Some(status))));
                }
                Err(e) if e.is_canceled() => {}
                Err(e) => {
                    if matches!(e, PilotError::Core(_)) {
                        launch_failures += 1;
                    }
                    warn!("节点 {} 解锁检测失败: {}", node.name, e);
                    updates.push((
                        node.id,
                        Measurement::Status(Some(AutoTestStatus::UnlockFailed)),
                    ));
                }
            }
        }

        // 取消前已完成的结果照常写回
        self.store.update(updates).await?;
        ctx.check_cancel()?;

        if !nodes.is_empty() && launch_failures == nodes.len() {
            return Err(PilotError::Core("所有节点的测试会话均启动失败".to_string()));
        }
        state.nodes = self.refresh(&nodes).await?;
        Ok(())
    }
}
