//! 应用程序入口 (Application Entrypoint)
//!
//! 负责 CLI 指令解析、遥测层初始化、依赖注入及系统生命周期管理。

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, bail};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::fmt::MakeWriter;

use nodepilot::actors::store::{Measurement, NodeStore, NodeStoreActor};
use nodepilot::core::config::AppConfig;
use nodepilot::core::event::create_event_channel;
use nodepilot::core::model::NodeRecord;
use nodepilot::core::prefer::{BestNodePriority, PreferStore, UnlockPriorityMode};
use nodepilot::engine::session::MeasurementSessionManager;
use nodepilot::engine::{AutoTestOrchestrator, select_best};
use nodepilot::generator::{SELECTOR_TAG, generate};
use nodepilot::probe::bandwidth::{MB, SampleFn};
use nodepilot::probe::{BandwidthProbe, LatencyResult, probe_all, url_test_all};
use nodepilot::ui::{Ui, get_multi, truncate_string};
use nodepilot::utils::crypto::{KeySource, StaticKey};
use nodepilot::utils::link::parse_link;
use nodepilot::utils::singbox::{SingBoxController, SingBoxLauncher};
use nodepilot::utils::subscription::{NodeSource, SubscriptionClient, decode_subscription};

/// 进度条感知的日志写入器 (TUI-aware Log Writer)
///
/// 确保非同步日志输出不会破坏终端进度条的渲染布局。
struct IndicatifWriter;

impl io::Write for IndicatifWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let s = String::from_utf8_lossy(buf);
        let _ = get_multi().println(s.trim_end());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for IndicatifWriter {
    type Writer = IndicatifWriter;

    fn make_writer(&self) -> Self::Writer {
        IndicatifWriter
    }
}

/// 命令行界面脚手架 (CLI Scaffolding)
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// 配置文件路径 (默认 ./config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 拉取订阅并替换节点列表
    Fetch {
        /// 覆盖配置中的订阅地址
        #[arg(short, long)]
        url: Option<String>,
    },
    /// 从本地文件导入订阅内容并替换节点列表
    Import { file: PathBuf },
    /// 手动追加节点链接
    Add {
        #[arg(required = true)]
        links: Vec<String>,
    },
    /// 列出已保存的节点
    List,
    /// 生成 sing-box 配置
    Generate {
        /// 输出文件，缺省时打印到标准输出
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// TCP 建连延迟测试
    Tcping,
    /// 经由 sing-box 的 URL 延迟测试
    Urltest,
    /// 单节点带宽测试
    Speedtest {
        /// 节点 id
        id: String,
        /// 负载大小 (MB)
        #[arg(short, long, default_value_t = 10)]
        size: u32,
        /// 同时测试上传
        #[arg(long)]
        upload: bool,
    },
    /// 执行自动化测试流程
    Autotest {
        /// 偏好模式 id，缺省取配置
        #[arg(short, long)]
        mode: Option<String>,
        /// 完成后切换到最优节点
        #[arg(long)]
        apply: bool,
    },
    /// 从已有测量结果中选出最优节点
    Best {
        #[arg(short, long)]
        priority: Option<BestNodePriority>,
        #[arg(long)]
        unlock_mode: Option<UnlockPriorityMode>,
        /// TARGET_SITES 模式下关注的平台
        #[arg(long, value_delimiter = ',')]
        sites: Vec<String>,
    },
    /// 通过 clash API 切换运行中的节点
    Select { id: String },
    /// 偏好模式管理
    Modes {
        #[command(subcommand)]
        action: Option<ModeAction>,
    },
}

#[derive(Subcommand)]
enum ModeAction {
    /// 列出全部模式
    List,
    /// 复制一个模式
    SaveAs { base: String, name: String },
    /// 删除用户模式
    Delete { id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 遥测层初始化 (Telemetry Layer Initialization)
    if std::env::var("RUST_LOG").is_err() {
        unsafe {
            std::env::set_var("RUST_LOG", "info");
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(IndicatifWriter)
        .with_target(false)
        .with_ansi(true)
        .init();

    let cli = Cli::parse();

    // 依赖项初始化与注入 (Dependency Injection)
    let config = Arc::new(AppConfig::load(cli.config.as_deref())?);
    let cache_dir = PathBuf::from(&config.cache_path);
    let (store, _store_handle) = NodeStoreActor::start(&cache_dir).await;

    match cli.command {
        Commands::Fetch { url } => {
            let url = url
                .or_else(|| config.subscription.url.clone())
                .context("未配置订阅地址 (subscription.url)")?;
            let client = SubscriptionClient::new(
                url,
                config.subscription.timeout_secs,
                &cache_dir,
                Some(key_source(&config)),
            )?;
            let nodes = client.fetch_nodes().await?;
            if nodes.is_empty() {
                bail!("订阅中没有找到节点");
            }
            let count = store.replace(nodes).await?;
            info!("已导入 {} 个节点", count);
        }
        Commands::Import { file } => {
            let body = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("读取 {} 失败", file.display()))?;
            let key = key_source(&config);
            let nodes = decode_subscription(&body, Some(key.as_ref()));
            if nodes.is_empty() {
                bail!("文件中没有找到节点");
            }
            let count = store.replace(nodes).await?;
            info!("已导入 {} 个节点", count);
        }
        Commands::Add { links } => {
            let mut nodes = Vec::new();
            for link in &links {
                match parse_link(link) {
                    Ok(node) => nodes.push(node),
                    Err(e) => warn!("无法解析链接 {}: {}", truncate_string(link, 40), e),
                }
            }
            let added = store.insert(nodes).await?;
            info!("新增 {} 个节点", added);
        }
        Commands::List => print_nodes(&store.list().await?),
        Commands::Generate { output } => {
            let nodes = store.list().await?;
            let json = generate(&nodes, &config.routing_options()).to_json()?;
            match output {
                Some(path) => {
                    nodepilot::utils::save_file(&path, json.as_bytes()).await?;
                    info!("配置已写入 {}", path.display());
                }
                None => println!("{}", json),
            }
        }
        Commands::Tcping => {
            let nodes = store.list().await?;
            let cancel = cancel_on_ctrl_c();
            let results = probe_all(
                &nodes,
                config.probe.tcp_concurrency,
                config.probe.tcp_timeout_ms,
                &cancel,
                None,
            )
            .await;
            save_latency(&store, results).await?;
            print_nodes(&store.list().await?);
        }
        Commands::Urltest => {
            let nodes = store.list().await?;
            let cancel = cancel_on_ctrl_c();
            let sessions = MeasurementSessionManager::new(launcher(&config, &cache_dir), 1);
            let session = sessions
                .acquire_url_test(
                    &nodes,
                    config.singbox.headless_api_port,
                    config.singbox.bind_interface.as_deref(),
                    &cancel,
                )
                .await?;
            let results = url_test_all(
                session.core(),
                &nodes,
                config.probe.url_concurrency,
                &config.probe.test_url,
                config.probe.url_timeout_ms,
                &cancel,
                None,
            )
            .await;
            sessions.release(session).await;
            save_latency(&store, results).await?;
            print_nodes(&store.list().await?);
        }
        Commands::Speedtest { id, size, upload } => {
            let node = store.get(&id).await?.with_context(|| format!("未找到节点 {}", id))?;
            let cancel = cancel_on_ctrl_c();
            let sessions = MeasurementSessionManager::new(launcher(&config, &cache_dir), 1);
            let session = sessions.acquire(&node, &cancel).await?;
            let probe = BandwidthProbe::new(
                &config.probe.download_url,
                &config.probe.upload_url,
                Some(session.port()),
                Duration::from_secs(120),
            )?;

            let bytes = u64::from(size) * MB;
            let on_sample: SampleFn = &|mbps| tracing::debug!("{:.1} Mbps", mbps);
            let download = probe.download_test(bytes, &cancel, Some(on_sample)).await;
            let upload = if upload && download.is_ok() {
                Some(probe.upload_test(bytes, &cancel, Some(on_sample)).await)
            } else {
                None
            };
            sessions.release(session).await;

            let download = download?;
            println!(
                "↓ avg {:.2} Mbps, peak {:.2} Mbps ({} bytes / {} ms)",
                download.avg_mbps, download.peak_mbps, download.total_bytes, download.duration_ms
            );
            let upload = upload.transpose()?;
            if let Some(ref up) = upload {
                println!(
                    "↑ avg {:.2} Mbps, peak {:.2} Mbps ({} bytes / {} ms)",
                    up.avg_mbps, up.peak_mbps, up.total_bytes, up.duration_ms
                );
            }
            store
                .update(vec![(
                    node.id,
                    Measurement::Bandwidth {
                        download_mbps: (!download.canceled).then_some(download.avg_mbps),
                        upload_mbps: upload.filter(|u| !u.canceled).map(|u| u.avg_mbps),
                    },
                )])
                .await?;
        }
        Commands::Autotest { mode, apply } => {
            let prefer = PreferStore::new(&cache_dir);
            let mode_id = mode.unwrap_or_else(|| config.autotest.prefer_mode.clone());
            let mode = prefer.find_or_default(&mode_id).await;

            // 建立 UI 事件反馈链路 (Event feedback loop)
            let (event_sender, event_receiver) = create_event_channel();
            let ui_handle = Ui::run(event_receiver);

            let report = {
                let mut orchestrator = AutoTestOrchestrator::new(
                    config.clone(),
                    store.clone(),
                    launcher(&config, &cache_dir),
                )
                .with_events(event_sender)
                .with_cancel(cancel_on_ctrl_c());

                if let Some(url) = config.subscription.url.clone() {
                    let client = SubscriptionClient::new(
                        url,
                        config.subscription.timeout_secs,
                        &cache_dir,
                        Some(key_source(&config)),
                    )?;
                    orchestrator = orchestrator.with_source(Arc::new(client));
                }
                orchestrator.run(&mode).await
            };

            // 事件发送端随调度器释放后等待 UI 退出
            let _ = ui_handle.await;

            info!("{}", report.message);
            match report.best {
                Some(best) => {
                    info!("最优节点: {} {} ({})", best.flag_emoji(), best.name, best.id);
                    if apply {
                        switch_node(&config, &cache_dir, &best.id).await?;
                    }
                }
                None => info!("暂无符合条件的节点"),
            }
        }
        Commands::Best {
            priority,
            unlock_mode,
            sites,
        } => {
            let mode = PreferStore::new(&cache_dir)
                .find_or_default(&config.autotest.prefer_mode)
                .await;
            let priority = priority.unwrap_or(mode.default_priority);
            let unlock_mode = unlock_mode.unwrap_or(mode.unlock_priority_mode);
            let sites = if sites.is_empty() {
                mode.unlock_priority_target_site_ids
            } else {
                sites
            };

            let nodes = store.list().await?;
            match select_best(&nodes, priority, unlock_mode, &sites) {
                Some(n) => println!("{} {} ({}) {}", n.flag_emoji(), n.name, n.id, n.latency_text()),
                None => println!("暂无符合条件的节点"),
            }
        }
        Commands::Select { id } => {
            if store.get(&id).await?.is_none() {
                bail!("未找到节点 {}", id);
            }
            switch_node(&config, &cache_dir, &id).await?;
        }
        Commands::Modes { action } => {
            let prefer = PreferStore::new(&cache_dir);
            match action.unwrap_or(ModeAction::List) {
                ModeAction::List => {
                    for m in prefer.load().await {
                        let marker = if m.id == config.autotest.prefer_mode { "*" } else { " " };
                        println!(
                            "{} {:<20} {:<16} 延迟≤{}ms 带宽:{} 解锁:{} 排序:{}",
                            marker,
                            m.id,
                            m.name,
                            m.latency_threshold_ms,
                            m.bandwidth_active(),
                            m.unlock_enabled,
                            m.default_priority
                        );
                    }
                }
                ModeAction::SaveAs { base, name } => {
                    let m = prefer.save_as(&base, &name).await?;
                    info!("已保存模式 {} ({})", m.name, m.id);
                }
                ModeAction::Delete { id } => {
                    if !prefer.delete(&id).await? {
                        bail!("无法删除模式 {} (不存在或为内置模式)", id);
                    }
                }
            }
        }
    }

    Ok(())
}

fn key_source(config: &AppConfig) -> Box<dyn KeySource> {
    Box::new(StaticKey(config.subscription.decrypt_key.clone()))
}

fn launcher(config: &AppConfig, cache_dir: &Path) -> Arc<SingBoxLauncher> {
    Arc::new(SingBoxLauncher::new(
        &config.singbox.bin_path,
        cache_dir.join("sessions"),
    ))
}

/// 信号处理与优雅退出 (Signal Handling)
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("收到中断信号，正在取消...");
            child.cancel();
        }
    });
    token
}

async fn switch_node(config: &AppConfig, cache_dir: &Path, id: &str) -> anyhow::Result<()> {
    let controller = SingBoxController::new(
        Path::new(&config.singbox.bin_path),
        cache_dir,
        "main",
        config.singbox.api_port,
    )?;
    controller.switch_selector(SELECTOR_TAG, id).await?;
    info!("已切换到节点 {}", id);
    Ok(())
}

async fn save_latency(store: &NodeStore, results: Vec<LatencyResult>) -> anyhow::Result<()> {
    store
        .update(
            results
                .into_iter()
                .map(|r| (r.node_id, Measurement::Latency(r.latency)))
                .collect(),
        )
        .await?;
    Ok(())
}

fn print_nodes(nodes: &[NodeRecord]) {
    for (i, n) in nodes.iter().enumerate() {
        let bandwidth = match (n.download_mbps, n.upload_mbps) {
            (None, None) => String::new(),
            (d, u) => format!(
                " ↓{:.1} ↑{:.1}",
                d.unwrap_or_default(),
                u.unwrap_or_default()
            ),
        };
        let status = n
            .auto_test_status
            .map(|s| format!(" [{}]", s))
            .unwrap_or_default();
        println!(
            "{:>3} {} {:<28} {:<11} {:>7}{}{}  {}",
            i + 1,
            n.flag_emoji(),
            truncate_string(&n.name, 28),
            n.node_type,
            n.latency_text(),
            bandwidth,
            status,
            n.id
        );
    }
    println!("共 {} 个节点", nodes.len());
}
