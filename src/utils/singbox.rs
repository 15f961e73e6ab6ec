//! 外部核心控制 (sing-box Process & Clash API)
//!
//! 以子进程方式运行 `sing-box run -c <config>`，并通过 clash API 完成就绪探测、
//! 选择器切换与单节点延迟测试。

use std::env::consts::EXE_SUFFIX;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, info};

use crate::core::error::{PilotError, Result};
use crate::core::model::Latency;

pub struct SingBoxController {
    executable: PathBuf,
    config_path: PathBuf,
    api_base: Url,
    child: Mutex<Option<Child>>,
    client: Client,
}

#[derive(Deserialize)]
struct DelayResponse {
    #[serde(default)]
    delay: i64,
}

impl SingBoxController {
    /// `name` 决定配置与日志文件名，允许多个实例共存
    pub fn new(bin_dir: &Path, work_dir: &Path, name: &str, api_port: u16) -> Result<Self> {
        // 自动处理不同系统的扩展名 (Windows 为 .exe，Linux/Mac 为空)
        let executable = bin_dir.join(format!("sing-box{}", EXE_SUFFIX));
        let config_path = work_dir.join(format!("{}.json", name));

        let api_base = Url::parse(&format!("http://127.0.0.1:{}/", api_port))
            .map_err(|e| PilotError::Core(format!("invalid API url: {}", e)))?;

        let client = Client::builder()
            .no_proxy()
            .timeout(Duration::from_secs(15))
            .build()?;

        Ok(Self {
            executable,
            config_path,
            api_base,
            child: Mutex::new(None),
            client,
        })
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub async fn write_config(&self, config_content: &str) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.config_path, config_content).await?;
        Ok(())
    }

    pub async fn start(&self) -> Result<()> {
        let mut child_guard = self.child.lock().await;
        if child_guard.is_some() {
            debug!("sing-box 已经在运行中");
            return Ok(());
        }

        if !self.executable.exists() {
            return Err(PilotError::Core(format!(
                "未找到 sing-box 执行文件: {}",
                self.executable.display()
            )));
        }

        let log_path = self.config_path.with_extension("log");
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        info!("正在启动 sing-box ({})...", self.config_path.display());

        let child = Command::new(&self.executable)
            .arg("run")
            .arg("-c")
            .arg(&self.config_path)
            .stdout(Stdio::from(log_file.try_clone()?))
            .stderr(Stdio::from(log_file))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PilotError::Core(format!("启动 sing-box 进程失败: {}", e)))?;

        *child_guard = Some(child);
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        let mut child_guard = self.child.lock().await;
        if let Some(mut child) = child_guard.take() {
            child.kill().await?;
            child.wait().await?;
            info!("sing-box 已停止");
        }
        Ok(())
    }

    pub async fn wait_for_api(&self, timeout_secs: u64) -> Result<()> {
        let url = self.api_url("proxies")?;

        timeout(Duration::from_secs(timeout_secs), async {
            loop {
                match self.client.get(url.clone()).send().await {
                    Ok(resp) if resp.status().is_success() => {
                        debug!("sing-box API 已就绪");
                        return;
                    }
                    _ => debug!("正在等待 sing-box API 响应..."),
                }
                sleep(Duration::from_millis(500)).await;
            }
        })
        .await
        .map_err(|_| PilotError::Core("等待 sing-box API 超时".into()))
    }

    pub async fn switch_selector(&self, selector: &str, tag: &str) -> Result<()> {
        let url = self.api_url(&format!("proxies/{}", selector))?;
        let body = serde_json::json!({ "name": tag });

        let resp = self.client.put(url).json(&body).send().await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(PilotError::Core(format!(
                "Failed to switch proxy ({} -> {}): Status {}, Body: {}",
                selector, tag, status, text
            )));
        }

        Ok(())
    }

    /// 通过 clash API 测量单个出站的延迟
    ///
    /// 非 200 响应、非正延迟或请求失败都记为不可达。
    pub async fn url_test_delay(&self, tag: &str, test_url: &str, timeout_ms: u64) -> Latency {
        let mut url = match self.api_url("proxies/") {
            Ok(u) => u,
            Err(_) => return Latency::Unreachable,
        };
        // 节点 tag 作为单独的路径段，由 url 负责转义
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(tag).push("delay");
        }
        url.query_pairs_mut()
            .append_pair("url", test_url)
            .append_pair("timeout", &timeout_ms.to_string());

        let resp = match self
            .client
            .get(url)
            .timeout(Duration::from_millis(timeout_ms + 2000))
            .send()
            .await
        {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                debug!("节点 {} 延迟测试失败: {}", tag, r.status());
                return Latency::Unreachable;
            }
            Err(e) => {
                debug!("节点 {} 延迟测试请求失败: {}", tag, e);
                return Latency::Unreachable;
            }
        };

        match resp.json::<DelayResponse>().await {
            Ok(d) if d.delay > 0 => Latency::Measured(d.delay.min(u32::MAX as i64) as u32),
            _ => Latency::Unreachable,
        }
    }

    fn api_url(&self, path: &str) -> Result<Url> {
        self.api_base
            .join(path)
            .map_err(|e| PilotError::Core(format!("invalid API path {}: {}", path, e)))
    }
}

/// 等待本地端口开始接受连接
pub async fn wait_for_port(port: u16, retries: u32, interval: Duration) -> Result<()> {
    for _ in 0..retries {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return Ok(());
        }
        sleep(interval).await;
    }
    Err(PilotError::Core(format!("本地端口 {} 未就绪", port)))
}

/// 运行中的核心实例
#[async_trait]
pub trait CoreProcess: Send + Sync {
    async fn shutdown(&self) -> Result<()>;

    /// 测速实例的延迟查询，非 clash API 实例返回不可达
    async fn delay(&self, _tag: &str, _test_url: &str, _timeout_ms: u64) -> Latency {
        Latency::Unreachable
    }
}

#[async_trait]
impl CoreProcess for SingBoxController {
    async fn shutdown(&self) -> Result<()> {
        self.stop().await
    }

    async fn delay(&self, tag: &str, test_url: &str, timeout_ms: u64) -> Latency {
        self.url_test_delay(tag, test_url, timeout_ms).await
    }
}

/// 实例就绪判定方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// clash API 可访问
    Api(u16),
    /// SOCKS 入站端口可连接
    Socks(u16),
}

/// 启动核心实例的抽象
#[async_trait]
pub trait CoreLauncher: Send + Sync {
    async fn launch(
        &self,
        name: &str,
        config: &str,
        ready: Readiness,
    ) -> Result<Box<dyn CoreProcess>>;
}

/// 基于本地 sing-box 二进制的启动器
pub struct SingBoxLauncher {
    bin_dir: PathBuf,
    work_dir: PathBuf,
}

impl SingBoxLauncher {
    pub fn new(bin_dir: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            bin_dir: bin_dir.into(),
            work_dir: work_dir.into(),
        }
    }
}

#[async_trait]
impl CoreLauncher for SingBoxLauncher {
    async fn launch(
        &self,
        name: &str,
        config: &str,
        ready: Readiness,
    ) -> Result<Box<dyn CoreProcess>> {
        let api_port = match ready {
            Readiness::Api(p) => p,
            Readiness::Socks(_) => 0,
        };
        let controller = SingBoxController::new(&self.bin_dir, &self.work_dir, name, api_port)?;
        controller.write_config(config).await?;
        controller.start().await?;

        let waited = match ready {
            Readiness::Api(_) => controller.wait_for_api(10).await,
            Readiness::Socks(port) => wait_for_port(port, 8, Duration::from_millis(500)).await,
        };
        if let Err(e) = waited {
            let _ = controller.stop().await;
            return Err(e);
        }
        Ok(Box::new(controller))
    }
}
