//! 临时测量会话管理 (Measurement Sessions)
//!
//! 带宽与解锁测试需要为单个节点启动一个只含 SOCKS 入站的核心实例，
//! URL 测试需要一个无 TUN 的批量实例。管理器由每次测试运行显式持有，
//! 以信号量限制同时存在的实例数，并登记活跃会话以便取消时统一回收。
//! 等待空闲名额时同时监听取消令牌，取消后立即返回。

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::error::{PilotError, Result};
use crate::core::model::NodeRecord;
use crate::generator::{generate_test_config, generate_url_test_config};
use crate::utils::singbox::{CoreLauncher, CoreProcess, Readiness};

type Registry = Arc<Mutex<HashMap<String, Arc<dyn CoreProcess>>>>;

/// 一个运行中的临时实例；drop 时从登记表移除
pub struct MeasurementSession {
    name: String,
    port: u16,
    core: Arc<dyn CoreProcess>,
    registry: Registry,
    _permit: OwnedSemaphorePermit,
}

impl MeasurementSession {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// SOCKS 入站端口，或 URL 测试实例的 API 端口
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn core(&self) -> Arc<dyn CoreProcess> {
        self.core.clone()
    }
}

impl Drop for MeasurementSession {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.name);
    }
}

pub struct MeasurementSessionManager {
    launcher: Arc<dyn CoreLauncher>,
    slots: Arc<Semaphore>,
    active: Registry,
}

/// 由系统分配一个当前空闲的本地端口
async fn free_port() -> Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    Ok(listener.local_addr()?.port())
}

impl MeasurementSessionManager {
    pub fn new(launcher: Arc<dyn CoreLauncher>, max_sessions: usize) -> Self {
        Self {
            launcher,
            slots: Arc::new(Semaphore::new(max_sessions.max(1))),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    async fn launch(
        &self,
        name: String,
        port: u16,
        config: String,
        ready: Readiness,
        cancel: &CancellationToken,
    ) -> Result<MeasurementSession> {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PilotError::Canceled),
            p = self.slots.clone().acquire_owned() => p.map_err(|_| PilotError::Canceled)?,
        };

        let core: Arc<dyn CoreProcess> =
            Arc::from(self.launcher.launch(&name, &config, ready).await?);
        self.active.lock().insert(name.clone(), core.clone());
        debug!("测量会话已启动: {} (port {})", name, port);

        Ok(MeasurementSession {
            name,
            port,
            core,
            registry: self.active.clone(),
            _permit: permit,
        })
    }

    /// 为单个节点启动 SOCKS 测试实例
    pub async fn acquire(
        &self,
        node: &NodeRecord,
        cancel: &CancellationToken,
    ) -> Result<MeasurementSession> {
        let port = free_port().await?;
        let config = generate_test_config(node, port)?.to_json()?;
        self.launch(
            format!("socks-{}", port),
            port,
            config,
            Readiness::Socks(port),
            cancel,
        )
        .await
    }

    /// 为一批节点启动 URL 测试实例
    pub async fn acquire_url_test(
        &self,
        nodes: &[NodeRecord],
        api_port: u16,
        bind_interface: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<MeasurementSession> {
        let config = generate_url_test_config(nodes, api_port, bind_interface, None).to_json()?;
        self.launch(
            "urltest".to_string(),
            api_port,
            config,
            Readiness::Api(api_port),
            cancel,
        )
        .await
    }

    pub async fn release(&self, session: MeasurementSession) {
        if let Err(e) = session.core.shutdown().await {
            warn!("停止测量会话 {} 失败: {}", session.name, e);
        }
        debug!("测量会话已释放: {}", session.name);
    }

    /// 尽力停止所有仍登记的实例
    pub async fn release_all(&self) {
        let cores: Vec<(String, Arc<dyn CoreProcess>)> = self.active.lock().drain().collect();
        for (name, core) in cores {
            if let Err(e) = core.shutdown().await {
                warn!("停止测量会话 {} 失败: {}", name, e);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::model::{Latency, NodeType};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// 不启动任何进程的假核心，延迟固定
    pub(crate) struct FakeCore {
        pub stopped: Arc<AtomicUsize>,
        pub delays: HashMap<String, Latency>,
    }

    #[async_trait]
    impl CoreProcess for FakeCore {
        async fn shutdown(&self) -> Result<()> {
            self.stopped.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn delay(&self, tag: &str, _url: &str, _timeout_ms: u64) -> Latency {
            self.delays.get(tag).copied().unwrap_or(Latency::Unreachable)
        }
    }

    #[derive(Default)]
    pub(crate) struct FakeLauncher {
        pub launched: Arc<Mutex<Vec<String>>>,
        pub stopped: Arc<AtomicUsize>,
        pub delays: HashMap<String, Latency>,
        pub fail: bool,
    }

    #[async_trait]
    impl CoreLauncher for FakeLauncher {
        async fn launch(
            &self,
            name: &str,
            config: &str,
            _ready: Readiness,
        ) -> Result<Box<dyn CoreProcess>> {
            if self.fail {
                return Err(PilotError::Core("sing-box 不可用".into()));
            }
            serde_json::from_str::<serde_json::Value>(config)?;
            self.launched.lock().push(name.to_string());
            Ok(Box::new(FakeCore {
                stopped: self.stopped.clone(),
                delays: self.delays.clone(),
            }))
        }
    }

    pub(crate) fn trojan(id: &str) -> NodeRecord {
        NodeRecord::new(
            id.into(),
            id.into(),
            NodeType::Trojan,
            "example.com".into(),
            443,
            format!("trojan://secret@example.com:443#{}", id),
        )
    }

    fn never() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn sessions_are_bounded_and_released() {
        let launcher = Arc::new(FakeLauncher::default());
        let stopped = launcher.stopped.clone();
        let manager = Arc::new(MeasurementSessionManager::new(launcher.clone(), 1));

        let first = manager.acquire(&trojan("a"), &never()).await.unwrap();
        assert_eq!(manager.active_count(), 1);

        // 第二个会话需等待第一个释放
        let m2 = manager.clone();
        let waiting = tokio::spawn(async move { m2.acquire(&trojan("b"), &never()).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());

        manager.release(first).await;
        let second = waiting.await.unwrap().unwrap();
        assert_eq!(manager.active_count(), 1);
        assert_eq!(launcher.launched.lock().len(), 2);

        drop(second);
        assert_eq!(manager.active_count(), 0);
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_interrupts_wait_for_slot() {
        let launcher = Arc::new(FakeLauncher::default());
        let manager = Arc::new(MeasurementSessionManager::new(launcher.clone(), 1));
        let held = manager.acquire(&trojan("a"), &never()).await.unwrap();

        let cancel = CancellationToken::new();
        let (m2, c2) = (manager.clone(), cancel.clone());
        let waiting = tokio::spawn(async move { m2.acquire(&trojan("b"), &c2).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());

        cancel.cancel();
        let res = tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .expect("cancel should end the wait while the slot is still held")
            .unwrap();
        assert!(matches!(res, Err(PilotError::Canceled)));
        assert_eq!(launcher.launched.lock().len(), 1);
        assert_eq!(manager.active_count(), 1);

        // 已取消的令牌不会再占用名额
        drop(held);
        let url = manager
            .acquire_url_test(&[trojan("c")], 19090, None, &cancel)
            .await;
        assert!(matches!(url, Err(PilotError::Canceled)));
    }

    #[tokio::test]
    async fn broken_link_fails_before_launch() {
        let launcher = Arc::new(FakeLauncher::default());
        let manager = MeasurementSessionManager::new(launcher.clone(), 2);
        let mut bad = trojan("x");
        bad.raw_link = "vmess://!!!".into();
        assert!(matches!(
            manager.acquire(&bad, &never()).await,
            Err(PilotError::Link(_))
        ));
        assert!(launcher.launched.lock().is_empty());
    }

    #[tokio::test]
    async fn release_all_stops_registered_sessions() {
        let launcher = Arc::new(FakeLauncher::default());
        let stopped = launcher.stopped.clone();
        let manager = MeasurementSessionManager::new(launcher, 2);
        let _a = manager.acquire(&trojan("a"), &never()).await.unwrap();
        let _b = manager.acquire(&trojan("b"), &never()).await.unwrap();

        manager.release_all().await;
        assert_eq!(stopped.load(Ordering::SeqCst), 2);
        assert_eq!(manager.active_count(), 0);
    }
}
