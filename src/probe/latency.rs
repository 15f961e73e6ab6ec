//! 延迟探测 (Latency Probe)
//!
//! TCP 建连探测：建立连接或被对端拒绝 (RST) 都说明链路可达，记为成功；
//! 超时与其他错误记为不可达。批量探测由信号量限流，超出上限的任务排队等待。
//! 另提供经由 clash API 的 URL 延迟测试。

use std::io::ErrorKind;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::core::model::{Latency, NodeRecord};
use crate::utils::singbox::CoreProcess;

/// 单个节点的探测结果
#[derive(Debug, Clone, PartialEq)]
pub struct LatencyResult {
    pub node_id: String,
    pub latency: Latency,
    pub reachable: bool,
}

impl LatencyResult {
    fn new(node_id: String, latency: Latency) -> Self {
        Self {
            node_id,
            reachable: latency.is_measured(),
            latency,
        }
    }
}

/// 批量进度回调 `(completed, total)`
pub type ProgressFn = Arc<dyn Fn(usize, usize) + Send + Sync>;

fn elapsed_ms(start: Instant) -> Latency {
    Latency::Measured((start.elapsed().as_millis() as u32).max(1))
}

/// 对单个地址做一次 TCP 建连探测
pub async fn tcp_ping(server: &str, port: u16, timeout_ms: u64) -> Latency {
    let host = server.trim_start_matches('[').trim_end_matches(']');
    let start = Instant::now();

    match timeout(
        Duration::from_millis(timeout_ms),
        TcpStream::connect((host, port)),
    )
    .await
    {
        Ok(Ok(_stream)) => elapsed_ms(start),
        // 被拒绝也证明路径可达
        Ok(Err(e)) if e.kind() == ErrorKind::ConnectionRefused => elapsed_ms(start),
        Ok(Err(e)) => {
            debug!("TCPing {}:{} 失败: {}", host, port, e);
            Latency::Unreachable
        }
        Err(_) => Latency::Unreachable,
    }
}

/// 批量 TCP 探测
///
/// 每个节点在获取信号量前后都会检查取消；已取消的节点不会出现在结果中。
/// 所有任务结束后才返回。
pub async fn probe_all(
    nodes: &[NodeRecord],
    concurrency: usize,
    timeout_ms: u64,
    cancel: &CancellationToken,
    progress: Option<ProgressFn>,
) -> Vec<LatencyResult> {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let completed = Arc::new(AtomicUsize::new(0));
    let total = nodes.len();
    let mut join_set = JoinSet::new();

    for node in nodes {
        let semaphore = semaphore.clone();
        let completed = completed.clone();
        let progress = progress.clone();
        let cancel = cancel.clone();
        let (id, server, port) = (node.id.clone(), node.server.clone(), node.port);

        join_set.spawn(async move {
            let _permit = tokio::select! {
                _ = cancel.cancelled() => return None,
                permit = semaphore.acquire_owned() => permit.ok()?,
            };
            if cancel.is_cancelled() {
                return None;
            }

            let latency = tokio::select! {
                _ = cancel.cancelled() => return None,
                l = tcp_ping(&server, port, timeout_ms) => l,
            };
            debug!("TCPing {}:{} -> {:?}", server, port, latency);

            let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(cb) = &progress {
                cb(done, total);
            }
            Some(LatencyResult::new(id, latency))
        });
    }

    collect(join_set).await
}

async fn collect(mut join_set: JoinSet<Option<LatencyResult>>) -> Vec<LatencyResult> {
    let mut results = Vec::new();
    while let Some(res) = join_set.join_next().await {
        match res {
            Ok(Some(r)) => results.push(r),
            Ok(None) => {}
            Err(e) => error!("并发调度错误: {}", e),
        }
    }
    results
}

/// 经由运行中测速实例的 URL 延迟测试
pub async fn url_test_all(
    core: Arc<dyn CoreProcess>,
    nodes: &[NodeRecord],
    concurrency: usize,
    test_url: &str,
    timeout_ms: u64,
    cancel: &CancellationToken,
    progress: Option<ProgressFn>,
) -> Vec<LatencyResult> {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let completed = Arc::new(AtomicUsize::new(0));
    let total = nodes.len();
    let mut join_set = JoinSet::new();

    for node in nodes {
        let semaphore = semaphore.clone();
        let completed = completed.clone();
        let progress = progress.clone();
        let cancel = cancel.clone();
        let core = core.clone();
        let id = node.id.clone();
        let url = test_url.to_string();

        join_set.spawn(async move {
            let _permit = tokio::select! {
                _ = cancel.cancelled() => return None,
                permit = semaphore.acquire_owned() => permit.ok()?,
            };
            if cancel.is_cancelled() {
                return None;
            }

            let latency = tokio::select! {
                _ = cancel.cancelled() => return None,
                l = core.delay(&id, &url, timeout_ms) => l,
            };
            debug!("URL test {} -> {:?}", id, latency);

            let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(cb) = &progress {
                cb(done, total);
            }
            Some(LatencyResult::new(id, latency))
        });
    }

    collect(join_set).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::NodeType;
    use tokio::net::TcpListener;

    fn node(id: &str, server: &str, port: u16) -> NodeRecord {
        NodeRecord::new(
            id.into(),
            id.into(),
            NodeType::Socks,
            server.into(),
            port,
            format!("socks://{}:{}", server, port),
        )
    }

    /// 绑定后立即释放，得到一个大概率无人监听的端口
    async fn closed_port() -> u16 {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn open_port_is_reachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let l = tcp_ping("127.0.0.1", port, 1000).await;
        assert!(matches!(l, Latency::Measured(ms) if ms >= 1));
    }

    #[tokio::test]
    async fn refused_port_counts_as_reachable() {
        let port = closed_port().await;
        let l = tcp_ping("127.0.0.1", port, 1000).await;
        assert!(l.is_measured());
    }

    #[tokio::test]
    async fn unroutable_address_times_out() {
        // TEST-NET-1，不会有应答
        let l = tcp_ping("192.0.2.1", 9, 200).await;
        assert_eq!(l, Latency::Unreachable);
    }

    #[tokio::test]
    async fn batch_reports_every_node() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().port();
        let nodes = vec![
            node("a", "127.0.0.1", open),
            node("b", "192.0.2.1", 9),
            node("c", "127.0.0.1", open),
        ];
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_cb = seen.clone();
        let cb: ProgressFn = Arc::new(move |_, total| {
            assert_eq!(total, 3);
            seen_cb.fetch_add(1, Ordering::SeqCst);
        });

        let mut results =
            probe_all(&nodes, 2, 200, &CancellationToken::new(), Some(cb)).await;
        results.sort_by(|a, b| a.node_id.cmp(&b.node_id));

        assert_eq!(results.len(), 3);
        assert!(results[0].reachable);
        assert_eq!(results[1].latency, Latency::Unreachable);
        assert!(!results[1].reachable);
        assert!(results[2].reachable);
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancelled_batch_returns_nothing() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let nodes = vec![node("a", "192.0.2.1", 9)];
        assert!(probe_all(&nodes, 1, 200, &cancel, None).await.is_empty());
    }
}
