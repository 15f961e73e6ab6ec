//! 节点存储 Actor (Node Store)
//!
//! 节点列表是唯一的共享可变资源，所有读写经由消息串行化，
//! 每次变更后整体写回 `nodes.json`。

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use flume::{Receiver, Sender};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::error::{PilotError, Result};
use crate::core::model::{AutoTestStatus, Latency, NodeRecord};
use crate::utils::{now_millis, save_file};

/// 单节点的测量写回
#[derive(Debug, Clone, PartialEq)]
pub enum Measurement {
    Latency(Latency),
    Bandwidth {
        download_mbps: Option<f64>,
        upload_mbps: Option<f64>,
    },
    Unlock {
        summary: String,
        passed: bool,
    },
    Status(Option<AutoTestStatus>),
}

pub enum StoreMsg {
    List {
        reply: Sender<Vec<NodeRecord>>,
    },
    Get {
        id: String,
        reply: Sender<Option<NodeRecord>>,
    },
    /// 清空旧一代后写入，返回去重后的数量
    Replace {
        nodes: Vec<NodeRecord>,
        reply: Sender<usize>,
    },
    /// 追加尚不存在的节点，返回新增数量
    Insert {
        nodes: Vec<NodeRecord>,
        reply: Sender<usize>,
    },
    Update {
        updates: Vec<(String, Measurement)>,
        reply: Sender<()>,
    },
    /// 清除全部节点的自动测试结论
    ResetStatus {
        reply: Sender<()>,
    },
}

pub struct NodeStoreActor {
    rx: Receiver<StoreMsg>,
    nodes: Vec<NodeRecord>,
    path: PathBuf,
}

/// Actor 的句柄，可廉价克隆
#[derive(Clone)]
pub struct NodeStore {
    tx: Sender<StoreMsg>,
}

impl NodeStoreActor {
    pub async fn start(cache_dir: &Path) -> (NodeStore, JoinHandle<()>) {
        let (tx, rx) = flume::unbounded();
        let path = cache_dir.join("nodes.json");

        let mut nodes: Vec<NodeRecord> = match tokio::fs::read_to_string(&path).await {
            Ok(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
                warn!("节点文件损坏，已忽略: {}", e);
                Vec::new()
            }),
            Err(_) => Vec::new(),
        };
        nodes.sort_by_key(|n| n.sort_order);
        debug!("加载缓存节点 {} 个", nodes.len());

        let mut actor = NodeStoreActor { rx, nodes, path };
        let handle = tokio::spawn(async move {
            actor.run().await;
        });

        (NodeStore { tx }, handle)
    }

    async fn run(&mut self) {
        while let Ok(msg) = self.rx.recv_async().await {
            match msg {
                StoreMsg::List { reply } => {
                    let _ = reply.send(self.nodes.clone());
                }
                StoreMsg::Get { id, reply } => {
                    let _ = reply.send(self.nodes.iter().find(|n| n.id == id).cloned());
                }
                StoreMsg::Replace { nodes, reply } => {
                    self.nodes.clear();
                    let added = self.append(nodes);
                    info!("节点列表已替换: {} 个", added);
                    self.save().await;
                    let _ = reply.send(added);
                }
                StoreMsg::Insert { nodes, reply } => {
                    let added = self.append(nodes);
                    if added > 0 {
                        self.save().await;
                    }
                    let _ = reply.send(added);
                }
                StoreMsg::Update { updates, reply } => {
                    let now = now_millis();
                    for (id, m) in updates {
                        match self.nodes.iter_mut().find(|n| n.id == id) {
                            Some(node) => apply(node, m, now),
                            None => debug!("忽略未知节点的测量结果: {}", id),
                        }
                    }
                    self.save().await;
                    let _ = reply.send(());
                }
                StoreMsg::ResetStatus { reply } => {
                    self.nodes.iter_mut().for_each(|n| n.auto_test_status = None);
                    self.save().await;
                    let _ = reply.send(());
                }
            }
        }
    }

    /// 按 id 去重追加，顺序号接续现有列表
    fn append(&mut self, nodes: Vec<NodeRecord>) -> usize {
        let mut seen: HashSet<String> = self.nodes.iter().map(|n| n.id.clone()).collect();
        let mut order = self.nodes.iter().map(|n| n.sort_order).max().map_or(0, |o| o + 1);
        let mut added = 0;
        for mut node in nodes {
            if !seen.insert(node.id.clone()) {
                continue;
            }
            node.sort_order = order;
            order += 1;
            added += 1;
            self.nodes.push(node);
        }
        added
    }

    async fn save(&self) {
        match serde_json::to_vec_pretty(&self.nodes) {
            Ok(json) => {
                if let Err(e) = save_file(&self.path, &json).await {
                    warn!("保存节点列表失败: {}", e);
                }
            }
            Err(e) => warn!("序列化节点列表失败: {}", e),
        }
    }
}

fn apply(node: &mut NodeRecord, m: Measurement, now: i64) {
    match m {
        Measurement::Latency(latency) => {
            node.latency = latency;
            node.is_available = latency.is_measured();
            node.last_tested_at = now;
        }
        Measurement::Bandwidth {
            download_mbps,
            upload_mbps,
        } => {
            if download_mbps.is_some() {
                node.download_mbps = download_mbps;
            }
            if upload_mbps.is_some() {
                node.upload_mbps = upload_mbps;
            }
        }
        Measurement::Unlock { summary, passed } => {
            node.unlock_summary = Some(summary);
            node.unlock_passed = Some(passed);
        }
        Measurement::Status(status) => node.auto_test_status = status,
    }
}

fn closed() -> PilotError {
    PilotError::Custom("节点存储已关闭".to_string())
}

impl NodeStore {
    async fn request<T>(&self, build: impl FnOnce(Sender<T>) -> StoreMsg) -> Result<T> {
        let (reply, rx) = flume::bounded(1);
        self.tx.send_async(build(reply)).await.map_err(|_| closed())?;
        rx.recv_async().await.map_err(|_| closed())
    }

    pub async fn list(&self) -> Result<Vec<NodeRecord>> {
        self.request(|reply| StoreMsg::List { reply }).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<NodeRecord>> {
        let id = id.to_string();
        self.request(|reply| StoreMsg::Get { id, reply }).await
    }

    pub async fn replace(&self, nodes: Vec<NodeRecord>) -> Result<usize> {
        self.request(|reply| StoreMsg::Replace { nodes, reply }).await
    }

    pub async fn insert(&self, nodes: Vec<NodeRecord>) -> Result<usize> {
        self.request(|reply| StoreMsg::Insert { nodes, reply }).await
    }

    pub async fn update(&self, updates: Vec<(String, Measurement)>) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        self.request(|reply| StoreMsg::Update { updates, reply }).await
    }

    pub async fn set_status(&self, ids: &[String], status: AutoTestStatus) -> Result<()> {
        let updates = ids
            .iter()
            .map(|id| (id.clone(), Measurement::Status(Some(status))))
            .collect();
        self.update(updates).await
    }

    pub async fn reset_status(&self) -> Result<()> {
        self.request(|reply| StoreMsg::ResetStatus { reply }).await
    }
}
