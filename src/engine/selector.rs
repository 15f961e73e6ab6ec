//! 最优节点选择与分区采样 (Best Node Selection)
//!
//! 纯函数：没有有效测量值的节点不参与比较，全部无效时返回 `None`。

use std::cmp::Ordering;

use indexmap::IndexMap;

use crate::core::model::NodeRecord;
use crate::core::prefer::{BestNodePriority, UnlockPriorityMode};
use crate::probe::unlock::{platform_hits, unlocked_count};

fn positive(v: Option<f64>) -> Option<f64> {
    v.filter(|x| x.is_finite() && *x > 0.0)
}

/// 解锁排序的平手裁决：延迟更低者优先，其次下载带宽更高者
fn tie_break(a: &NodeRecord, b: &NodeRecord) -> Ordering {
    let la = a.latency.millis().unwrap_or(u32::MAX);
    let lb = b.latency.millis().unwrap_or(u32::MAX);
    la.cmp(&lb).then_with(|| {
        let da = a.download_mbps.unwrap_or(0.0);
        let db = b.download_mbps.unwrap_or(0.0);
        db.partial_cmp(&da).unwrap_or(Ordering::Equal)
    })
}

/// 在候选中取 `better` 判定为更优者，平手保留靠前的节点
fn pick<'a, K>(
    nodes: &'a [NodeRecord],
    key: impl Fn(&NodeRecord) -> Option<K>,
    better: impl Fn((&K, &NodeRecord), (&K, &NodeRecord)) -> bool,
) -> Option<&'a NodeRecord> {
    let mut best: Option<(K, &NodeRecord)> = None;
    for node in nodes {
        let Some(k) = key(node) else { continue };
        let replace = match &best {
            None => true,
            Some((bk, bn)) => better((&k, node), (bk, *bn)),
        };
        if replace {
            best = Some((k, node));
        }
    }
    best.map(|(_, n)| n)
}

pub fn select_best<'a>(
    nodes: &'a [NodeRecord],
    priority: BestNodePriority,
    unlock_mode: UnlockPriorityMode,
    target_site_ids: &[String],
) -> Option<&'a NodeRecord> {
    match priority {
        BestNodePriority::Latency => pick(
            nodes,
            |n| n.latency.millis().filter(|ms| *ms > 0),
            |(a, _), (b, _)| a < b,
        ),
        BestNodePriority::Download => {
            pick(nodes, |n| positive(n.download_mbps), |(a, _), (b, _)| a > b)
        }
        BestNodePriority::Upload => {
            pick(nodes, |n| positive(n.upload_mbps), |(a, _), (b, _)| a > b)
        }
        BestNodePriority::UnlockCount => {
            let count = |n: &NodeRecord| {
                let summary = n.unlock_summary.as_deref()?;
                let hits = match unlock_mode {
                    UnlockPriorityMode::Count => unlocked_count(summary),
                    UnlockPriorityMode::TargetSites => platform_hits(summary, target_site_ids),
                };
                (hits > 0).then_some(hits)
            };
            pick(nodes, count, |(a, an), (b, bn)| {
                a > b || (a == b && tie_break(an, bn) == Ordering::Less)
            })
        }
    }
}

/// 按延迟升序排列，未测量或不可达的节点排在最后并保持原有顺序
pub fn rank_by_latency(nodes: &mut [NodeRecord]) {
    nodes.sort_by_key(|n| n.latency.millis().unwrap_or(u32::MAX));
}

/// 昂贵阶段前的采样：按地区分桶时每个地区至多 `limit` 个，否则整体取前 `limit` 个
///
/// 输入顺序即优先级，调用方应先按延迟排序。
pub fn sample(nodes: Vec<NodeRecord>, limit: usize, by_region: bool) -> Vec<NodeRecord> {
    if !by_region {
        return nodes.into_iter().take(limit).collect();
    }

    let mut buckets: IndexMap<String, Vec<NodeRecord>> = IndexMap::new();
    for node in nodes {
        let bucket = buckets.entry(node.region_key()).or_default();
        if bucket.len() < limit {
            bucket.push(node);
        }
    }
    buckets.into_values().flatten().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{Latency, NodeType};

    fn node(id: &str, latency: Latency) -> NodeRecord {
        let mut n = NodeRecord::new(
            id.into(),
            id.into(),
            NodeType::Vless,
            "1.1.1.1".into(),
            443,
            format!("vless://u@1.1.1.1:443#{}", id),
        );
        n.latency = latency;
        n
    }

    #[test]
    fn empty_list_selects_nothing() {
        for p in [
            BestNodePriority::Latency,
            BestNodePriority::Download,
            BestNodePriority::Upload,
            BestNodePriority::UnlockCount,
        ] {
            assert!(select_best(&[], p, UnlockPriorityMode::Count, &[]).is_none());
        }
    }

    #[test]
    fn single_measured_node_wins_on_latency() {
        let nodes = vec![
            node("a", Latency::Untested),
            node("b", Latency::Measured(900)),
            node("c", Latency::Unreachable),
        ];
        let best = select_best(&nodes, BestNodePriority::Latency, UnlockPriorityMode::Count, &[]);
        assert_eq!(best.map(|n| n.id.as_str()), Some("b"));
    }

    #[test]
    fn bandwidth_priorities_ignore_missing_values() {
        let mut nodes = vec![
            node("a", Latency::Measured(10)),
            node("b", Latency::Measured(20)),
            node("c", Latency::Measured(30)),
        ];
        nodes[0].download_mbps = Some(50.0);
        nodes[1].download_mbps = Some(120.0);
        nodes[2].upload_mbps = Some(8.0);

        let dl = select_best(&nodes, BestNodePriority::Download, UnlockPriorityMode::Count, &[]);
        assert_eq!(dl.unwrap().id, "b");
        let ul = select_best(&nodes, BestNodePriority::Upload, UnlockPriorityMode::Count, &[]);
        assert_eq!(ul.unwrap().id, "c");

        nodes[2].upload_mbps = None;
        assert!(
            select_best(&nodes, BestNodePriority::Upload, UnlockPriorityMode::Count, &[]).is_none()
        );
    }

    #[test]
    fn unlock_count_breaks_ties_by_latency_then_download() {
        let both = "YES=2, NO=0\nNetflix: YES\nChatGPT: YES";
        let mut nodes = vec![
            node("slow", Latency::Measured(300)),
            node("fast", Latency::Measured(100)),
            node("fast-wide", Latency::Measured(100)),
            node("one", Latency::Measured(5)),
        ];
        nodes[0].unlock_summary = Some(both.into());
        nodes[1].unlock_summary = Some(both.into());
        nodes[1].download_mbps = Some(10.0);
        nodes[2].unlock_summary = Some(both.into());
        nodes[2].download_mbps = Some(90.0);
        nodes[3].unlock_summary = Some("YES=1, NO=0\nNetflix: YES".into());

        let best = select_best(&nodes, BestNodePriority::UnlockCount, UnlockPriorityMode::Count, &[]);
        assert_eq!(best.unwrap().id, "fast-wide");

        // 只关心 ChatGPT 时四个节点中三个平手，仍按延迟与带宽裁决
        let targets = vec!["ChatGPT".to_string()];
        let best = select_best(
            &nodes,
            BestNodePriority::UnlockCount,
            UnlockPriorityMode::TargetSites,
            &targets,
        );
        assert_eq!(best.unwrap().id, "fast-wide");

        let targets = vec!["Spotify".to_string()];
        assert!(
            select_best(
                &nodes,
                BestNodePriority::UnlockCount,
                UnlockPriorityMode::TargetSites,
                &targets
            )
            .is_none()
        );
    }

    #[test]
    fn ranking_puts_unmeasured_last() {
        let mut nodes = vec![
            node("x", Latency::Unreachable),
            node("y", Latency::Measured(80)),
            node("z", Latency::Measured(20)),
        ];
        rank_by_latency(&mut nodes);
        let ids: Vec<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["z", "y", "x"]);
    }

    #[test]
    fn sampling_caps_each_region() {
        let mut nodes = Vec::new();
        for (id, name) in [
            ("1", "🇯🇵 Tokyo 1"),
            ("2", "🇯🇵 Tokyo 2"),
            ("3", "🇺🇸 LA"),
            ("4", "🇯🇵 Osaka"),
            ("5", "plain"),
        ] {
            let mut n = node(id, Latency::Measured(50));
            n.name = name.into();
            nodes.push(n);
        }

        let ids = |v: Vec<NodeRecord>| v.into_iter().map(|n| n.id).collect::<Vec<_>>();
        assert_eq!(ids(sample(nodes.clone(), 2, false)), vec!["1", "2"]);
        assert_eq!(ids(sample(nodes, 2, true)), vec!["1", "2", "3", "5"]);
    }
}
