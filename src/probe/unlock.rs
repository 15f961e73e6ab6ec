//! 流媒体解锁检测 (Unlock Test)
//!
//! 通过临时 SOCKS 会话调用外部检测程序，抓取标准输出后按平台关键字分类。

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tokio::process::Command;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::error::{PilotError, Result};

/// 判定通过所需的最少解锁数
const MIN_UNLOCKED: usize = 3;

static ANSI_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").expect("valid ANSI regex")
});
static NOT_AVAILABLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bnot\s+available\b").expect("valid regex"));
static YES_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(yes|available|unlocked|full unlock)\b").expect("valid regex")
});
static NO_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(no|blocked|fail|failed|unavailable)\b").expect("valid regex")
});

/// 单行检测结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Yes,
    No,
    Unknown,
}

pub fn strip_ansi(s: &str) -> String {
    ANSI_RE.replace_all(s, "").into_owned()
}

/// `not available` 先于肯定词判断
pub fn classify_line(line: &str) -> Verdict {
    if NOT_AVAILABLE_RE.is_match(line) {
        Verdict::No
    } else if YES_RE.is_match(line) {
        Verdict::Yes
    } else if NO_RE.is_match(line) {
        Verdict::No
    } else {
        Verdict::Unknown
    }
}

/// 一次检测的汇总
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnlockReport {
    pub yes: usize,
    pub no: usize,
    pub lines: Vec<String>,
    pub passed: bool,
}

impl UnlockReport {
    /// 持久化到节点的摘要文本：首行计数，其后为保留的原始行
    pub fn summary(&self) -> String {
        let mut out = format!("YES={}, NO={}\n", self.yes, self.no);
        out.push_str(&self.lines.join("\n"));
        out
    }
}

/// 清理控制序列，仅保留含平台结论的行并计数
pub fn parse_output(output: &str) -> UnlockReport {
    let lines: Vec<String> = strip_ansi(output)
        .lines()
        .map(str::trim)
        .filter(|l| {
            ["YES", "NO", "Available", "Region"]
                .iter()
                .any(|k| l.contains(k))
        })
        .map(String::from)
        .collect();

    let (mut yes, mut no) = (0, 0);
    for line in &lines {
        match classify_line(line) {
            Verdict::Yes => yes += 1,
            Verdict::No => no += 1,
            Verdict::Unknown => {}
        }
    }

    UnlockReport {
        passed: yes >= MIN_UNLOCKED && yes >= no,
        yes,
        no,
        lines,
    }
}

/// 摘要中判定为解锁的平台行数，不限平台
pub fn unlocked_count(summary: &str) -> usize {
    result_lines(summary)
        .filter(|l| classify_line(l) == Verdict::Yes)
        .count()
}

fn result_lines(summary: &str) -> impl Iterator<Item = &str> {
    summary.lines().skip_while(|l| l.starts_with("YES="))
}

/// 摘要中命中指定平台且判定为解锁的数量，每个平台至多计一次
pub fn platform_hits(summary: &str, targets: &[String]) -> usize {
    targets
        .iter()
        .filter(|target| {
            let needle = target.to_lowercase();
            result_lines(summary)
                .any(|l| l.to_lowercase().contains(&needle) && classify_line(l) == Verdict::Yes)
        })
        .count()
}

/// 外部检测程序的调用器
#[derive(Debug, Clone)]
pub struct UnlockRunner {
    bin: PathBuf,
    timeout: Duration,
}

impl UnlockRunner {
    pub fn new(bin: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            bin: bin.into(),
            timeout,
        }
    }

    pub fn args(socks_port: u16) -> Vec<String> {
        vec![
            "-socks-proxy".to_string(),
            format!("socks5://127.0.0.1:{}", socks_port),
            "-f".to_string(),
            "0".to_string(),
            "-L".to_string(),
            "zh".to_string(),
            "-b=false".to_string(),
            "-s=false".to_string(),
        ]
    }

    /// 经由本地 SOCKS 端口执行一次检测
    pub async fn run(&self, socks_port: u16, cancel: &CancellationToken) -> Result<UnlockReport> {
        let mut cmd = Command::new(&self.bin);
        cmd.args(Self::args(socks_port));
        let output = capture_stdout(cmd, self.timeout, cancel).await?;
        let report = parse_output(&output);
        debug!(
            "解锁检测 (port {}): YES={} NO={}",
            socks_port, report.yes, report.no
        );
        Ok(report)
    }
}

/// 运行子进程并收集标准输出；超时或取消时子进程随 future 一同被杀死
pub async fn capture_stdout(
    mut cmd: Command,
    limit: Duration,
    cancel: &CancellationToken,
) -> Result<String> {
    let child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| PilotError::Probe(format!("无法启动解锁检测程序: {}", e)))?;

    let output = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(PilotError::Canceled),
        r = timeout(limit, child.wait_with_output()) => r
            .map_err(|_| PilotError::Probe(format!("解锁检测超时 ({}s)", limit.as_secs())))??,
    };

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
