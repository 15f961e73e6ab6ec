//! 带宽探测 (Bandwidth Probe)
//!
//! 对测速端点下载或上传固定大小的负载，按固定墙钟间隔采样瞬时吞吐。
//! 峰值取采样最大值，均值在结束时按总字节数与总耗时计算。
//! 上传由定时器按间隔读取请求体已被拉取的字节数，采样在传输过程中实时回调。
//! 取消是协作式的：读写循环检查取消令牌后提前返回，不视为错误。

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures::StreamExt;
use reqwest::{Body, Client, Proxy};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::error::{PilotError, Result};
use crate::utils::now_millis;

/// 采样间隔
pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(100);
/// 上传分块大小
pub const CHUNK_SIZE: usize = 8192;
pub const MB: u64 = 1024 * 1024;

/// 一次测速的结果
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BandwidthResult {
    pub avg_mbps: f64,
    pub peak_mbps: f64,
    pub total_bytes: u64,
    pub duration_ms: u64,
    /// 因取消提前结束
    pub canceled: bool,
}

fn to_mbps(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    bytes as f64 * 8.0 / secs / 1_000_000.0
}

/// 吞吐采样器
#[derive(Debug)]
pub struct ThroughputSampler {
    start: Instant,
    last_at: Instant,
    last_bytes: u64,
    total: u64,
    peak_mbps: f64,
    interval: Duration,
}

impl ThroughputSampler {
    pub fn new(interval: Duration) -> Self {
        Self::starting_at(Instant::now(), interval)
    }

    pub fn starting_at(start: Instant, interval: Duration) -> Self {
        Self {
            start,
            last_at: start,
            last_bytes: 0,
            total: 0,
            peak_mbps: 0.0,
            interval,
        }
    }

    pub fn record(&mut self, bytes: u64) -> Option<f64> {
        self.record_at(bytes, Instant::now())
    }

    /// 累加字节数；距上次采样超过间隔时返回该区间的瞬时 Mbps
    pub fn record_at(&mut self, bytes: u64, now: Instant) -> Option<f64> {
        self.total += bytes;
        let since = now.saturating_duration_since(self.last_at);
        if since < self.interval {
            return None;
        }
        let sample = to_mbps(self.total - self.last_bytes, since);
        self.peak_mbps = self.peak_mbps.max(sample);
        self.last_at = now;
        self.last_bytes = self.total;
        Some(sample)
    }

    pub fn total_bytes(&self) -> u64 {
        self.total
    }

    pub fn finish(&self, canceled: bool) -> BandwidthResult {
        self.finish_at(Instant::now(), canceled)
    }

    pub fn finish_at(&self, now: Instant, canceled: bool) -> BandwidthResult {
        let elapsed = now.saturating_duration_since(self.start);
        let avg = to_mbps(self.total, elapsed);
        BandwidthResult {
            avg_mbps: avg,
            // 整个传输也是一个采样窗口，峰值不低于均值
            peak_mbps: self.peak_mbps.max(avg),
            total_bytes: self.total,
            duration_ms: elapsed.as_millis() as u64,
            canceled,
        }
    }
}

/// 采样回调，参数为瞬时 Mbps
pub type SampleFn<'a> = &'a (dyn Fn(f64) + Send + Sync);

pub struct BandwidthProbe {
    client: Client,
    download_url: String,
    upload_url: String,
}

impl BandwidthProbe {
    /// `socks_port` 指定时经由本地 SOCKS 入站测速，远端解析域名
    pub fn new(
        download_url: impl Into<String>,
        upload_url: impl Into<String>,
        socks_port: Option<u16>,
        timeout: Duration,
    ) -> Result<Self> {
        let mut builder = Client::builder().timeout(timeout);
        builder = match socks_port {
            Some(port) => builder.proxy(Proxy::all(format!("socks5h://127.0.0.1:{}", port))?),
            None => builder.no_proxy(),
        };
        Ok(Self {
            client: builder.build()?,
            download_url: download_url.into(),
            upload_url: upload_url.into(),
        })
    }

    pub async fn download_test(
        &self,
        size_bytes: u64,
        cancel: &CancellationToken,
        on_sample: Option<SampleFn<'_>>,
    ) -> Result<BandwidthResult> {
        let url = format!(
            "{}?bytes={}&r={}",
            self.download_url,
            size_bytes,
            now_millis()
        );
        let mut sampler = ThroughputSampler::new(SAMPLE_INTERVAL);

        let resp = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(sampler.finish(true)),
            r = self.client.get(&url).send() => r?,
        };
        let resp = resp.error_for_status()?;
        let mut stream = resp.bytes_stream();

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("下载测速已取消: {} bytes", sampler.total_bytes());
                    return Ok(sampler.finish(true));
                }
                c = stream.next() => c,
            };
            match chunk {
                Some(Ok(bytes)) => {
                    if let Some(mbps) = sampler.record(bytes.len() as u64)
                        && let Some(cb) = on_sample
                    {
                        cb(mbps);
                    }
                }
                Some(Err(e)) => return Err(PilotError::Network(e)),
                None => break,
            }
        }

        let result = sampler.finish(false);
        debug!("下载测速完成: {:?}", result);
        Ok(result)
    }

    pub async fn upload_test(
        &self,
        size_bytes: u64,
        cancel: &CancellationToken,
        on_sample: Option<SampleFn<'_>>,
    ) -> Result<BandwidthResult> {
        let url = format!("{}?r={}", self.upload_url, now_millis());
        let mut sampler = ThroughputSampler::new(SAMPLE_INTERVAL);

        // 请求体被 hyper 拉取一块就计一块，受连接背压约束
        let pulled = Arc::new(AtomicU64::new(0));
        let chunks = (size_bytes as usize).div_ceil(CHUNK_SIZE);
        let body_pulled = pulled.clone();
        let body_cancel = cancel.clone();
        let stream = futures::stream::iter(0..chunks)
            .take_while(move |_| futures::future::ready(!body_cancel.is_cancelled()))
            .map(move |i| {
                let len = if i + 1 == chunks {
                    size_bytes as usize - i * CHUNK_SIZE
                } else {
                    CHUNK_SIZE
                };
                body_pulled.fetch_add(len as u64, Ordering::Relaxed);
                Ok::<_, std::io::Error>(bytes::Bytes::from(vec![0u8; len]))
            });

        let request = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(Body::wrap_stream(stream))
            .send();
        tokio::pin!(request);

        let first_tick = time::Instant::now() + SAMPLE_INTERVAL;
        let mut ticker = time::interval_at(first_tick, SAMPLE_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut counted = 0u64;
        let mut take_delta = |sampler: &mut ThroughputSampler, at: Instant| {
            let total = pulled.load(Ordering::Relaxed);
            let sample = sampler.record_at(total - counted, at);
            counted = total;
            sample
        };

        let outcome = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break None,
                r = &mut request => break Some(r),
                deadline = ticker.tick() => {
                    if let Some(mbps) = take_delta(&mut sampler, deadline.into_std())
                        && let Some(cb) = on_sample
                    {
                        cb(mbps);
                    }
                }
            }
        };
        if let Some(mbps) = take_delta(&mut sampler, Instant::now())
            && let Some(cb) = on_sample
        {
            cb(mbps);
        }

        let result = match outcome {
            None => {
                debug!("上传测速已取消: {} bytes", sampler.total_bytes());
                sampler.finish(true)
            }
            Some(resp) => {
                resp?.error_for_status()?;
                sampler.finish(cancel.is_cancelled())
            }
        };
        debug!("上传测速结束: {:?}", result);
        Ok(result)
    }
}
