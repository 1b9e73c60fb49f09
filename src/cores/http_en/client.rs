use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::redirect::Policy;
use tokio::sync::Semaphore;

use super::request::SprayRequest;
use crate::errors::RsprayError;

/// 传输层形态: path 模式走高吞吐客户端(单主机管线), host 模式走标准客户端
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientMode {
    Auto,
    Fast,
    Standard,
}

/// SprayClient 配置
#[derive(Debug, Clone)]
pub struct SprayClientConfig {
    pub mode: ClientMode,
    /// worker 数, fast 模式下同时作为连接池大小
    pub thread: usize,
    pub timeout: Duration,
    /// 附加到每个请求的默认 headers
    pub headers: Vec<(String, String)>,
    /// 全局速率限制(每秒请求数), None 表示不限速
    pub rate_limit: Option<u32>,
    /// 响应体读取上限
    pub max_body_size: usize,
}

impl Default for SprayClientConfig {
    fn default() -> Self {
        Self {
            mode: ClientMode::Standard,
            thread: 20,
            timeout: Duration::from_secs(5),
            headers: Vec::new(),
            rate_limit: None,
            max_body_size: 20480,
        }
    }
}

/// Normalized response handed to the engine.
#[derive(Debug, Clone)]
pub struct SprayResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    /// Content-Length when the server sent one, -1 otherwise
    pub content_length: i64,
}

impl SprayResponse {
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Canonical `K: V\r\n` block used for hashing and display.
    pub fn header_dump(&self) -> String {
        let mut out = String::new();
        for (k, v) in &self.headers {
            out.push_str(k);
            out.push_str(": ");
            out.push_str(v);
            out.push_str("\r\n");
        }
        out
    }
}

/// Token bucket refilled by a background ticker, capped at one second of burst.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    sem: Arc<Semaphore>,
}

impl RateLimiter {
    pub fn new(rate: u32) -> Self {
        let rate = rate.max(1);
        let sem = Arc::new(Semaphore::new(rate as usize));
        let weak = Arc::downgrade(&sem);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs_f64(1.0 / rate as f64));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let Some(sem) = weak.upgrade() else {
                    break;
                };
                if sem.available_permits() < rate as usize {
                    sem.add_permits(1);
                }
            }
        });
        Self { sem }
    }

    pub async fn acquire(&self) {
        if let Ok(permit) = self.sem.acquire().await {
            permit.forget();
        }
    }
}

/// HTTP 客户端封装, 重定向永远不跟随(由引擎自行分类)
#[derive(Debug, Clone)]
pub struct SprayClient {
    client: reqwest::Client,
    limiter: Option<RateLimiter>,
    max_body_size: usize,
}

impl SprayClient {
    pub fn new(config: SprayClientConfig) -> Result<Self, RsprayError> {
        let mut builder = reqwest::Client::builder()
            .timeout(config.timeout)
            .redirect(Policy::none())
            .danger_accept_invalid_certs(true)
            .user_agent("rspray/0.3");

        if matches!(config.mode, ClientMode::Fast) {
            // path 模式下所有请求打到同一主机, 固定 http/1.1 并复用连接
            builder = builder
                .http1_only()
                .tcp_nodelay(true)
                .pool_max_idle_per_host(config.thread.max(1));
        }

        if !config.headers.is_empty() {
            let mut map = HeaderMap::new();
            for (k, v) in &config.headers {
                if let (Ok(name), Ok(value)) = (
                    HeaderName::from_bytes(k.as_bytes()),
                    HeaderValue::from_str(v),
                ) {
                    map.insert(name, value);
                }
            }
            builder = builder.default_headers(map);
        }

        let client = builder
            .build()
            .map_err(|e| RsprayError::NetworkError(e.to_string()))?;

        Ok(Self {
            client,
            limiter: config.rate_limit.map(RateLimiter::new),
            max_body_size: config.max_body_size,
        })
    }

    pub async fn do_request(&self, req: &SprayRequest) -> Result<SprayResponse, RsprayError> {
        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
        }

        let mut builder = self.client.get(&req.url);
        if let Some(vhost) = &req.vhost {
            builder = builder.header(reqwest::header::HOST, vhost.as_str());
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| RsprayError::NetworkError(e.to_string()))?;

        let status = resp.status().as_u16();
        let content_length = resp
            .content_length()
            .map(|v| v as i64)
            .unwrap_or(-1);
        let headers: Vec<(String, String)> = resp
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
            .collect();

        let body = self.read_capped(resp).await;

        Ok(SprayResponse {
            status,
            headers,
            body,
            content_length,
        })
    }

    // Reads at most max_body_size bytes; a short read ended by EOF is not an error.
    async fn read_capped(&self, mut resp: reqwest::Response) -> Bytes {
        let mut buf = BytesMut::with_capacity(1024);
        while buf.len() < self.max_body_size {
            match resp.chunk().await {
                Ok(Some(chunk)) => buf.extend_from_slice(&chunk),
                Ok(None) => break,
                Err(_) => break,
            }
        }
        buf.truncate(self.max_body_size);
        buf.freeze()
    }
}
