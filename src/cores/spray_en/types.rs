use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

pub const WHITE_STATUS: &[u16] = &[200];
pub const BLACK_STATUS: &[u16] = &[400, 410];
pub const FUZZY_STATUS: &[u16] = &[403, 404, 500, 501, 502, 503];
pub const WAF_STATUS: &[u16] = &[493, 418, 1020, 406];

pub const MAX_REDIRECT: usize = 3;
pub const MAX_CRAWL: usize = 3;

/// 存储的响应体上限（指纹计算只看前 20480 字节）
pub const MAX_BODY_COLLECT: usize = 20480;
/// 超过该长度的响应会被打上 exceed_length 标记
pub const DEFAULT_MAX_BODY_SIZE: i64 = 100 * 1024;

/// simhash 汉明距离阈值, 距离小于等于该值视为同模板页面
pub const SIMHASH_DISTANCE: u32 = 8;

/// Rejection reasons, kept as stable strings for stats and output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    BadStatus,
    SameStatus,
    RequestFailed,
    Waf,
    Redirect,
    CompareFailed,
    FuzzyCompareFailed,
    CustomFilter,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::BadStatus => "bad status",
            Reason::SameStatus => "same status",
            Reason::RequestFailed => "request failed",
            Reason::Waf => "maybe ban of waf",
            Reason::Redirect => "duplicate redirect url",
            Reason::CompareFailed => "compare failed",
            Reason::FuzzyCompareFailed => "fuzzy compare failed",
            Reason::CustomFilter => "custom filter",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Label attached to each request unit; decides post-processing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Check,
    InitRandom,
    InitIndex,
    #[default]
    Word,
    Redirect,
    Crawl,
    Rule,
    Active,
    Bak,
}

impl SourceType {
    pub fn name(&self) -> &'static str {
        match self {
            SourceType::Check => "check",
            SourceType::InitRandom => "random",
            SourceType::InitIndex => "index",
            SourceType::Word => "word",
            SourceType::Redirect => "redirect",
            SourceType::Crawl => "crawl",
            SourceType::Rule => "rule",
            SourceType::Active => "active",
            SourceType::Bak => "bak",
        }
    }

    /// Sources whose responses always get a full baseline, skipping PreCompare.
    pub fn always_collectable(&self) -> bool {
        matches!(
            self,
            SourceType::Check | SourceType::InitRandom | SourceType::InitIndex | SourceType::Crawl
        )
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A pending probe: one path plus the context it was derived in.
#[derive(Debug, Clone)]
pub struct Unit {
    pub path: String,
    pub source: SourceType,
    /// redirect/crawl follow counter
    pub depth: usize,
    /// word-stream cursor, used to rewind the stat end pointer on abort
    pub number: i64,
    /// the URL that produced this redirect, empty otherwise
    pub front_url: String,
}

impl Unit {
    pub fn new(path: impl Into<String>, source: SourceType) -> Self {
        Self {
            path: path.into(),
            source,
            depth: 0,
            number: 0,
            front_url: String::new(),
        }
    }

    pub fn with_depth(mut self, depth: usize) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_number(mut self, number: i64) -> Self {
        self.number = number;
        self
    }

    pub fn with_front_url(mut self, front_url: impl Into<String>) -> Self {
        self.front_url = front_url.into();
        self
    }
}

/// Cooperative cancellation token. Children derive from a parent so one
/// target can be cancelled without touching its siblings.
#[derive(Debug, Default)]
pub struct Shutdown {
    flag: AtomicBool,
    notify: Notify,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Counts in-flight units so the dispatcher knows when a target is drained.
#[derive(Debug, Default)]
pub struct Pending {
    count: AtomicI64,
    notify: Notify,
}

impl Pending {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, n: i64) {
        self.count.fetch_add(n, Ordering::SeqCst);
    }

    pub fn done(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.notify.notify_waiters();
        }
    }

    pub fn count(&self) -> i64 {
        self.count.load(Ordering::SeqCst)
    }

    pub async fn wait_idle(&self) {
        loop {
            if self.count() <= 0 {
                return;
            }
            let notified = self.notify.notified();
            if self.count() <= 0 {
                return;
            }
            notified.await;
        }
    }
}

const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Random non-existent path used for the baseline and liveness probes.
pub fn rand_path() -> String {
    let mut rng = rand::thread_rng();
    let mut s = String::with_capacity(16);
    s.push('/');
    for _ in 0..15 {
        s.push(LETTERS[rng.gen_range(0..LETTERS.len())] as char);
    }
    s
}

/// Random vhost label for host-mode probes.
pub fn rand_host() -> String {
    let mut rng = rand::thread_rng();
    (0..12)
        .map(|_| LETTERS[rng.gen_range(0..26)] as char)
        .collect()
}

/// Join a base URL and a path fragment with exactly one slash between them.
pub fn safe_url_join(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    if path.starts_with('/') {
        format!("{}{}", base, path)
    } else {
        format!("{}/{}", base, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_strings_are_stable() {
        assert_eq!(Reason::BadStatus.as_str(), "bad status");
        assert_eq!(Reason::Waf.as_str(), "maybe ban of waf");
        assert_eq!(Reason::Redirect.as_str(), "duplicate redirect url");
        assert_eq!(Reason::FuzzyCompareFailed.as_str(), "fuzzy compare failed");
    }

    #[test]
    fn rand_path_shape() {
        let p = rand_path();
        assert!(p.starts_with('/'));
        assert_eq!(p.len(), 16);
        assert!(p[1..].chars().all(|c| c.is_ascii_alphabetic()));
        assert_ne!(rand_path(), rand_path());
    }

    #[test]
    fn url_join_normalizes_slashes() {
        assert_eq!(safe_url_join("http://a.com/", "/x"), "http://a.com/x");
        assert_eq!(safe_url_join("http://a.com", "x"), "http://a.com/x");
        assert_eq!(safe_url_join("http://a.com", "/x"), "http://a.com/x");
    }

    #[tokio::test]
    async fn pending_wait_idle_releases() {
        use std::sync::Arc;
        let p = Arc::new(Pending::new());
        p.add(2);
        let p2 = p.clone();
        let waiter = tokio::spawn(async move { p2.wait_idle().await });
        p.done();
        p.done();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("wait_idle should release")
            .unwrap();
    }

    #[tokio::test]
    async fn shutdown_wait_observes_cancel() {
        use std::sync::Arc;
        let s = Arc::new(Shutdown::new());
        let s2 = s.clone();
        let waiter = tokio::spawn(async move { s2.wait().await });
        s.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("wait should release")
            .unwrap();
        assert!(s.is_cancelled());
    }
}
