use bytes::Bytes;
use serde::{Serialize, Serializer};
use url::Url;

use super::context::EngineContext;
use super::crawl;
use super::fingerprint::{self, Extracted, Framework};
use super::types::{Reason, SourceType, SIMHASH_DISTANCE};
use crate::cores::http_en::SprayResponse;

/// Result of the exact comparison between a learned baseline and a candidate.
/// Mirrors the 0 / 1 / -1 convention of the classifier contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExactMatch {
    /// structurally equal: MD5 match, or same non-empty redirect target
    Equal,
    /// clearly different from the learned sample
    Distinct,
    /// the learned side carries no usable sample
    Missing,
}

fn hex<S: Serializer>(v: &u64, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&format!("{:x}", v))
}

/// 一次响应的不可变记录. Collect 之后不再变更指纹字段.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Baseline {
    #[serde(skip)]
    pub url: Option<Url>,
    #[serde(rename = "url")]
    pub url_string: String,
    pub path: String,
    pub status: u16,
    pub body_length: i64,
    pub header_length: usize,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub redirect_url: String,
    #[serde(skip)]
    pub body: Bytes,
    #[serde(skip)]
    pub header: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub md5: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub mmh3: String,
    #[serde(serialize_with = "hex")]
    pub simhash: u64,
    pub is_dynamic_url: bool,
    pub exceed_length: bool,
    /// 耗时, 毫秒
    pub spended: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub frameworks: Vec<Framework>,
    #[serde(rename = "extracts", skip_serializing_if = "Vec::is_empty")]
    pub extracteds: Vec<Extracted>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub front_url: String,
    pub source: SourceType,
    pub req_depth: usize,
    pub recu_depth: usize,
    #[serde(skip)]
    pub number: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(rename = "error", skip_serializing_if = "String::is_empty")]
    pub err_string: String,
    pub is_valid: bool,
    pub is_fuzzy: bool,
    #[serde(skip)]
    pub recu: bool,
    #[serde(skip)]
    pub dir: bool,
    #[serde(skip)]
    pub collected: bool,
    #[serde(skip)]
    pub urls: Vec<String>,
}

impl Baseline {
    pub fn new(url_string: &str, resp: &SprayResponse) -> Self {
        let url = Url::parse(url_string).ok();
        let path = url
            .as_ref()
            .map(|u| u.path().to_string())
            .unwrap_or_else(|| "/".to_string());
        let dir = path.ends_with('/');
        let header = resp.header_dump();
        let body_length = if resp.content_length >= 0 {
            resp.content_length
        } else {
            resp.body.len() as i64
        };
        Self {
            url,
            url_string: url_string.to_string(),
            path,
            dir,
            status: resp.status,
            body_length,
            header_length: header.len(),
            header,
            redirect_url: resp.get_header("location").unwrap_or("").to_string(),
            body: resp.body.clone(),
            is_valid: true,
            ..Self::default()
        }
    }

    /// PreCompare rejection: only status, url, redirect and the reason survive.
    pub fn invalid(url_string: &str, resp: &SprayResponse, reason: Reason) -> Self {
        Self {
            url: Url::parse(url_string).ok(),
            url_string: url_string.to_string(),
            status: resp.status,
            body_length: resp.content_length.max(0),
            redirect_url: resp.get_header("location").unwrap_or("").to_string(),
            reason: reason.as_str().to_string(),
            is_valid: false,
            ..Self::default()
        }
    }

    /// Transport failure: no response at all.
    pub fn failed(url_string: &str, err: impl Into<String>) -> Self {
        Self {
            url_string: url_string.to_string(),
            err_string: err.into(),
            reason: Reason::RequestFailed.as_str().to_string(),
            is_valid: false,
            ..Self::default()
        }
    }

    /// Computes all fingerprints and extracted artefacts. Idempotent: the
    /// second and later calls are no-ops.
    pub fn collect(&mut self, ctx: &EngineContext) {
        if self.collected {
            return;
        }
        self.collected = true;

        self.md5 = fingerprint::md5_hash(&self.body);
        self.mmh3 = fingerprint::mmh3_hash32(&self.body);
        self.simhash = fingerprint::simhash64(&self.body);

        let body_str = String::from_utf8_lossy(&self.body);
        let probe = self.path.trim_start_matches('/');
        if probe.len() > 1 && body_str.contains(probe) {
            // 响应体回显了请求路径, 该页面不可用于模糊对比
            self.is_dynamic_url = true;
        }
        self.frameworks = fingerprint::finger_detect(&self.header, &body_str, &ctx.fingers);
        self.extracteds = fingerprint::extract(&body_str, &ctx.extractors);
    }

    /// Parses the body for crawlable URLs; cached on first call.
    pub fn collect_urls(&mut self) {
        if !self.urls.is_empty() || self.body.is_empty() {
            return;
        }
        self.urls = crawl::collect_urls(&String::from_utf8_lossy(&self.body));
    }

    /// Exact comparison, self being the learned baseline.
    pub fn compare(&self, other: &Baseline) -> ExactMatch {
        if !self.collected && self.redirect_url.is_empty() {
            return ExactMatch::Missing;
        }
        if !self.md5.is_empty() && self.md5 == other.md5 {
            return ExactMatch::Equal;
        }
        if !self.redirect_url.is_empty() && self.redirect_url == other.redirect_url {
            return ExactMatch::Equal;
        }
        ExactMatch::Distinct
    }

    /// Fuzzy "same template, different content" relation, self being the
    /// learned baseline. Dynamic-url baselines match everything trivially
    /// and are therefore never used.
    pub fn fuzzy_compare(&self, other: &Baseline) -> bool {
        if self.is_dynamic_url {
            return false;
        }
        if self.status != other.status {
            return false;
        }
        fingerprint::hamming(self.simhash, other.simhash) <= SIMHASH_DISTANCE
    }

    /// One-line human output, `[+] url - status - length [-> redirect] [frames]`.
    pub fn describe(&self) -> String {
        let mut line = String::new();
        line.push_str(&self.url_string);
        line.push_str(&format!(" - {} - {}", self.status, self.body_length));
        if !self.redirect_url.is_empty() {
            line.push_str(" -> ");
            line.push_str(&self.redirect_url);
        }
        for f in &self.frameworks {
            line.push(' ');
            line.push_str(&f.to_tag());
        }
        if !self.err_string.is_empty() {
            line.push_str(&format!(" error: {}", self.err_string));
        }
        line
    }

    /// Compact form used in the `[baseline.*]` init log lines.
    pub fn brief(&self) -> String {
        let mut line = format!("{} - {}ms", self.status, self.spended);
        line.push_str(&format!(" - len:{}", self.body_length));
        if !self.redirect_url.is_empty() {
            line.push_str(&format!(" -> {}", self.redirect_url));
        }
        for f in &self.frameworks {
            line.push(' ');
            line.push_str(&f.to_tag());
        }
        line
    }

    pub fn jsonify(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
