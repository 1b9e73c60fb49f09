use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::types::SourceType;

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Per-target counters. The hot-path counters (req_total, failed_number)
/// are bumped from worker callbacks and therefore atomic; the histograms
/// are only touched by the serial classifier but stay behind a mutex so
/// the snapshot can be taken from anywhere.
#[derive(Debug)]
pub struct Statistor {
    pub base_url: String,
    /// wordlist size for this target
    pub word_total: i64,
    /// resume cursor: words with sequence number <= offset are skipped
    pub offset: i64,
    pub end: AtomicI64,
    pub req_total: AtomicI32,
    pub check_number: AtomicI32,
    pub found_number: AtomicI32,
    pub filtered_number: AtomicI32,
    pub fuzzy_number: AtomicI32,
    pub waf_number: AtomicI32,
    pub failed_number: AtomicI32,
    counts: Mutex<HashMap<u16, i32>>,
    sources: Mutex<HashMap<String, i32>>,
    pub start_time: u64,
    pub end_time: AtomicU64,
    error: Mutex<String>,
    pub dict_files: Vec<String>,
    pub rule_files: Vec<String>,
    pub append_rule_file: Option<String>,
}

impl Statistor {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            word_total: 0,
            offset: 0,
            end: AtomicI64::new(0),
            req_total: AtomicI32::new(0),
            check_number: AtomicI32::new(0),
            found_number: AtomicI32::new(0),
            filtered_number: AtomicI32::new(0),
            fuzzy_number: AtomicI32::new(0),
            waf_number: AtomicI32::new(0),
            failed_number: AtomicI32::new(0),
            counts: Mutex::new(HashMap::new()),
            sources: Mutex::new(HashMap::new()),
            start_time: unix_now(),
            end_time: AtomicU64::new(0),
            error: Mutex::new(String::new()),
            dict_files: Vec::new(),
            rule_files: Vec::new(),
            append_rule_file: None,
        }
    }

    /// Recreates a target from a stat-stream record: the previous end
    /// cursor becomes the new offset, counters start fresh.
    pub fn from_data(data: &StatistorData) -> Self {
        let mut stat = Self::new(data.base_url.clone());
        stat.word_total = data.total;
        stat.offset = data.end;
        stat.dict_files = data.dict_files.clone();
        stat.rule_files = data.rule_files.clone();
        stat.append_rule_file = data.append_rule_file.clone();
        stat
    }

    pub fn incr_count(&self, status: u16) {
        *self.counts.lock().unwrap().entry(status).or_insert(0) += 1;
    }

    pub fn incr_source(&self, source: SourceType) {
        *self
            .sources
            .lock()
            .unwrap()
            .entry(source.name().to_string())
            .or_insert(0) += 1;
    }

    pub fn set_error(&self, err: impl Into<String>) {
        *self.error.lock().unwrap() = err.into();
    }

    pub fn error(&self) -> String {
        self.error.lock().unwrap().clone()
    }

    pub fn mark_end(&self) {
        self.end_time.store(unix_now(), Ordering::SeqCst);
    }

    /// Rewinds the end cursor so resume does not skip unscanned words.
    pub fn rewind_end(&self, number: i64) {
        self.end.store(number, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> StatistorData {
        StatistorData {
            base_url: self.base_url.clone(),
            error: self.error(),
            total: self.word_total,
            offset: self.offset,
            end: self.end.load(Ordering::SeqCst),
            req_total: self.req_total.load(Ordering::SeqCst),
            check_number: self.check_number.load(Ordering::SeqCst),
            found_number: self.found_number.load(Ordering::SeqCst),
            filtered_number: self.filtered_number.load(Ordering::SeqCst),
            fuzzy_number: self.fuzzy_number.load(Ordering::SeqCst),
            waf_number: self.waf_number.load(Ordering::SeqCst),
            failed_number: self.failed_number.load(Ordering::SeqCst),
            counts: self.counts.lock().unwrap().clone(),
            sources: self.sources.lock().unwrap().clone(),
            start_time: self.start_time,
            end_time: self.end_time.load(Ordering::SeqCst),
            dict_files: self.dict_files.clone(),
            rule_files: self.rule_files.clone(),
            append_rule_file: self.append_rule_file.clone(),
        }
    }

    pub fn summary(&self) -> String {
        let d = self.snapshot();
        format!(
            "[stat] {} finish, total: {}, offset: {}, end: {}, requests: {}, found: {}, check: {}, failed: {}{}",
            d.base_url,
            d.total,
            d.offset,
            d.end,
            d.req_total,
            d.found_number,
            d.check_number,
            d.failed_number,
            if d.error.is_empty() {
                String::new()
            } else {
                format!(", error: {}", d.error)
            }
        )
    }

    pub fn counts_summary(&self) -> String {
        let counts = self.counts.lock().unwrap();
        let mut entries: Vec<_> = counts.iter().collect();
        entries.sort_by_key(|(status, _)| **status);
        let parts: Vec<String> = entries
            .iter()
            .map(|(status, n)| format!("{}: {}", status, n))
            .collect();
        format!("[stat] status: {{{}}}", parts.join(", "))
    }

    pub fn sources_summary(&self) -> String {
        let sources = self.sources.lock().unwrap();
        let mut entries: Vec<_> = sources.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        let parts: Vec<String> = entries
            .iter()
            .map(|(src, n)| format!("{}: {}", src, n))
            .collect();
        format!("[stat] sources: {{{}}}", parts.join(", "))
    }
}

/// Serializable snapshot: one JSON object per target on the stat stream,
/// reloadable for resume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatistorData {
    pub base_url: String,
    #[serde(default)]
    pub error: String,
    pub total: i64,
    pub offset: i64,
    pub end: i64,
    pub req_total: i32,
    pub check_number: i32,
    pub found_number: i32,
    pub filtered_number: i32,
    pub fuzzy_number: i32,
    pub waf_number: i32,
    pub failed_number: i32,
    #[serde(default)]
    pub counts: HashMap<u16, i32>,
    #[serde(default)]
    pub sources: HashMap<String, i32>,
    pub start_time: u64,
    pub end_time: u64,
    #[serde(default)]
    pub dict_files: Vec<String>,
    #[serde(default)]
    pub rule_files: Vec<String>,
    #[serde(default)]
    pub append_rule_file: Option<String>,
}

impl StatistorData {
    pub fn is_finished(&self) -> bool {
        self.total > 0 && self.end >= self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_round_trip_preserves_cursor() {
        let stat = Statistor::new("http://example.com");
        stat.end.store(120, Ordering::SeqCst);
        stat.req_total.store(118, Ordering::SeqCst);
        stat.incr_count(200);
        stat.incr_count(404);
        stat.incr_count(404);
        stat.incr_source(SourceType::Word);
        stat.set_error("");

        let json = serde_json::to_string(&stat.snapshot()).unwrap();
        let data: StatistorData = serde_json::from_str(&json).unwrap();
        assert_eq!(data.end, 120);
        assert_eq!(data.counts[&404], 2);

        let resumed = Statistor::from_data(&data);
        // first unscanned word of the previous run becomes the new offset
        assert_eq!(resumed.offset, 120);
        assert_eq!(resumed.end.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn finished_detection() {
        let mut data = StatistorData::default();
        data.total = 100;
        data.end = 100;
        assert!(data.is_finished());
        data.end = 40;
        assert!(!data.is_finished());
        data.total = 0;
        assert!(!data.is_finished());
    }

    #[test]
    fn rewind_moves_end_back() {
        let stat = Statistor::new("http://example.com");
        stat.end.store(500, Ordering::SeqCst);
        stat.rewind_end(321);
        assert_eq!(stat.snapshot().end, 321);
    }
}
