use std::sync::Arc;

use regex::Regex;
use tokio::sync::mpsc;

use crate::errors::RsprayError;

/// Per-word transforms applied by the feeder, configured from the CLI.
#[derive(Debug, Clone)]
pub enum WordFn {
    Lowercase,
    Uppercase,
    Prefix(String),
    Suffix(String),
}

impl WordFn {
    pub fn apply(&self, word: &str) -> String {
        match self {
            WordFn::Lowercase => word.to_lowercase(),
            WordFn::Uppercase => word.to_uppercase(),
            WordFn::Prefix(p) => format!("{}{}", p, word),
            WordFn::Suffix(s) => format!("{}{}", word, s),
        }
    }
}

/// One sed-style substitution rule: `/pattern/replacement/`.
/// A leading `s` before the first delimiter is accepted (`s/$/.bak/`).
#[derive(Debug, Clone)]
pub struct RuleExpression {
    pub pattern: Regex,
    pub replacement: String,
}

impl RuleExpression {
    pub fn parse(line: &str) -> Result<Self, RsprayError> {
        let line = line.trim();
        let rest = line.strip_prefix("s/").map(|r| format!("/{}", r));
        let rest = rest.as_deref().unwrap_or(line);
        let inner = rest
            .strip_prefix('/')
            .and_then(|r| r.strip_suffix('/'))
            .ok_or_else(|| RsprayError::InvalidRule {
                line: line.to_string(),
                message: "expected /pattern/replacement/".to_string(),
            })?;
        let (pat, repl) = inner.rsplit_once('/').ok_or_else(|| RsprayError::InvalidRule {
            line: line.to_string(),
            message: "expected /pattern/replacement/".to_string(),
        })?;
        let pattern = Regex::new(pat).map_err(|e| RsprayError::InvalidRule {
            line: line.to_string(),
            message: e.to_string(),
        })?;
        Ok(Self {
            pattern,
            replacement: repl.to_string(),
        })
    }

    /// Applies the rule to a word; None when the pattern does not hit or
    /// the output is unchanged.
    pub fn run(&self, word: &str) -> Option<String> {
        if !self.pattern.is_match(word) {
            return None;
        }
        let out = self.pattern.replace(word, self.replacement.as_str()).into_owned();
        if out == word || out.is_empty() {
            None
        } else {
            Some(out)
        }
    }
}

/// A parsed mutation rule file.
#[derive(Debug, Clone, Default)]
pub struct RuleProgram {
    pub expressions: Vec<RuleExpression>,
}

impl RuleProgram {
    pub fn parse(content: &str) -> Result<Self, RsprayError> {
        let mut expressions = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            expressions.push(RuleExpression::parse(line)?);
        }
        Ok(Self { expressions })
    }

    pub fn run(&self, word: &str) -> Vec<String> {
        let mut out = Vec::new();
        for expr in &self.expressions {
            if let Some(w) = expr.run(word) {
                if !out.contains(&w) {
                    out.push(w);
                }
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.expressions.is_empty()
    }
}

/// Feeds the word stream for one target: transforms first, then optional
/// wordlist-level mutation rules (each rule output becomes its own word).
pub struct Worder;

impl Worder {
    pub fn spawn(
        words: Arc<Vec<String>>,
        fns: Vec<WordFn>,
        rules: Option<Arc<RuleProgram>>,
    ) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(1024);
        tokio::spawn(async move {
            for word in words.iter() {
                let mut w = word.clone();
                for f in &fns {
                    w = f.apply(&w);
                }
                if tx.send(w.clone()).await.is_err() {
                    return;
                }
                if let Some(rules) = &rules {
                    for mutated in rules.run(&w) {
                        if tx.send(mutated).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });
        rx
    }
}

/// Well-known probe paths enqueued once per target when --active is set.
pub const ACTIVE_PATHS: &[&str] = &[
    "/robots.txt",
    "/sitemap.xml",
    "/.git/HEAD",
    "/.svn/entries",
    "/.DS_Store",
    "/.env",
    "/crossdomain.xml",
    "/WEB-INF/web.xml",
    "/admin/",
    "/login",
    "/console/",
    "/actuator/health",
];

const BAK_EXTS: &[&str] = &["bak", "zip", "rar", "7z", "tar.gz", "sql", "old"];

/// Derives backup-file guesses from the target host: every host stem is
/// combined with each backup extension.
pub fn bak_words(host: &str) -> Vec<String> {
    let host = host.split(':').next().unwrap_or(host);
    let mut stems: Vec<String> = Vec::new();
    let mut push = |s: String| {
        if !s.is_empty() && !stems.contains(&s) {
            stems.push(s);
        }
    };
    push(host.to_string());
    push(host.replace('.', "_"));
    let labels: Vec<&str> = host.split('.').collect();
    if let Some(first) = labels.first() {
        push(first.to_string());
    }
    if labels.len() >= 2 {
        // registrable part, e.g. "example" from www.example.com
        push(labels[labels.len() - 2].to_string());
    }

    let mut out = Vec::new();
    for stem in &stems {
        for ext in BAK_EXTS {
            out.push(format!("{}.{}", stem, ext));
        }
    }
    out
}
