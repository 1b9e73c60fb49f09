// src/errors.rs
use std::path::PathBuf;
use thiserror::Error;

/// rspray 全局统一错误类型
#[derive(Error, Debug)]
pub enum RsprayError {
    // === 网络与基础 I/O ===
    #[error("Network I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("无效的目标: {0}")]
    InvalidTarget(String),

    #[error("网络错误: {0}")]
    NetworkError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    // === 参数与配置错误 ===
    #[error("Invalid concurrency limit: {value} (must be >= 1)")]
    InvalidConcurrency { value: usize },

    #[error("Missing required argument: {arg}")]
    MissingArgument { arg: String },

    #[error("Invalid expression '{expr}': {message}")]
    InvalidExpression { expr: String, message: String },

    #[error("Invalid mutation rule '{line}': {message}")]
    InvalidRule { line: String, message: String },

    // === 字典/爆破相关 ===
    #[error("Failed to load wordlist from '{path}': {source}")]
    WordlistLoad {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Wordlist is empty or contains no valid entries")]
    EmptyWordlist,

    // === 目标探测特有 ===
    #[error("Target init probe failed for '{url}': {message}")]
    InitFailed { url: String, message: String },

    #[error("Result receiver already taken")]
    ResultsReceiverTaken,

    // === 通用兜底 ===
    #[error("Operation failed: {0}")]
    Generic(String),
}
