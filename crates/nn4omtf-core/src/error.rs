//! エラー型
//!
//! レイヤごとに型付きエラーを定義する。
//! - `DecodeError`: レコードの破損（パイプラインにとって致命的）
//! - `ConfigError`: 設定の不整合（I/O の前に検出する）
//! - `PipelineError`: 入力パイプライン
//! - `RunnerError`: 学習・テストの制御ループ

use std::path::PathBuf;

/// レコードのデコードエラー
#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    /// ペイロード長がスキーマと一致しない
    #[error("Record payload size mismatch: expected {expected} bytes, got {actual}")]
    PayloadSize { expected: usize, actual: usize },

    /// 長さヘッダの途中でファイルが終わった
    #[error("Truncated record header in {path} (record #{index}, {read} of 4 bytes)")]
    TruncatedHeader { path: PathBuf, index: u64, read: usize },

    /// ペイロードの途中でファイルが終わった
    #[error("Truncated record payload in {path} (record #{index}, expected {expected} bytes)")]
    TruncatedPayload { path: PathBuf, index: u64, expected: usize },

    /// 長さヘッダがスキーマのペイロード長と一致しない
    #[error("Unexpected record length {length} in {path} (record #{index})")]
    BadLength { path: PathBuf, index: u64, length: u32 },

    /// 数値として扱えない値（NaN 等）
    #[error("Non-finite value in field {field}")]
    NonFinite { field: &'static str },
}

/// 設定エラー
#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Unknown expansion strategy: {0:?} (expected \"interleave\" or \"flat\")")]
    UnknownStrategy(String),

    #[error("Unknown compression scheme: {0:?} (expected \"none\", \"gzip\" or \"zlib\")")]
    UnknownCompression(String),

    #[error("Unknown hits variant: {0:?} (expected \"reduced\" or \"full\")")]
    UnknownHitsVariant(String),

    #[error("Unknown log mode: {0:?} (expected none, txt, tb or both)")]
    UnknownLogMode(String),

    #[error("Bucket edges must not be empty")]
    EmptyEdges,

    #[error("Bucket edge #{index} is not finite: {value}")]
    NonFiniteEdge { index: usize, value: f32 },

    #[error("Bucket edges must be strictly increasing (edge #{index}: {prev} >= {next})")]
    UnorderedEdges { index: usize, prev: f32, next: f32 },

    #[error("First pt bucket edge must be positive, got {0}")]
    NonPositivePtEdge(f32),

    #[error("Class count mismatch: {edges} edges imply {expected} classes, got {actual}")]
    ClassCountMismatch { edges: usize, expected: usize, actual: usize },

    #[error("{name} must be positive")]
    NotPositive { name: &'static str },

    #[error("Model name {0} is used more than once")]
    DuplicateModelName(String),
}

/// 入力パイプラインのエラー
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("Failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Failed to build decode thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    /// `bind` 前に `fetch` が呼ばれた
    #[error("Input pipe {0:?} is not bound to any files")]
    NotBound(String),
}

/// 制御ループのエラー
#[derive(thiserror::Error, Debug)]
pub enum RunnerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("Model error: {0:#}")]
    Model(#[source] anyhow::Error),

    #[error("Session I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize statistics: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Logits shape mismatch for {target}: expected [{rows}, {classes}], got {actual:?}")]
    LogitsShape {
        target: &'static str,
        rows: usize,
        classes: usize,
        actual: Vec<usize>,
    },
}

pub type PipelineResult<T> = Result<T, PipelineError>;
pub type RunnerResult<T> = Result<T, RunnerError>;
