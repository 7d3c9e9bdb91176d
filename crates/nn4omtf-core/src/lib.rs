//! nn4omtf: OMTF ミューオン pt・電荷符号分類器の学習基盤
//!
//! 検出器レコードを読み込んでバケット化し、学習・検証・テストのループを回す。
//!
//! # 構成
//! - `bucket`: 連続値 → クラスインデックス（正解用・OMTF 用の 2 ポリシー）
//! - `record` / `io`: レコードのスキーマ、デコード、ファイルのフレーミングと圧縮
//! - `pipeline`: シャッフル・展開・繰り返し・バッチ化・並列デコード
//! - `metrics` / `stats`: 損失・累積精度とテスト統計
//! - `model`: モデル trait と参照実装
//! - `config` / `session` / `runner`: 設定、ログ、制御ループ

pub mod bucket;
pub mod config;
pub mod dataset;
pub mod error;
pub mod io;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod record;
pub mod runner;
pub mod session;
pub mod stats;
pub mod tensor;

pub use bucket::BucketEdges;
pub use config::{LogMode, RunnerConfig};
pub use dataset::DatasetFiles;
pub use error::{ConfigError, DecodeError, PipelineError, RunnerError};
pub use io::{Compression, RecordReader, RecordWriter};
pub use metrics::{MetricSet, RunningAccuracy};
pub use model::{ForwardMode, Gradients, LinearClassifier, Logits, Model};
pub use pipeline::{Batch, ExpansionStrategy, InputPipe, PipeConfig};
pub use record::{Event, ExtraField, HitsRemap, HitsVariant};
pub use runner::{CancelToken, Runner, StopReason, TestSummary, TrainSummary};
pub use stats::{TestAccuracy, TestStatistics};
pub use tensor::BatchArray;
