//! nn4omtf のコマンドラインツール群
//!
//! - `cli`: Runner 設定の TOML 読み込みとコマンドライン上書き
//! - `synthetic`: パイプラインを通しで動かすための合成イベント生成

pub mod cli;
pub mod synthetic;
