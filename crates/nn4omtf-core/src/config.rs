//! Runner の設定
//!
//! TOML から読み込み、CLI で上書きしてから `validated` で検証する。
//! 検証済みの設定は以後変更しない。

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::pipeline::ExpansionStrategy;
use crate::record::HitsRemap;

/// ログ出力先
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogMode {
    #[default]
    None,
    /// テキストログのみ
    Txt,
    /// 構造化ログ（JSONL）のみ
    Tb,
    Both,
}

impl LogMode {
    pub fn text(self) -> bool {
        matches!(self, Self::Txt | Self::Both)
    }

    pub fn structured(self) -> bool {
        matches!(self, Self::Tb | Self::Both)
    }
}

impl FromStr for LogMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "txt" => Ok(Self::Txt),
            "tb" => Ok(Self::Tb),
            "both" => Ok(Self::Both),
            _ => Err(ConfigError::UnknownLogMode(s.to_string())),
        }
    }
}

impl fmt::Display for LogMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Txt => "txt",
            Self::Tb => "tb",
            Self::Both => "both",
        })
    }
}

/// 学習・テストの設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunnerConfig {
    pub batch_size: usize,
    pub valid_batch_size: usize,
    /// バッチ内のサンプルをシャッフルする
    pub shuffle: bool,
    /// 検証の間隔（ステップ）
    pub acc_ival: u64,
    /// 学習データの繰り返し回数
    pub epochs: u32,
    /// 最大ステップ数（負なら無制限）
    pub steps: i64,
    pub learning_rate: f32,
    /// 「ヒットなし」の置き換え値
    pub nullval: f32,
    /// ヒット値に足すシフト
    pub shiftval: f32,
    pub limit_valid_examples: Option<usize>,
    pub limit_test_examples: Option<usize>,
    pub log: LogMode,
    pub sess_prefix: String,
    pub logdir: PathBuf,
    /// 既存セッション名（`None` なら `{prefix}{model}_{timestamp}` を新規に作る）
    pub sess_name: Option<String>,
    pub seed: Option<u64>,
    /// 進捗バーを表示する
    pub progress: bool,
    pub expansion: ExpansionStrategy,
    /// デコードの並列度（`None` ならコア数）
    pub fan_out: Option<usize>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            valid_batch_size: 1000,
            shuffle: false,
            acc_ival: 1000,
            epochs: 1,
            steps: -1,
            learning_rate: 0.001,
            nullval: 0.0,
            shiftval: 600.0,
            limit_valid_examples: None,
            limit_test_examples: None,
            log: LogMode::None,
            sess_prefix: String::new(),
            logdir: PathBuf::from("."),
            sess_name: None,
            seed: None,
            progress: false,
            expansion: ExpansionStrategy::Interleave,
            fan_out: None,
        }
    }
}

impl RunnerConfig {
    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        toml::from_str(s).context("parse runner config")
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("in {}", path.display()))
    }

    /// 数値設定を検証する
    pub fn validated(self) -> Result<Self, ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::NotPositive { name: "batch_size" });
        }
        if self.valid_batch_size == 0 {
            return Err(ConfigError::NotPositive { name: "valid_batch_size" });
        }
        if self.acc_ival == 0 {
            return Err(ConfigError::NotPositive { name: "acc_ival" });
        }
        if self.epochs == 0 {
            return Err(ConfigError::NotPositive { name: "epochs" });
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(ConfigError::NotPositive { name: "learning_rate" });
        }
        if self.fan_out == Some(0) {
            return Err(ConfigError::NotPositive { name: "fan_out" });
        }
        Ok(self)
    }

    /// hits の置き換え設定
    pub fn remap(&self) -> HitsRemap {
        HitsRemap { null_value: self.nullval, shift_value: self.shiftval }
    }

    pub fn steps_limit(&self) -> Option<u64> {
        u64::try_from(self.steps).ok()
    }

    /// ログ先頭に書く設定一覧（キー昇順）
    pub fn params_string(&self) -> String {
        let value = serde_json::to_value(self).unwrap_or_default();
        let mut out = String::from("==== Runner configuration\n");
        if let serde_json::Value::Object(map) = value {
            for (k, v) in map {
                let shown = match v {
                    serde_json::Value::Null => "None".to_string(),
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                out.push_str(&format!("> {k:.<20}:{shown}\n"));
            }
        }
        out.push_str("=============================\n");
        out
    }
}
