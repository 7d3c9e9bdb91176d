//! Runner 設定のコマンドライン上書き
//!
//! 優先順位: コマンドライン > `--config` の TOML > 既定値。

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;

use nn4omtf_core::bucket::BucketEdges;
use nn4omtf_core::{ExpansionStrategy, LogMode, RunnerConfig};

/// 既定の pt エッジ [GeV]
pub const DEFAULT_PT_EDGES: &str = "5,10,15,20,25,30";

/// `RunnerConfig` を上書きするオプション（指定したものだけ反映）
#[derive(Args, Debug, Clone, Default)]
pub struct RunnerOverrides {
    /// 設定ファイル（TOML）
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub batch_size: Option<usize>,

    #[arg(long)]
    pub valid_batch_size: Option<usize>,

    /// バッチ内をシャッフルする
    #[arg(long)]
    pub shuffle: bool,

    /// 検証間隔（ステップ）
    #[arg(long)]
    pub acc_ival: Option<u64>,

    #[arg(long)]
    pub epochs: Option<u32>,

    /// 最大ステップ数（負なら無制限）
    #[arg(long, allow_hyphen_values = true)]
    pub steps: Option<i64>,

    #[arg(long)]
    pub learning_rate: Option<f32>,

    /// 「ヒットなし」の置き換え値
    #[arg(long, allow_hyphen_values = true)]
    pub nullval: Option<f32>,

    /// ヒット値のシフト
    #[arg(long, allow_hyphen_values = true)]
    pub shiftval: Option<f32>,

    #[arg(long)]
    pub limit_valid_examples: Option<usize>,

    #[arg(long)]
    pub limit_test_examples: Option<usize>,

    /// none / txt / tb / both
    #[arg(long)]
    pub log: Option<LogMode>,

    #[arg(long)]
    pub sess_prefix: Option<String>,

    #[arg(long)]
    pub sess_name: Option<String>,

    #[arg(long)]
    pub logdir: Option<PathBuf>,

    #[arg(long)]
    pub seed: Option<u64>,

    /// 進捗バーを表示する
    #[arg(long)]
    pub progress: bool,

    /// interleave / flat
    #[arg(long)]
    pub expansion: Option<ExpansionStrategy>,

    /// デコードの並列度
    #[arg(long)]
    pub fan_out: Option<usize>,
}

impl RunnerOverrides {
    pub fn apply(&self, config: &mut RunnerConfig) {
        macro_rules! set {
            ($($field:ident),* $(,)?) => {
                $(if let Some(v) = &self.$field {
                    config.$field = v.clone();
                })*
            };
        }
        set!(
            batch_size,
            valid_batch_size,
            acc_ival,
            epochs,
            steps,
            learning_rate,
            nullval,
            shiftval,
            log,
            sess_prefix,
            logdir,
            expansion,
        );
        if self.limit_valid_examples.is_some() {
            config.limit_valid_examples = self.limit_valid_examples;
        }
        if self.limit_test_examples.is_some() {
            config.limit_test_examples = self.limit_test_examples;
        }
        if self.sess_name.is_some() {
            config.sess_name = self.sess_name.clone();
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        if self.fan_out.is_some() {
            config.fan_out = self.fan_out;
        }
        config.shuffle |= self.shuffle;
        config.progress |= self.progress;
    }

    /// TOML を読み、上書きを反映する（検証は `Runner::new` で行う）
    pub fn load(&self) -> Result<RunnerConfig> {
        let mut config = match &self.config {
            Some(path) => RunnerConfig::load(path)?,
            None => RunnerConfig::default(),
        };
        self.apply(&mut config);
        Ok(config)
    }
}

/// `"5,10,15"` 形式の pt エッジ
pub fn parse_pt_edges(s: &str) -> Result<BucketEdges> {
    let edges = s
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| t.parse::<f32>().with_context(|| format!("bad pt edge '{t}'")))
        .collect::<Result<Vec<_>>>()?;
    BucketEdges::pt(edges).with_context(|| format!("invalid pt edges '{s}'"))
}

/// チェックポイントのパスからモデル名を作る（`dir/lin-a.bin` → `lin-a`）
pub fn model_name_from_path(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "model".to_string())
}
