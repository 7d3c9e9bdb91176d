//! omtf_runner - OMTF pt / 符号分類器の学習・テスト
//!
//! # 使用例
//!
//! ```bash
//! # 合成データで学習（チェックポイントは ckpt/lin.bin）
//! cargo run -p tools --release --bin omtf_runner -- train \
//!   --data data/synthetic --checkpoint ckpt/lin.bin \
//!   --batch-size 256 --acc-ival 50 --epochs 3 --log both --logdir runs
//!
//! # 設定ファイル + 上書き
//! cargo run -p tools --release --bin omtf_runner -- train \
//!   --data data/synthetic --config runner.toml --steps 1000
//!
//! # 複数モデルのテスト
//! cargo run -p tools --release --bin omtf_runner -- test \
//!   --data data/synthetic --checkpoint ckpt/a.bin --checkpoint ckpt/b.bin
//! ```

use std::path::PathBuf;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use log::info;

use nn4omtf_core::{
    CancelToken, Compression, DatasetFiles, HitsVariant, LinearClassifier, Model, Runner,
};
use tools::cli::{DEFAULT_PT_EDGES, RunnerOverrides, model_name_from_path, parse_pt_edges};

#[derive(Parser)]
#[command(
    name = "omtf_runner",
    version,
    about = "OMTF ミューオン pt / 符号分類器の学習とテスト"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 学習（検証を含む）
    Train {
        #[command(flatten)]
        data: DataArgs,
        #[command(flatten)]
        model: ModelArgs,
        /// チェックポイント（存在すれば読み込み、終了時に保存）
        #[arg(long)]
        checkpoint: Option<PathBuf>,
        #[command(flatten)]
        runner: RunnerOverrides,
    },
    /// テスト（チェックポイントごとに 1 モデル）
    Test {
        #[command(flatten)]
        data: DataArgs,
        #[command(flatten)]
        model: ModelArgs,
        #[arg(long = "checkpoint", required = true)]
        checkpoints: Vec<PathBuf>,
        #[command(flatten)]
        runner: RunnerOverrides,
    },
}

#[derive(Args)]
struct DataArgs {
    /// データセットのルート（train/ valid/ test/ を含む）
    #[arg(long)]
    data: PathBuf,

    /// none / gzip / zlib
    #[arg(long, default_value = "none")]
    compression: Compression,

    /// 検証後の設定を TOML で表示して終了する
    #[arg(long)]
    print_config: bool,
}

#[derive(Args)]
struct ModelArgs {
    /// モデル名（省略時はチェックポイントのファイル名）
    #[arg(long)]
    model_name: Option<String>,

    /// reduced / full
    #[arg(long, default_value = "reduced")]
    hits: HitsVariant,

    /// pt のバケット境界 [GeV]
    #[arg(long, default_value = DEFAULT_PT_EDGES)]
    pt_edges: String,

    /// 重み初期化のシード
    #[arg(long, default_value_t = 0)]
    model_seed: u64,

    /// Adam の重み減衰
    #[arg(long, default_value_t = 0.0)]
    weight_decay: f32,
}

impl ModelArgs {
    fn build(&self, checkpoint: Option<&PathBuf>) -> Result<LinearClassifier> {
        let name = match (&self.model_name, checkpoint) {
            (Some(name), _) => name.clone(),
            (None, Some(path)) => model_name_from_path(path),
            (None, None) => "linear".to_string(),
        };
        let edges = parse_pt_edges(&self.pt_edges)?;
        let model = LinearClassifier::new(name, self.hits, edges, self.model_seed)
            .with_weight_decay(self.weight_decay);
        Ok(match checkpoint {
            Some(path) => model.with_checkpoint(path),
            None => model,
        })
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();
    let cli = Cli::parse();

    match cli.command {
        Command::Train { data, model, checkpoint, runner } => {
            let Some(runner) = prepare(&data, &runner)? else {
                return Ok(());
            };
            let dataset = DatasetFiles::discover(&data.data, data.compression)?;
            if dataset.train.is_empty() {
                bail!("No training files under {}", data.data.display());
            }
            let mut model = model.build(checkpoint.as_ref())?;

            let cancel = CancelToken::new();
            let flag = cancel.flag();
            ctrlc::set_handler(move || {
                eprintln!("\nInterrupted, finishing current step...");
                flag.store(true, Ordering::SeqCst);
            })
            .context("Failed to set Ctrl-C handler")?;

            let summary = runner.train(&mut model, &dataset, &cancel)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Test { data, model, checkpoints, runner } => {
            let Some(runner) = prepare(&data, &runner)? else {
                return Ok(());
            };
            let dataset = DatasetFiles::discover(&data.data, data.compression)?;
            if dataset.test.is_empty() {
                bail!("No test files under {}", data.data.display());
            }
            let mut models = checkpoints
                .iter()
                .map(|path| {
                    if !path.exists() {
                        bail!("Checkpoint not found: {}", path.display());
                    }
                    Ok(Box::new(model.build(Some(path))?) as Box<dyn Model>)
                })
                .collect::<Result<Vec<_>>>()?;
            if model.model_name.is_some() && models.len() > 1 {
                bail!("--model-name cannot be shared by several checkpoints");
            }

            let summaries = runner.test_many_models(&mut models, &dataset)?;
            for s in &summaries {
                info!(
                    "{}: pt={:.4} sgn={:.4} (OMTF pt={:.4} sgn={:.4})",
                    s.model, s.accuracy.pt, s.accuracy.sgn, s.accuracy.omtf_pt, s.accuracy.omtf_sgn
                );
            }
            println!("{}", serde_json::to_string_pretty(&summaries)?);
        }
    }
    Ok(())
}

/// 設定を読み込んで `Runner` を作る（`--print-config` なら表示のみ）
fn prepare(data: &DataArgs, overrides: &RunnerOverrides) -> Result<Option<Runner>> {
    let runner = Runner::new(overrides.load()?).context("invalid runner configuration")?;
    if data.print_config {
        print!("{}", toml::to_string_pretty(runner.config())?);
        return Ok(None);
    }
    eprint!("{}", runner.config().params_string());
    Ok(Some(runner))
}
