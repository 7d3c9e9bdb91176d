//! gen_synthetic - 合成データセットの書き出し
//!
//! `OUTPUT/{train,valid,test}/codeNN.omtfrec` を pt コードごとに 1 ファイル作る。
//!
//! ```bash
//! cargo run -p tools --release --bin gen_synthetic -- \
//!   --output data/synthetic --codes 5,9,13,17,21,25 --train-events 5000 --compression gzip
//! ```

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use log::info;

use nn4omtf_core::Compression;
use tools::synthetic::{SyntheticConfig, write_dataset};

#[derive(Parser)]
#[command(name = "gen_synthetic", version, about = "OMTF 合成データセットを書き出す")]
struct Cli {
    /// 出力ディレクトリ
    #[arg(short, long)]
    output: PathBuf,

    /// pt コード（ファイルごと）
    #[arg(long, value_delimiter = ',', default_value = "5,9,13,17,21,25")]
    codes: Vec<u32>,

    /// ファイルあたりのイベント数（train）
    #[arg(long, default_value_t = 2000)]
    train_events: usize,

    #[arg(long, default_value_t = 500)]
    valid_events: usize,

    #[arg(long, default_value_t = 500)]
    test_events: usize,

    /// 1 層あたりのヒット検出効率
    #[arg(long, default_value_t = 0.9)]
    hit_efficiency: f64,

    /// OMTF がトラックを見つける確率
    #[arg(long, default_value_t = 0.95)]
    omtf_match_rate: f64,

    /// none / gzip / zlib
    #[arg(long, default_value = "none")]
    compression: Compression,

    #[arg(long, default_value_t = 42)]
    seed: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();
    let cli = Cli::parse();

    let config = SyntheticConfig {
        codes: cli.codes,
        train_events: cli.train_events,
        valid_events: cli.valid_events,
        test_events: cli.test_events,
        hit_efficiency: cli.hit_efficiency,
        omtf_match_rate: cli.omtf_match_rate,
        compression: cli.compression,
        seed: cli.seed,
    };
    let manifest = write_dataset(&cli.output, &config)?;
    let total: usize = manifest.files.iter().map(|(_, n)| n).sum();
    info!("Wrote {} files ({total} events) to {}", manifest.files.len(), cli.output.display());
    Ok(())
}
