//! 合成イベントの生成
//!
//! 実データの代わりに、pt に反比例して曲がるヒットを持つイベントを作る。
//! 線形モデルでも学習できる程度の相関を持たせ、OMTF 側は一定割合で
//! 不一致（pt = -999, 符号 ≈ -2.0）を出す。
//!
//! 同じ `seed` なら同じデータセットが生成される。

use std::f32::consts::PI;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use log::{debug, info};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::Serialize;

use nn4omtf_core::dataset::RECORD_EXTENSION;
use nn4omtf_core::io::{Compression, RecordWriter};
use nn4omtf_core::record::{Event, HITS_FULL_COLS, HITS_REDUCED_COLS, HITS_ROWS};

/// pt コード → pt [GeV]（コード 0 は未定義）
pub const PT_CODE_TABLE: [f32; 32] = [
    0.0, 0.1, 1.5, 2.0, 2.5, 3.0, 3.5, 4.0, 4.5, 5.0, 6.0, 7.0, 8.0, 10.0, 12.0, 14.0, 16.0, 18.0,
    20.0, 25.0, 30.0, 35.0, 40.0, 45.0, 50.0, 60.0, 70.0, 80.0, 90.0, 100.0, 120.0, 140.0,
];

/// OMTF 不一致時の pt
pub const OMTF_NO_MATCH_PT: f32 = -999.0;
/// OMTF 不一致時の符号
pub const OMTF_NO_MATCH_SIGN: f32 = -2.0;

/// 曲がり量のスケール（pt = 1 GeV で最内層のずれ）
const BENDING_SCALE: f32 = 2000.0;
const BENDING_LIMIT: f32 = 1000.0;
/// 一次元のヒット値の雑音（標準偏差）
const HIT_NOISE: f32 = 8.0;
/// OMTF の pt 推定の相対誤差
const OMTF_PT_RESOLUTION: f32 = 0.2;
const OMTF_CHARGE_FLIP: f64 = 0.03;
/// 不一致時の符号の標準偏差
const SENTINEL_JITTER: f32 = 0.01;
/// FULL の補助列にヒットが入る確率
const FULL_EXTRA_HIT_RATE: f64 = 0.15;
/// OMTF 端の |eta|
const ETA_RANGE: (f32, f32) = (0.82, 1.24);

pub fn pt_for_code(code: u32) -> Option<f32> {
    PT_CODE_TABLE.get(code as usize).copied().filter(|&pt| pt > 0.0)
}

/// 生成パラメータ
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyntheticConfig {
    /// ファイルごとの pt コード
    pub codes: Vec<u32>,
    pub train_events: usize,
    pub valid_events: usize,
    pub test_events: usize,
    /// 1 層あたりのヒット検出効率
    pub hit_efficiency: f64,
    /// OMTF がトラックを見つける確率
    pub omtf_match_rate: f64,
    pub compression: Compression,
    pub seed: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            codes: vec![5, 9, 13, 17, 21, 25],
            train_events: 2000,
            valid_events: 500,
            test_events: 500,
            hit_efficiency: 0.9,
            omtf_match_rate: 0.95,
            compression: Compression::None,
            seed: 42,
        }
    }
}

impl SyntheticConfig {
    fn validate(&self) -> Result<()> {
        if self.codes.is_empty() {
            bail!("At least one pt code is required");
        }
        if let Some(&code) = self.codes.iter().find(|&&c| pt_for_code(c).is_none()) {
            bail!("Unknown pt code {code} (valid: 1..{})", PT_CODE_TABLE.len() - 1);
        }
        for (name, p) in [("hit_efficiency", self.hit_efficiency), ("omtf_match_rate", self.omtf_match_rate)] {
            if !(0.0..=1.0).contains(&p) {
                bail!("{name} must be in [0, 1], got {p}");
            }
        }
        Ok(())
    }
}

/// 1 つの pt コードのイベントを作り続ける
pub struct EventGenerator {
    code: u32,
    pt: f32,
    hit_efficiency: f64,
    omtf_match_rate: f64,
    rng: ChaCha8Rng,
    /// ヒット値の雑音
    hit_noise: Normal<f32>,
    /// 補助列のヒットの散らばり
    extra_hit_noise: Normal<f32>,
    /// OMTF pt の相対誤差
    omtf_pt_error: Normal<f32>,
    /// 不一致時の符号の散らばり
    sentinel_jitter: Normal<f32>,
}

impl EventGenerator {
    pub fn new(code: u32, hit_efficiency: f64, omtf_match_rate: f64, seed: u64) -> Result<Self> {
        let Some(pt) = pt_for_code(code) else {
            bail!("Unknown pt code {code}");
        };
        Ok(Self {
            code,
            pt,
            hit_efficiency,
            omtf_match_rate,
            rng: ChaCha8Rng::seed_from_u64(seed),
            hit_noise: Normal::new(0.0, HIT_NOISE)?,
            extra_hit_noise: Normal::new(0.0, 4.0 * HIT_NOISE)?,
            omtf_pt_error: Normal::new(0.0, OMTF_PT_RESOLUTION)?,
            sentinel_jitter: Normal::new(0.0, SENTINEL_JITTER)?,
        })
    }

    pub fn code(&self) -> u32 {
        self.code
    }

    pub fn event(&mut self) -> Event {
        let charge = if self.rng.random_bool(0.5) { 1.0 } else { -1.0 };
        let eta_abs = self.rng.random_range(ETA_RANGE.0..ETA_RANGE.1);
        let eta = if self.rng.random_bool(0.5) { eta_abs } else { -eta_abs };
        let phi = self.rng.random_range(-PI..PI);
        let prod = [self.pt, eta, phi, charge];

        let mut ev = Event::empty(prod, self.omtf_record(charge, eta, phi), self.code as f32);
        let bending = charge * BENDING_SCALE / self.pt;
        for layer in 0..HITS_ROWS {
            if !self.rng.random_bool(self.hit_efficiency) {
                continue;
            }
            // 外側の層ほど曲がりが小さい
            let lever = 1.0 - layer as f32 / (2 * HITS_ROWS) as f32;
            let noise = self.hit_noise.sample(&mut self.rng);
            let value = (bending * lever + noise).clamp(-BENDING_LIMIT, BENDING_LIMIT).round();
            ev.hits_reduced[layer * HITS_REDUCED_COLS] = value;
            ev.hits_reduced[layer * HITS_REDUCED_COLS + 1] = (eta_abs * 100.0).round();
            ev.hits_full[layer * HITS_FULL_COLS] = value;
            for col in 1..HITS_FULL_COLS {
                if self.rng.random_bool(FULL_EXTRA_HIT_RATE) {
                    let spread = self.extra_hit_noise.sample(&mut self.rng);
                    ev.hits_full[layer * HITS_FULL_COLS + col] = (value + spread).round();
                }
            }
        }
        ev
    }

    fn omtf_record(&mut self, charge: f32, eta: f32, phi: f32) -> [f32; 6] {
        if !self.rng.random_bool(self.omtf_match_rate) {
            // 不一致の符号は -2.0 ちょうどではなく近くに散らばる
            let sign = OMTF_NO_MATCH_SIGN + self.sentinel_jitter.sample(&mut self.rng);
            return [OMTF_NO_MATCH_PT, 0.0, 0.0, sign, 0.0, -1.0];
        }
        let pt = (self.pt * (1.0 + self.omtf_pt_error.sample(&mut self.rng))).max(0.5);
        let sign = if self.rng.random_bool(OMTF_CHARGE_FLIP) { -charge } else { charge };
        let quality = self.rng.random_range(8..=12) as f32;
        let ref_layer = self.rng.random_range(0..8) as f32;
        [pt, eta, phi, sign, quality, ref_layer]
    }
}

/// 書き出したファイルの一覧
#[derive(Debug, Clone, Serialize)]
pub struct SyntheticManifest {
    pub config: SyntheticConfig,
    pub files: Vec<(PathBuf, usize)>,
}

/// `root/{train,valid,test}/code{NN}.omtfrec[.gz|.zlib]` を書き出す
pub fn write_dataset(root: &Path, config: &SyntheticConfig) -> Result<SyntheticManifest> {
    config.validate()?;
    let suffix = match config.compression {
        Compression::None => "",
        Compression::Gzip => ".gz",
        Compression::Zlib => ".zlib",
    };
    let mut manifest = SyntheticManifest { config: config.clone(), files: Vec::new() };
    let phases = [("train", config.train_events), ("valid", config.valid_events), ("test", config.test_events)];

    for (phase_index, (phase, count)) in phases.into_iter().enumerate() {
        let dir = root.join(phase);
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        for &code in &config.codes {
            let seed = config.seed ^ (u64::from(code) << 8) ^ phase_index as u64;
            let mut generator = EventGenerator::new(code, config.hit_efficiency, config.omtf_match_rate, seed)?;
            let path = dir.join(format!("code{code:02}.{RECORD_EXTENSION}{suffix}"));
            let mut w = RecordWriter::create(&path, config.compression)
                .with_context(|| format!("create {}", path.display()))?;
            for _ in 0..count {
                w.write_record(&generator.event().encode())?;
            }
            w.close().with_context(|| format!("close {}", path.display()))?;
            debug!("Wrote {count} events to {}", path.display());
            manifest.files.push((path, count));
        }
        info!("{phase}: {} files x {count} events", config.codes.len());
    }

    let manifest_path = root.join("manifest.json");
    fs::write(&manifest_path, serde_json::to_string_pretty(&manifest)?)
        .with_context(|| format!("write {}", manifest_path.display()))?;
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nn4omtf_core::bucket::{REFERENCE_SIGN_NO_MATCH, reference_sign_bucket};
    use nn4omtf_core::record::HITS_NO_HIT;

    #[test]
    fn test_pt_for_code() {
        assert_eq!(pt_for_code(0), None);
        assert_eq!(pt_for_code(9), Some(5.0));
        assert_eq!(pt_for_code(31), Some(140.0));
        assert_eq!(pt_for_code(32), None);
    }

    #[test]
    fn test_generator_is_deterministic() {
        let mut a = EventGenerator::new(13, 0.9, 0.9, 7).unwrap();
        let mut b = EventGenerator::new(13, 0.9, 0.9, 7).unwrap();
        for _ in 0..20 {
            assert_eq!(a.event(), b.event());
        }
    }

    #[test]
    fn test_bending_follows_charge() {
        let mut g = EventGenerator::new(9, 1.0, 1.0, 3).unwrap();
        for _ in 0..50 {
            let ev = g.event();
            let q = ev.prod[3];
            // pt = 5 GeV: 最内層のずれは 400 前後で雑音より十分大きい
            assert_eq!(ev.hits_reduced[0].signum(), q);
            assert_eq!(ev.pt_code, 9.0);
        }
    }

    #[test]
    fn test_hit_noise_spread() {
        // pt = 5 GeV の最内層: 平均 400、標準偏差 HIT_NOISE
        let mut g = EventGenerator::new(9, 1.0, 1.0, 11).unwrap();
        let xs: Vec<f32> = (0..2000)
            .map(|_| {
                let ev = g.event();
                ev.hits_reduced[0] * ev.prod[3]
            })
            .collect();
        let n = xs.len() as f32;
        let mean = xs.iter().sum::<f32>() / n;
        let sd = (xs.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / n).sqrt();
        assert!((mean - 400.0).abs() < 1.0, "mean {mean}");
        assert!((sd - HIT_NOISE).abs() < 1.0, "sd {sd}");
    }

    #[test]
    fn test_no_match_and_no_hits() {
        let mut g = EventGenerator::new(20, 0.0, 0.0, 1).unwrap();
        let ev = g.event();
        assert_eq!(ev.omtf[0], OMTF_NO_MATCH_PT);
        assert_eq!(reference_sign_bucket(ev.omtf[3]), REFERENCE_SIGN_NO_MATCH);
        assert!(ev.hits_reduced.iter().all(|&h| h == HITS_NO_HIT));
        assert!(ev.hits_full.iter().all(|&h| h == HITS_NO_HIT));
    }

    #[test]
    fn test_rejects_unknown_code() {
        assert!(EventGenerator::new(0, 1.0, 1.0, 0).is_err());
        let config = SyntheticConfig { codes: vec![40], ..Default::default() };
        assert!(config.validate().is_err());
        let config = SyntheticConfig { hit_efficiency: 1.5, ..Default::default() };
        assert!(config.validate().is_err());
    }
}
