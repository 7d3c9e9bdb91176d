//! データセットのファイル集合

use std::path::{Path, PathBuf};

use anyhow::Context;
use log::{info, warn};

use crate::io::Compression;

/// レコードファイルの拡張子（圧縮時は `.gz` などが続く）
pub const RECORD_EXTENSION: &str = "omtfrec";

/// train / valid / test のファイル集合
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatasetFiles {
    pub train: Vec<PathBuf>,
    pub valid: Vec<PathBuf>,
    pub test: Vec<PathBuf>,
    pub compression: Compression,
}

impl DatasetFiles {
    /// `root/{train,valid,test}/*.omtfrec*` を集める（各フェーズはソート済み）
    pub fn discover(root: &Path, compression: Compression) -> anyhow::Result<Self> {
        let collect = |phase: &str| -> anyhow::Result<Vec<PathBuf>> {
            let pattern = root.join(phase).join(format!("*.{RECORD_EXTENSION}*"));
            let pattern = pattern.to_string_lossy();
            let mut files = glob::glob(&pattern)
                .with_context(|| format!("bad glob pattern {pattern}"))?
                .collect::<Result<Vec<_>, _>>()
                .with_context(|| format!("list {pattern}"))?;
            files.retain(|p| p.is_file());
            files.sort();
            if files.is_empty() {
                warn!("No {phase} files under {}", root.display());
            }
            Ok(files)
        };
        let dataset = Self {
            train: collect("train")?,
            valid: collect("valid")?,
            test: collect("test")?,
            compression,
        };
        info!(
            "Dataset {}: train={} valid={} test={} files ({})",
            root.display(),
            dataset.train.len(),
            dataset.valid.len(),
            dataset.test.len(),
            compression
        );
        Ok(dataset)
    }
}
