//! 入力パイプライン
//!
//! ファイル集合からシャッフル・バッチ化・繰り返し済みのサンプル列を作る。
//!
//! ```text
//! files ─ shuffle(file order) ─ expand(INTERLEAVE | FLAT) ─ repeat(reps)
//!       ─ take(limit) ─ shuffle buffer(batch_size) ─ batch ─ decode (rayon)
//! ```
//!
//! `bind` でファイル集合を結びつけてから `fetch` で 1 バッチずつ取り出す。
//! 終端は `Ok(None)` で表す。

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use log::debug;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::bucket::{BucketEdges, SIGN_CLASSES};
use crate::error::{ConfigError, PipelineError, PipelineResult};
use crate::io::{Compression, RecordReader};
use crate::record::{
    DecodeSpec, EXTRA_FIELD_COUNT, Example, ExtraField, HitsRemap, HitsVariant, decode,
};
use crate::tensor::BatchArray;

/// ファイルからサンプル列への展開方法
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpansionStrategy {
    /// 全ファイルを 1 サンプルずつ巡回する
    #[default]
    Interleave,
    /// ファイル順に連結する
    Flat,
}

impl FromStr for ExpansionStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "interleave" => Ok(Self::Interleave),
            "flat" | "flat_map" => Ok(Self::Flat),
            _ => Err(ConfigError::UnknownStrategy(s.to_string())),
        }
    }
}

impl fmt::Display for ExpansionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Interleave => "interleave",
            Self::Flat => "flat",
        })
    }
}

/// パイプライン設定
#[derive(Debug, Clone)]
pub struct PipeConfig {
    pub hits_variant: HitsVariant,
    pub pt_edges: BucketEdges,
    /// pt の出力クラス数（`pt_edges.len() + 1` でなければならない）
    pub out_classes: usize,
    pub compression: Compression,
    /// `None` のときは 1 サンプルずつ返す
    pub batch_size: Option<usize>,
    pub shuffle: bool,
    pub reps: u32,
    pub strategy: ExpansionStrategy,
    /// 全体で取り出すサンプル数の上限
    pub limit: Option<usize>,
    pub remap: Option<HitsRemap>,
    pub detect_no_signal: bool,
    /// デコードの並列度
    pub fan_out: usize,
    /// `None` なら OS の乱数で初期化
    pub seed: Option<u64>,
}

impl PipeConfig {
    pub fn new(hits_variant: HitsVariant, pt_edges: BucketEdges) -> Self {
        let out_classes = pt_edges.class_count();
        Self {
            hits_variant,
            pt_edges,
            out_classes,
            compression: Compression::None,
            batch_size: None,
            shuffle: false,
            reps: 1,
            strategy: ExpansionStrategy::Interleave,
            limit: None,
            remap: None,
            detect_no_signal: false,
            fan_out: default_fan_out(),
            seed: None,
        }
    }

    /// 設定を検証してデコード設定を作る
    pub fn decode_spec(&self) -> Result<DecodeSpec, ConfigError> {
        if self.batch_size == Some(0) {
            return Err(ConfigError::NotPositive { name: "batch_size" });
        }
        if self.reps == 0 {
            return Err(ConfigError::NotPositive { name: "reps" });
        }
        if self.fan_out == 0 {
            return Err(ConfigError::NotPositive { name: "fan_out" });
        }
        Ok(DecodeSpec::new(self.hits_variant, self.pt_edges.clone(), self.out_classes)?
            .with_remap(self.remap)
            .with_no_signal_detection(self.detect_no_signal))
    }
}

/// 利用可能なコア数
pub fn default_fan_out() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

/// データ辞書のキー
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataKey {
    Hits,
    PtLabel,
    SignLabel,
}

impl DataKey {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Hits => "HITS",
            Self::PtLabel => "PT_LABEL",
            Self::SignLabel => "SIGN_LABEL",
        }
    }
}

/// 診断値の列（フィールドごとに 1 列）
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExtraBatch {
    columns: [Vec<f32>; EXTRA_FIELD_COUNT],
}

impl ExtraBatch {
    fn from_examples(examples: &[Example]) -> Self {
        let mut columns: [Vec<f32>; EXTRA_FIELD_COUNT] = Default::default();
        for col in &mut columns {
            col.reserve(examples.len());
        }
        for ex in examples {
            for (col, &v) in columns.iter_mut().zip(ex.extra.iter()) {
                col.push(v);
            }
        }
        Self { columns }
    }

    pub fn column(&self, field: ExtraField) -> &[f32] {
        &self.columns[field.index()]
    }

    /// 名前で列を引く
    pub fn get(&self, name: &str) -> Option<&[f32]> {
        ExtraField::from_name(name).map(|f| self.column(f))
    }

    /// `(名前, 列)` を固定順で返す
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &[f32])> {
        ExtraField::ALL.into_iter().map(|f| (f.name(), self.column(f)))
    }

    pub fn len(&self) -> usize {
        self.columns[0].len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 1 バッチ
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// `[n, 18, cols]`
    pub hits: BatchArray,
    /// `[n, classes]`
    pub pt_labels: BatchArray,
    /// `[n, 2]`
    pub sign_labels: BatchArray,
    pub extra: ExtraBatch,
    /// 信号なしイベントのタグ
    pub no_signal: Vec<bool>,
}

impl Batch {
    fn from_examples(examples: &[Example], variant: HitsVariant, classes: usize) -> Self {
        Self {
            hits: BatchArray::from_rows(
                &variant.shape(),
                examples.iter().map(|e| e.hits.as_slice()),
            ),
            pt_labels: BatchArray::from_rows(&[classes], examples.iter().map(|e| e.pt_label.as_slice())),
            sign_labels: BatchArray::from_rows(
                &[SIGN_CLASSES],
                examples.iter().map(|e| e.sign_label.as_slice()),
            ),
            extra: ExtraBatch::from_examples(examples),
            no_signal: examples.iter().map(|e| e.no_signal).collect(),
        }
    }

    pub fn data(&self, key: DataKey) -> &BatchArray {
        match key {
            DataKey::Hits => &self.hits,
            DataKey::PtLabel => &self.pt_labels,
            DataKey::SignLabel => &self.sign_labels,
        }
    }

    pub fn len(&self) -> usize {
        self.hits.rows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 展開済みの生ペイロード列（repeat を含む）
struct Source {
    files: Vec<PathBuf>,
    compression: Compression,
    strategy: ExpansionStrategy,
    reps_left: u32,
    // INTERLEAVE: 未終了のリーダを巡回
    active: Vec<RecordReader>,
    cursor: usize,
    // FLAT
    next_file: usize,
    current: Option<RecordReader>,
}

impl Source {
    fn new(files: Vec<PathBuf>, config: &PipeConfig) -> PipelineResult<Self> {
        let mut source = Self {
            files,
            compression: config.compression,
            strategy: config.strategy,
            reps_left: config.reps,
            active: Vec::new(),
            cursor: 0,
            next_file: 0,
            current: None,
        };
        source.start_pass()?;
        Ok(source)
    }

    fn start_pass(&mut self) -> PipelineResult<()> {
        match self.strategy {
            ExpansionStrategy::Interleave => {
                self.active = self
                    .files
                    .iter()
                    .map(|p| RecordReader::open(p, self.compression))
                    .collect::<PipelineResult<_>>()?;
                self.cursor = 0;
            }
            ExpansionStrategy::Flat => {
                self.next_file = 0;
                self.current = None;
            }
        }
        Ok(())
    }

    fn next_in_pass(&mut self) -> PipelineResult<Option<Vec<u8>>> {
        match self.strategy {
            ExpansionStrategy::Interleave => {
                while !self.active.is_empty() {
                    if self.cursor >= self.active.len() {
                        self.cursor = 0;
                    }
                    match self.active[self.cursor].next_record()? {
                        Some(blob) => {
                            self.cursor += 1;
                            return Ok(Some(blob));
                        }
                        // 終了したファイルは巡回から外す
                        None => {
                            self.active.remove(self.cursor);
                        }
                    }
                }
                Ok(None)
            }
            ExpansionStrategy::Flat => loop {
                if let Some(reader) = self.current.as_mut() {
                    if let Some(blob) = reader.next_record()? {
                        return Ok(Some(blob));
                    }
                    self.current = None;
                }
                let Some(path) = self.files.get(self.next_file) else {
                    return Ok(None);
                };
                self.current = Some(RecordReader::open(path, self.compression)?);
                self.next_file += 1;
            },
        }
    }

    fn next_blob(&mut self) -> PipelineResult<Option<Vec<u8>>> {
        while self.reps_left > 0 {
            if let Some(blob) = self.next_in_pass()? {
                return Ok(Some(blob));
            }
            self.reps_left -= 1;
            if self.reps_left > 0 {
                self.start_pass()?;
            }
        }
        Ok(None)
    }
}

/// bind 済みのストリーム状態
struct Bound {
    source: Source,
    buffer: Vec<Vec<u8>>,
    taken: usize,
    emitted: usize,
}

/// 入力パイプライン
pub struct InputPipe {
    name: String,
    config: PipeConfig,
    spec: DecodeSpec,
    pool: rayon::ThreadPool,
    rng: ChaCha8Rng,
    bound: Option<Bound>,
}

impl InputPipe {
    /// 設定を検証してパイプラインを作る（I/O は行わない）
    pub fn new(name: impl Into<String>, config: PipeConfig) -> PipelineResult<Self> {
        let name = name.into();
        let spec = config.decode_spec()?;
        let thread_prefix = name.clone();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.fan_out)
            .thread_name(move |i| format!("{thread_prefix}-decode-{i}"))
            .build()?;
        let rng = match config.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_os_rng(),
        };
        Ok(Self { name, config, spec, pool, rng, bound: None })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &PipeConfig {
        &self.config
    }

    /// ファイル集合を結びつけてストリームを先頭から作り直す
    pub fn bind(&mut self, files: &[PathBuf]) -> PipelineResult<()> {
        let mut files = files.to_vec();
        files.shuffle(&mut self.rng);
        debug!(
            "Input pipe {}: bound {} files ({}, reps={}, batch={:?})",
            self.name,
            files.len(),
            self.config.strategy,
            self.config.reps,
            self.config.batch_size
        );
        self.bound = None;
        let source = Source::new(files, &self.config)?;
        self.bound = Some(Bound { source, buffer: Vec::new(), taken: 0, emitted: 0 });
        Ok(())
    }

    /// 現在の bind で取り出したサンプル数
    pub fn examples_emitted(&self) -> usize {
        self.bound.as_ref().map_or(0, |b| b.emitted)
    }

    /// 次のバッチ。終端なら `Ok(None)`
    pub fn fetch(&mut self) -> PipelineResult<Option<Batch>> {
        let bound = self.bound.as_mut().ok_or_else(|| PipelineError::NotBound(self.name.clone()))?;
        let want = self.config.batch_size.unwrap_or(1);
        let capacity = if self.config.shuffle { want } else { 1 };

        let mut blobs = Vec::with_capacity(want);
        while blobs.len() < want {
            match next_shuffled(bound, &self.config, capacity, &mut self.rng)? {
                Some(blob) => blobs.push(blob),
                None => break,
            }
        }
        if blobs.is_empty() {
            return Ok(None);
        }
        bound.emitted += blobs.len();

        let spec = &self.spec;
        let examples = self
            .pool
            .install(|| blobs.par_iter().map(|b| decode(b, spec)).collect::<Result<Vec<_>, _>>())?;
        Ok(Some(Batch::from_examples(&examples, self.config.hits_variant, self.config.out_classes)))
    }
}

/// limit を適用した生ストリームからシャッフルバッファ経由で 1 件取り出す
fn next_shuffled(
    bound: &mut Bound,
    config: &PipeConfig,
    capacity: usize,
    rng: &mut ChaCha8Rng,
) -> PipelineResult<Option<Vec<u8>>> {
    while bound.buffer.len() < capacity {
        if config.limit.is_some_and(|limit| bound.taken >= limit) {
            break;
        }
        match bound.source.next_blob()? {
            Some(blob) => {
                bound.taken += 1;
                bound.buffer.push(blob);
            }
            None => break,
        }
    }
    if bound.buffer.is_empty() {
        return Ok(None);
    }
    let i = if bound.buffer.len() > 1 { rng.random_range(0..bound.buffer.len()) } else { 0 };
    Ok(Some(bound.buffer.swap_remove(i)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::RecordWriter;
    use crate::record::Event;
    use std::path::Path;
    use tempfile::tempdir;

    /// pt_code = ファイル番号, PT_VAL = ファイル内の通し番号
    fn write_file(path: &Path, code: usize, n: usize) {
        let mut w = RecordWriter::create(path, Compression::None).unwrap();
        for i in 0..n {
            let ev = Event::empty(
                [i as f32, 0.0, 0.0, 1.0],
                [i as f32, 0.0, 0.0, 1.0, 0.0, 0.0],
                code as f32,
            );
            w.write_record(&ev.encode()).unwrap();
        }
        w.close().unwrap();
    }

    fn write_files(dir: &Path, files: usize, per_file: usize) -> Vec<PathBuf> {
        (0..files)
            .map(|f| {
                let p = dir.join(format!("f{f}.omtfrec"));
                write_file(&p, f, per_file);
                p
            })
            .collect()
    }

    fn config() -> PipeConfig {
        let mut c = PipeConfig::new(
            HitsVariant::Reduced,
            BucketEdges::pt(vec![10.0, 20.0, 30.0]).unwrap(),
        );
        c.seed = Some(7);
        c.fan_out = 2;
        c
    }

    fn drain_codes(pipe: &mut InputPipe) -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        while let Some(b) = pipe.fetch().unwrap() {
            let codes = b.extra.column(ExtraField::PtCode);
            let idx = b.extra.column(ExtraField::PtVal);
            out.extend(codes.iter().zip(idx).map(|(&c, &i)| (c as usize, i as usize)));
        }
        out
    }

    #[test]
    fn test_fetch_before_bind() {
        let mut pipe = InputPipe::new("train", config()).unwrap();
        assert!(matches!(pipe.fetch(), Err(PipelineError::NotBound(name)) if name == "train"));
    }

    #[test]
    fn test_empty_bind_exhausts() {
        let mut pipe = InputPipe::new("valid", config()).unwrap();
        pipe.bind(&[]).unwrap();
        assert!(pipe.fetch().unwrap().is_none());
    }

    #[test]
    fn test_interleave_round_robin() {
        let dir = tempdir().unwrap();
        let files = write_files(dir.path(), 3, 4);
        let mut pipe = InputPipe::new("train", config()).unwrap();
        pipe.bind(&files).unwrap();
        let seen = drain_codes(&mut pipe);
        assert_eq!(seen.len(), 12);
        for window in seen.chunks(3) {
            let mut codes: Vec<_> = window.iter().map(|&(c, _)| c).collect();
            codes.sort_unstable();
            assert_eq!(codes, vec![0, 1, 2]);
        }
        // ファイル内の順序は保たれる
        for code in 0..3 {
            let idx: Vec<_> = seen.iter().filter(|&&(c, _)| c == code).map(|&(_, i)| i).collect();
            assert_eq!(idx, vec![0, 1, 2, 3]);
        }
    }

    #[test]
    fn test_interleave_uneven_files() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.omtfrec");
        let b = dir.path().join("b.omtfrec");
        write_file(&a, 0, 1);
        write_file(&b, 1, 3);
        let mut pipe = InputPipe::new("train", config()).unwrap();
        pipe.bind(&[a, b]).unwrap();
        let seen = drain_codes(&mut pipe);
        assert_eq!(seen.len(), 4);
        assert_eq!(&seen[2..], &[(1, 1), (1, 2)]);
    }

    #[test]
    fn test_flat_concatenates() {
        let dir = tempdir().unwrap();
        let files = write_files(dir.path(), 2, 3);
        let mut c = config();
        c.strategy = ExpansionStrategy::Flat;
        let mut pipe = InputPipe::new("train", c).unwrap();
        pipe.bind(&files).unwrap();
        let seen = drain_codes(&mut pipe);
        let first = seen[0].0;
        assert!(seen[..3].iter().all(|&(code, _)| code == first));
        assert!(seen[3..].iter().all(|&(code, _)| code != first));
    }

    #[test]
    fn test_repeat_batch_and_limit() {
        let dir = tempdir().unwrap();
        let files = write_files(dir.path(), 2, 3);
        let mut c = config();
        c.reps = 2;
        c.batch_size = Some(4);
        let mut pipe = InputPipe::new("train", c.clone()).unwrap();
        pipe.bind(&files).unwrap();
        let sizes: Vec<_> = std::iter::from_fn(|| pipe.fetch().unwrap()).map(|b| b.len()).collect();
        assert_eq!(sizes, vec![4, 4, 4]);
        assert_eq!(pipe.examples_emitted(), 12);

        c.limit = Some(5);
        let mut pipe = InputPipe::new("train", c).unwrap();
        pipe.bind(&files).unwrap();
        let sizes: Vec<_> = std::iter::from_fn(|| pipe.fetch().unwrap()).map(|b| b.len()).collect();
        assert_eq!(sizes, vec![4, 1]);
    }

    #[test]
    fn test_shuffle_keeps_multiset() {
        let dir = tempdir().unwrap();
        let files = write_files(dir.path(), 2, 5);
        let mut c = config();
        c.batch_size = Some(3);
        c.shuffle = true;
        let mut pipe = InputPipe::new("train", c).unwrap();
        pipe.bind(&files).unwrap();
        let mut seen = drain_codes(&mut pipe);
        seen.sort_unstable();
        let expected: Vec<_> = (0..2).flat_map(|c| (0..5).map(move |i| (c, i))).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_seeded_pipes_agree() {
        let dir = tempdir().unwrap();
        let files = write_files(dir.path(), 3, 4);
        let mut c = config();
        c.batch_size = Some(4);
        c.shuffle = true;
        let mut a = InputPipe::new("a", c.clone()).unwrap();
        let mut b = InputPipe::new("b", c).unwrap();
        a.bind(&files).unwrap();
        b.bind(&files).unwrap();
        assert_eq!(drain_codes(&mut a), drain_codes(&mut b));
    }

    #[test]
    fn test_rebind_restarts() {
        let dir = tempdir().unwrap();
        let files = write_files(dir.path(), 1, 2);
        let mut pipe = InputPipe::new("valid", config()).unwrap();
        pipe.bind(&files).unwrap();
        assert_eq!(drain_codes(&mut pipe).len(), 2);
        pipe.bind(&files).unwrap();
        assert_eq!(drain_codes(&mut pipe).len(), 2);
    }

    #[test]
    fn test_batch_layout() {
        let dir = tempdir().unwrap();
        let files = write_files(dir.path(), 1, 2);
        let mut c = config();
        c.batch_size = Some(2);
        c.remap = Some(HitsRemap { null_value: 0.0, shift_value: 600.0 });
        c.detect_no_signal = true;
        let mut pipe = InputPipe::new("train", c).unwrap();
        pipe.bind(&files).unwrap();
        let b = pipe.fetch().unwrap().unwrap();
        assert_eq!(b.data(DataKey::Hits).shape(), &[2, 18, 2]);
        assert_eq!(b.data(DataKey::PtLabel).shape(), &[2, 4]);
        assert_eq!(b.data(DataKey::SignLabel).shape(), &[2, 2]);
        assert_eq!(b.no_signal, vec![true, true]);
        assert!(b.hits.data().iter().all(|&h| h == 0.0));
        let names: Vec<_> = b.extra.iter().map(|(n, _)| n).collect();
        assert_eq!(names.len(), 7);
        assert_eq!(b.extra.get("PT_VAL").unwrap(), &[0.0, 1.0]);
        assert!(b.extra.get("HITS").is_none());
    }

    #[test]
    fn test_config_errors() {
        let mut c = config();
        c.batch_size = Some(0);
        assert!(matches!(
            InputPipe::new("x", c).err(),
            Some(PipelineError::Config(ConfigError::NotPositive { name: "batch_size" }))
        ));
        let mut c = config();
        c.reps = 0;
        assert!(InputPipe::new("x", c).is_err());
        let mut c = config();
        c.out_classes = 5;
        assert!(matches!(
            InputPipe::new("x", c).err(),
            Some(PipelineError::Config(ConfigError::ClassCountMismatch { .. }))
        ));
        assert_eq!(
            "zigzag".parse::<ExpansionStrategy>(),
            Err(ConfigError::UnknownStrategy("zigzag".to_string()))
        );
    }

    #[test]
    fn test_decode_error_aborts() {
        let dir = tempdir().unwrap();
        let p = dir.path().join("bad.omtfrec");
        write_file(&p, 0, 1);
        let mut bytes = std::fs::read(&p).unwrap();
        bytes.truncate(bytes.len() - 3);
        std::fs::write(&p, bytes).unwrap();
        let mut pipe = InputPipe::new("train", config()).unwrap();
        pipe.bind(&[p]).unwrap();
        assert!(matches!(pipe.fetch(), Err(PipelineError::Decode(_))));
    }
}
