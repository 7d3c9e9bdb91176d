//! 参照モデル
//!
//! hits を平坦化してスケールし、pt と符号の 2 つのアフィンヘッドに通すだけの
//! softmax 分類器。CLI とテストで実際に学習させるために使う。
//!
//! # チェックポイント形式（little-endian）
//!
//! ```text
//! u32  magic "OMTF"
//! u32  version
//! u8   hits variant (0 = reduced, 1 = full)
//! u32  edges 数, f32 x edges
//! pt head:  f32 biases [classes], f32 weights [classes][input]
//! sgn head: f32 biases [2],       f32 weights [2][input]
//! ```

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::PathBuf;

use anyhow::{Context, bail, ensure};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, info};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::Serialize;

use super::optimizer::Adam;
use super::{ForwardMode, Gradients, Logits, Model};
use crate::bucket::{BucketEdges, SIGN_CLASSES};
use crate::record::HitsVariant;
use crate::stats::{TestAccuracy, TestStatistics};
use crate::tensor::BatchArray;

/// チェックポイントのマジック（"OMTF"）
pub const MODEL_MAGIC: u32 = 0x4654_4D4F;
pub const MODEL_VERSION: u32 = 1;

/// 入力スケール（remap 後の hits はおおよそ 0..2000）
const HITS_SCALE: f32 = 1.0 / 1024.0;

/// 学習可能なアフィン変換層（実行時に次元が決まる）
#[derive(Debug, Clone)]
pub struct Affine {
    pub input: usize,
    pub output: usize,
    /// 重み [output][input]
    pub weights: Vec<f32>,
    /// バイアス [output]
    pub biases: Vec<f32>,
    pub weight_grads: Vec<f32>,
    pub bias_grads: Vec<f32>,
}

impl Affine {
    /// ゼロ初期化
    pub fn new(input: usize, output: usize) -> Self {
        Self {
            input,
            output,
            weights: vec![0.0; output * input],
            biases: vec![0.0; output],
            weight_grads: vec![0.0; output * input],
            bias_grads: vec![0.0; output],
        }
    }

    /// Xavier 一様初期化
    pub fn init_xavier<R: Rng>(&mut self, rng: &mut R) {
        let limit = (6.0 / (self.input + self.output) as f32).sqrt();
        for w in &mut self.weights {
            *w = rng.random::<f32>() * 2.0 * limit - limit;
        }
        self.biases.fill(0.0);
    }

    /// 順伝播（バッチ）
    pub fn forward(&self, input: &BatchArray) -> BatchArray {
        let n = input.rows();
        let mut out = BatchArray::zeros(vec![n, self.output]);
        for r in 0..n {
            let x = input.row(r);
            debug_assert_eq!(x.len(), self.input);
            for (j, o) in out.row_mut(r).iter_mut().enumerate() {
                let w = &self.weights[j * self.input..(j + 1) * self.input];
                *o = self.biases[j] + w.iter().zip(x).map(|(a, b)| a * b).sum::<f32>();
            }
        }
        out
    }

    /// 出力勾配から重み勾配を累積する（入力勾配は使わないので計算しない）
    pub fn backward(&mut self, input: &BatchArray, output_grad: &BatchArray) {
        for r in 0..input.rows() {
            let x = input.row(r);
            for (j, &g) in output_grad.row(r).iter().enumerate() {
                if g == 0.0 {
                    continue;
                }
                self.bias_grads[j] += g;
                let wg = &mut self.weight_grads[j * self.input..(j + 1) * self.input];
                for (w, &xi) in wg.iter_mut().zip(x) {
                    *w += g * xi;
                }
            }
        }
    }

    pub fn zero_grad(&mut self) {
        self.weight_grads.fill(0.0);
        self.bias_grads.fill(0.0);
    }

    pub fn param_count(&self) -> usize {
        self.output * self.input + self.output
    }

    fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        for &b in &self.biases {
            w.write_f32::<LittleEndian>(b)?;
        }
        for &x in &self.weights {
            w.write_f32::<LittleEndian>(x)?;
        }
        Ok(())
    }

    fn read<R: Read>(&mut self, r: &mut R) -> io::Result<()> {
        r.read_f32_into::<LittleEndian>(&mut self.biases)?;
        r.read_f32_into::<LittleEndian>(&mut self.weights)?;
        Ok(())
    }
}

/// テスト 1 回分の記録
#[derive(Debug, Clone, Serialize)]
pub struct TestRecord {
    pub session: String,
    pub accuracy: TestAccuracy,
    pub examples: u64,
}

/// 2 ヘッド線形 softmax 分類器
pub struct LinearClassifier {
    name: String,
    variant: HitsVariant,
    edges: BucketEdges,
    pt: Affine,
    sgn: Affine,
    optimizer: Adam,
    /// 直前の学習モード順伝播の入力（スケール済み）
    cache: Option<BatchArray>,
    checkpoint: Option<PathBuf>,
    session: Option<String>,
    tests: Vec<TestRecord>,
}

impl LinearClassifier {
    pub fn new(name: impl Into<String>, variant: HitsVariant, edges: BucketEdges, seed: u64) -> Self {
        let input = variant.len();
        let mut pt = Affine::new(input, edges.class_count());
        let mut sgn = Affine::new(input, SIGN_CLASSES);
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        pt.init_xavier(&mut rng);
        sgn.init_xavier(&mut rng);
        let optimizer = Adam::new(&[pt.weights.len(), pt.biases.len(), sgn.weights.len(), sgn.biases.len()]);
        Self {
            name: name.into(),
            variant,
            edges,
            pt,
            sgn,
            optimizer,
            cache: None,
            checkpoint: None,
            session: None,
            tests: Vec::new(),
        }
    }

    /// チェックポイントファイルを設定する。`restore` で存在すれば読み込み、`save` で書き出す
    pub fn with_checkpoint(mut self, path: impl Into<PathBuf>) -> Self {
        self.checkpoint = Some(path.into());
        self
    }

    /// Adam の重み減衰（既定 0）
    pub fn with_weight_decay(mut self, weight_decay: f32) -> Self {
        self.optimizer = self.optimizer.with_weight_decay(weight_decay);
        self
    }

    pub fn param_count(&self) -> usize {
        self.pt.param_count() + self.sgn.param_count()
    }

    /// 記録済みのテスト結果
    pub fn tests(&self) -> &[TestRecord] {
        &self.tests
    }

    /// 現在のセッション名
    pub fn session(&self) -> Option<&str> {
        self.session.as_deref()
    }

    fn scaled(&self, hits: &BatchArray) -> anyhow::Result<BatchArray> {
        ensure!(
            hits.row_len() == self.pt.input,
            "hits row length {} does not match model input {}",
            hits.row_len(),
            self.pt.input
        );
        let n = hits.rows();
        let data = hits.data().iter().map(|&h| h * HITS_SCALE).collect();
        Ok(BatchArray::new(vec![n, self.pt.input], data))
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u32::<LittleEndian>(MODEL_MAGIC)?;
        w.write_u32::<LittleEndian>(MODEL_VERSION)?;
        w.write_u8(match self.variant {
            HitsVariant::Reduced => 0,
            HitsVariant::Full => 1,
        })?;
        w.write_u32::<LittleEndian>(self.edges.len() as u32)?;
        for &e in self.edges.as_slice() {
            w.write_f32::<LittleEndian>(e)?;
        }
        self.pt.write(w)?;
        self.sgn.write(w)
    }

    pub fn read_from<R: Read>(&mut self, r: &mut R) -> anyhow::Result<()> {
        let magic = r.read_u32::<LittleEndian>()?;
        ensure!(magic == MODEL_MAGIC, "bad checkpoint magic {magic:#010x}");
        let version = r.read_u32::<LittleEndian>()?;
        ensure!(version == MODEL_VERSION, "unsupported checkpoint version {version}");
        let variant = match r.read_u8()? {
            0 => HitsVariant::Reduced,
            1 => HitsVariant::Full,
            other => bail!("bad hits variant tag {other}"),
        };
        ensure!(variant == self.variant, "checkpoint is for {variant} hits, model uses {}", self.variant);
        let n = r.read_u32::<LittleEndian>()? as usize;
        let mut edges = vec![0.0f32; n];
        r.read_f32_into::<LittleEndian>(&mut edges)?;
        ensure!(
            edges == self.edges.as_slice(),
            "checkpoint pt edges {edges:?} differ from model edges {:?}",
            self.edges.as_slice()
        );
        self.pt.read(r)?;
        self.sgn.read(r)?;
        Ok(())
    }
}

impl Model for LinearClassifier {
    fn name(&self) -> &str {
        &self.name
    }

    fn hits_variant(&self) -> HitsVariant {
        self.variant
    }

    fn pt_edges(&self) -> &BucketEdges {
        &self.edges
    }

    fn restore(&mut self, session_name: &str) -> anyhow::Result<()> {
        self.session = Some(session_name.to_string());
        self.cache = None;
        let Some(path) = self.checkpoint.clone() else {
            return Ok(());
        };
        if !path.exists() {
            info!("No checkpoint at {}, starting from fresh weights", path.display());
            return Ok(());
        }
        let file = File::open(&path).with_context(|| format!("open {}", path.display()))?;
        self.read_from(&mut BufReader::new(file))
            .with_context(|| format!("read checkpoint {}", path.display()))?;
        info!("Restored model {} from {}", self.name, path.display());
        Ok(())
    }

    fn forward(&mut self, hits: &BatchArray, mode: ForwardMode) -> anyhow::Result<Logits> {
        let x = self.scaled(hits)?;
        let logits = Logits { pt: self.pt.forward(&x), sgn: self.sgn.forward(&x) };
        self.cache = match mode {
            ForwardMode::Train => Some(x),
            ForwardMode::Eval => None,
        };
        Ok(logits)
    }

    fn backward(&mut self, grads: &Gradients, learning_rate: f32) -> anyhow::Result<()> {
        let Some(x) = self.cache.take() else {
            bail!("backward called without a training forward pass");
        };
        ensure!(
            grads.pt.rows() == x.rows() && grads.sgn.rows() == x.rows(),
            "gradient batch size does not match forward input ({} rows)",
            x.rows()
        );
        self.pt.zero_grad();
        self.sgn.zero_grad();
        self.pt.backward(&x, &grads.pt);
        self.sgn.backward(&x, &grads.sgn);

        let Self { pt, sgn, optimizer, .. } = self;
        optimizer.step(
            learning_rate,
            &mut [
                (&mut pt.weights[..], &pt.weight_grads[..]),
                (&mut pt.biases[..], &pt.bias_grads[..]),
                (&mut sgn.weights[..], &sgn.weight_grads[..]),
                (&mut sgn.biases[..], &sgn.bias_grads[..]),
            ],
        );
        Ok(())
    }

    fn save(&mut self) -> anyhow::Result<()> {
        let Some(path) = self.checkpoint.as_ref() else {
            debug!("Model {} has no checkpoint path, skipping save", self.name);
            return Ok(());
        };
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let mut w = BufWriter::new(File::create(path).with_context(|| format!("create {}", path.display()))?);
        self.write_to(&mut w)?;
        w.flush()?;
        info!("Saved model {} to {}", self.name, path.display());

        if !self.tests.is_empty() {
            let log_path = path.with_extension("tests.json");
            fs::write(&log_path, serde_json::to_string_pretty(&self.tests)?)
                .with_context(|| format!("write {}", log_path.display()))?;
        }
        Ok(())
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        self.cache = None;
        debug!("Model {} finished after {} optimizer steps", self.name, self.optimizer.steps());
        Ok(())
    }

    fn record_test(
        &mut self,
        session_name: &str,
        accuracy: &TestAccuracy,
        stats: &TestStatistics,
    ) -> anyhow::Result<()> {
        self.tests.push(TestRecord {
            session: session_name.to_string(),
            accuracy: *accuracy,
            examples: stats.examples,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::softmax_cross_entropy;
    use tempfile::tempdir;

    fn model() -> LinearClassifier {
        LinearClassifier::new("lin", HitsVariant::Reduced, BucketEdges::pt(vec![10.0, 20.0]).unwrap(), 3)
    }

    fn hits(rows: usize, value: f32) -> BatchArray {
        BatchArray::new(vec![rows, 18, 2], vec![value; rows * 36])
    }

    #[test]
    fn test_forward_shapes() {
        let mut m = model();
        let out = m.forward(&hits(5, 600.0), ForwardMode::Eval).unwrap();
        assert_eq!(out.pt.shape(), &[5, 3]);
        assert_eq!(out.sgn.shape(), &[5, 2]);
        assert_eq!(m.param_count(), 3 * 36 + 3 + 2 * 36 + 2);
    }

    #[test]
    fn test_forward_rejects_wrong_width() {
        let mut m = model();
        let wide = BatchArray::new(vec![1, 18, 14], vec![0.0; 18 * 14]);
        assert!(m.forward(&wide, ForwardMode::Eval).is_err());
    }

    #[test]
    fn test_backward_needs_train_forward() {
        let mut m = model();
        let out = m.forward(&hits(2, 1.0), ForwardMode::Eval).unwrap();
        let grads = Gradients { pt: out.pt, sgn: out.sgn };
        assert!(m.backward(&grads, 0.01).is_err());
    }

    #[test]
    fn test_training_reduces_loss() {
        let mut m = model();
        let x = hits(4, 800.0);
        let pt_labels = BatchArray::new(vec![4, 3], [0.0, 0.0, 1.0].repeat(4));
        let sgn_labels = BatchArray::new(vec![4, 2], [1.0, 0.0].repeat(4));

        let mut first = None;
        let mut last = 0.0;
        for _ in 0..50 {
            let out = m.forward(&x, ForwardMode::Train).unwrap();
            let (pt_loss, pt_grad) = softmax_cross_entropy(&out.pt, &pt_labels);
            let (sgn_loss, sgn_grad) = softmax_cross_entropy(&out.sgn, &sgn_labels);
            last = pt_loss + sgn_loss;
            first.get_or_insert(last);
            m.backward(&Gradients { pt: pt_grad, sgn: sgn_grad }, 0.05).unwrap();
        }
        assert!(last < first.unwrap() * 0.5, "{last} vs {first:?}");
    }

    #[test]
    fn test_checkpoint_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("models/lin.bin");
        let mut a = model().with_checkpoint(&path);
        a.restore("s1").unwrap();
        a.save().unwrap();
        assert!(path.exists());

        let mut b = LinearClassifier::new("lin", HitsVariant::Reduced, BucketEdges::pt(vec![10.0, 20.0]).unwrap(), 99)
            .with_checkpoint(&path);
        b.restore("s2").unwrap();
        let x = hits(1, 700.0);
        assert_eq!(
            a.forward(&x, ForwardMode::Eval).unwrap(),
            b.forward(&x, ForwardMode::Eval).unwrap()
        );
        assert_eq!(b.session(), Some("s2"));
    }

    #[test]
    fn test_checkpoint_edge_mismatch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lin.bin");
        model().with_checkpoint(&path).save().unwrap();
        let mut other =
            LinearClassifier::new("lin", HitsVariant::Reduced, BucketEdges::pt(vec![5.0, 20.0]).unwrap(), 3)
                .with_checkpoint(&path);
        assert!(other.restore("s").is_err());
    }
}
