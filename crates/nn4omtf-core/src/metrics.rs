//! 損失と精度
//!
//! `(名前, ロジット, ラベル)` の組ごとに softmax 交差エントロピーを計算する。
//! 学習では各組の損失の和を最小化するので、各ロジットへの勾配は
//! その組の損失の勾配そのものになる。

use crate::tensor::{BatchArray, argmax};

/// 学習・評価の対象 1 組
#[derive(Debug, Clone, Copy)]
pub struct Target<'a> {
    pub name: &'static str,
    pub logits: &'a BatchArray,
    pub labels: &'a BatchArray,
}

impl<'a> Target<'a> {
    pub fn new(name: &'static str, logits: &'a BatchArray, labels: &'a BatchArray) -> Self {
        Self { name, logits, labels }
    }
}

/// 数値的に安定な softmax（in-place）
pub fn softmax_in_place(row: &mut [f32]) {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for v in row.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    if sum > 0.0 {
        for v in row.iter_mut() {
            *v /= sum;
        }
    }
}

/// softmax 交差エントロピー（バッチ平均）とロジットに対する勾配
///
/// 空バッチでは損失 0、勾配も空になる。
pub fn softmax_cross_entropy(logits: &BatchArray, labels: &BatchArray) -> (f32, BatchArray) {
    debug_assert_eq!(logits.shape(), labels.shape());
    let n = logits.rows();
    let mut grad = logits.clone();
    if n == 0 {
        return (0.0, grad);
    }

    let inv_n = 1.0 / n as f32;
    let mut total = 0.0f64;
    for i in 0..n {
        let label = labels.row(i);
        let probs = grad.row_mut(i);
        softmax_in_place(probs);
        for (p, &y) in probs.iter_mut().zip(label) {
            if y > 0.0 {
                total -= f64::from(y) * f64::from(p.max(1e-12)).ln();
            }
            *p = (*p - y) * inv_n;
        }
    }
    ((total / n as f64) as f32, grad)
}

/// 1 ステップ分の損失と勾配
#[derive(Debug, Clone)]
pub struct StepLoss {
    /// 組ごとの交差エントロピー（入力と同順）
    pub losses: Vec<(&'static str, f32)>,
    /// 損失の和
    pub total: f32,
    /// 各ロジットへの勾配（入力と同順）
    pub grads: Vec<BatchArray>,
}

impl StepLoss {
    pub fn compute(targets: &[Target<'_>]) -> Self {
        let mut losses = Vec::with_capacity(targets.len());
        let mut grads = Vec::with_capacity(targets.len());
        for t in targets {
            let (loss, grad) = softmax_cross_entropy(t.logits, t.labels);
            losses.push((t.name, loss));
            grads.push(grad);
        }
        let total = losses.iter().map(|&(_, l)| l).sum();
        Self { losses, total, grads }
    }

    pub fn loss(&self, name: &str) -> Option<f32> {
        self.losses.iter().find(|(n, _)| *n == name).map(|&(_, l)| l)
    }
}

/// バッチ内で argmax が一致した数
pub fn count_correct(logits: &BatchArray, labels: &BatchArray) -> u64 {
    (0..logits.rows())
        .filter(|&i| argmax(logits.row(i)) == argmax(labels.row(i)))
        .count() as u64
}

/// 累積精度
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunningAccuracy {
    pub correct: u64,
    pub total: u64,
}

impl RunningAccuracy {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn add_counts(&mut self, correct: u64, total: u64) {
        self.correct += correct;
        self.total += total;
    }

    pub fn update(&mut self, logits: &BatchArray, labels: &BatchArray) {
        self.add_counts(count_correct(logits, labels), logits.rows() as u64);
    }

    /// `correct / total`（空なら 0）
    pub fn value(&self) -> f64 {
        if self.total == 0 { 0.0 } else { self.correct as f64 / self.total as f64 }
    }
}

/// 名前付きの累積精度の集合
#[derive(Debug, Clone)]
pub struct MetricSet {
    entries: Vec<(&'static str, RunningAccuracy)>,
    examples: u64,
}

impl MetricSet {
    pub fn new(names: &[&'static str]) -> Self {
        Self { entries: names.iter().map(|&n| (n, RunningAccuracy::default())).collect(), examples: 0 }
    }

    pub fn reset(&mut self) {
        for (_, acc) in &mut self.entries {
            acc.reset();
        }
        self.examples = 0;
    }

    /// 名前が一致する累積精度を更新する。未知の名前は無視
    pub fn update(&mut self, targets: &[Target<'_>]) {
        let mut rows = 0;
        for t in targets {
            if let Some((_, acc)) = self.entries.iter_mut().find(|(n, _)| *n == t.name) {
                acc.update(t.logits, t.labels);
                rows = rows.max(t.logits.rows());
            }
        }
        self.examples += rows as u64;
    }

    pub fn get(&self, name: &str) -> Option<&RunningAccuracy> {
        self.entries.iter().find(|(n, _)| *n == name).map(|(_, a)| a)
    }

    /// 処理したサンプル数
    pub fn examples(&self) -> u64 {
        self.examples
    }

    /// `(名前, 精度)` を登録順に返す
    pub fn values(&self) -> Vec<(&'static str, f64)> {
        self.entries.iter().map(|(n, a)| (*n, a.value())).collect()
    }
}
