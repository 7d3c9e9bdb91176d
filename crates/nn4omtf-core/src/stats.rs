//! テスト統計
//!
//! テスト 1 回分の NN と OMTF の出力分布を集計する。
//! 描画はしない。JSON に書き出して外部でプロットする。

use std::collections::BTreeMap;

use serde::Serialize;

use crate::bucket::{
    BucketEdges, REFERENCE_SIGN_CLASSES, REFERENCE_SIGN_NO_MATCH, SIGN_CLASSES,
    reference_sign_to_label,
};
use crate::metrics::RunningAccuracy;
use crate::pipeline::Batch;
use crate::record::ExtraField;
use crate::tensor::{BatchArray, argmax};

/// 混同行列（行 = 正解, 列 = 予測）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfusionMatrix {
    pub matrix: Vec<Vec<u64>>,
}

impl ConfusionMatrix {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self { matrix: vec![vec![0; cols]; rows] }
    }

    /// 範囲外のインデックスは数えない
    pub fn add(&mut self, target: usize, pred: usize) {
        if let Some(cell) = self.matrix.get_mut(target).and_then(|r| r.get_mut(pred)) {
            *cell += 1;
        }
    }

    pub fn get(&self, target: usize, pred: usize) -> u64 {
        self.matrix.get(target).and_then(|r| r.get(pred)).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.matrix.iter().flatten().sum()
    }
}

/// pt コードごとの分布
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CodeStats {
    pub events: u64,
    pub label_pt: Vec<u64>,
    pub nn_pt: Vec<u64>,
    pub omtf_pt: Vec<u64>,
    pub nn_sgn: [u64; SIGN_CLASSES],
    pub omtf_sgn: [u64; REFERENCE_SIGN_CLASSES],
}

impl CodeStats {
    fn new(classes: usize) -> Self {
        Self {
            events: 0,
            label_pt: vec![0; classes],
            nn_pt: vec![0; classes],
            omtf_pt: vec![0; classes],
            nn_sgn: [0; SIGN_CLASSES],
            omtf_sgn: [0; REFERENCE_SIGN_CLASSES],
        }
    }
}

/// テストの精度
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TestAccuracy {
    pub pt: f64,
    pub sgn: f64,
    pub omtf_pt: f64,
    pub omtf_sgn: f64,
}

/// ターンオンカーブ
///
/// `nn[k][j]` は pt コード `pt_codes[j]` のうち予測クラスが `k` 以上だった割合。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnOnCurves {
    pub pt_codes: Vec<i64>,
    pub nn: Vec<Vec<f64>>,
    pub omtf: Vec<Vec<f64>>,
}

/// テスト統計
#[derive(Debug, Clone, Serialize)]
pub struct TestStatistics {
    pub pt_bins: Vec<f32>,
    pub examples: u64,
    pub no_signal: u64,
    pub omtf_no_match: u64,
    pub nn_pt: ConfusionMatrix,
    pub omtf_pt: ConfusionMatrix,
    pub nn_sgn: ConfusionMatrix,
    /// 列は OMTF 符号バケット（0 = 不一致）
    pub omtf_sgn: ConfusionMatrix,
    pub codes: BTreeMap<i64, CodeStats>,
    #[serde(skip)]
    acc: [RunningAccuracy; 4],
}

impl TestStatistics {
    pub fn new(pt_edges: &BucketEdges) -> Self {
        let classes = pt_edges.class_count();
        Self {
            pt_bins: pt_edges.as_slice().to_vec(),
            examples: 0,
            no_signal: 0,
            omtf_no_match: 0,
            nn_pt: ConfusionMatrix::new(classes, classes),
            omtf_pt: ConfusionMatrix::new(classes, classes),
            nn_sgn: ConfusionMatrix::new(SIGN_CLASSES, SIGN_CLASSES),
            omtf_sgn: ConfusionMatrix::new(SIGN_CLASSES, REFERENCE_SIGN_CLASSES),
            codes: BTreeMap::new(),
            acc: [RunningAccuracy::default(); 4],
        }
    }

    pub fn classes(&self) -> usize {
        self.pt_bins.len() + 1
    }

    /// 1 バッチ分を集計する
    pub fn update(&mut self, batch: &Batch, pt_logits: &BatchArray, sgn_logits: &BatchArray) {
        let classes = self.classes();
        let codes = batch.extra.column(ExtraField::PtCode);
        let pt_k = batch.extra.column(ExtraField::PtK);
        let sgn_k = batch.extra.column(ExtraField::SgnK);
        let omtf_pt_k = batch.extra.column(ExtraField::OmtfPtK);
        let omtf_sgn_k = batch.extra.column(ExtraField::OmtfSgnK);

        for i in 0..batch.len() {
            let label_pt = pt_k[i] as usize;
            let label_sgn = sgn_k[i] as usize;
            let nn_pt = argmax(pt_logits.row(i));
            let nn_sgn = argmax(sgn_logits.row(i));
            let omtf_pt = omtf_pt_k[i] as usize;
            let omtf_sgn = omtf_sgn_k[i] as usize;

            self.examples += 1;
            if batch.no_signal.get(i).copied().unwrap_or(false) {
                self.no_signal += 1;
            }
            if omtf_sgn == REFERENCE_SIGN_NO_MATCH {
                self.omtf_no_match += 1;
            }

            self.nn_pt.add(label_pt, nn_pt);
            self.omtf_pt.add(label_pt, omtf_pt);
            self.nn_sgn.add(label_sgn, nn_sgn);
            self.omtf_sgn.add(label_sgn, omtf_sgn);

            let [a_pt, a_sgn, a_omtf_pt, a_omtf_sgn] = &mut self.acc;
            a_pt.add_counts(u64::from(nn_pt == label_pt), 1);
            a_sgn.add_counts(u64::from(nn_sgn == label_sgn), 1);
            a_omtf_pt.add_counts(u64::from(omtf_pt == label_pt), 1);
            a_omtf_sgn.add_counts(u64::from(reference_sign_to_label(omtf_sgn) == Some(label_sgn)), 1);

            let code = self
                .codes
                .entry(codes[i].round() as i64)
                .or_insert_with(|| CodeStats::new(classes));
            code.events += 1;
            if let Some(c) = code.label_pt.get_mut(label_pt) {
                *c += 1;
            }
            if let Some(c) = code.nn_pt.get_mut(nn_pt) {
                *c += 1;
            }
            if let Some(c) = code.omtf_pt.get_mut(omtf_pt) {
                *c += 1;
            }
            if let Some(c) = code.nn_sgn.get_mut(nn_sgn) {
                *c += 1;
            }
            if let Some(c) = code.omtf_sgn.get_mut(omtf_sgn) {
                *c += 1;
            }
        }
    }

    /// NN と OMTF の精度（OMTF の不一致は誤りとして数える）
    pub fn accuracy(&self) -> TestAccuracy {
        let [pt, sgn, omtf_pt, omtf_sgn] = self.acc.map(|a| a.value());
        TestAccuracy { pt, sgn, omtf_pt, omtf_sgn }
    }

    pub fn turn_on_curves(&self) -> TurnOnCurves {
        fn nn_hist(s: &CodeStats) -> &[u64] {
            &s.nn_pt
        }
        fn omtf_hist(s: &CodeStats) -> &[u64] {
            &s.omtf_pt
        }
        TurnOnCurves {
            pt_codes: self.codes.keys().copied().collect(),
            nn: self.curve(nn_hist),
            omtf: self.curve(omtf_hist),
        }
    }

    fn curve(&self, hist: fn(&CodeStats) -> &[u64]) -> Vec<Vec<f64>> {
        (0..self.classes())
            .map(|k| {
                self.codes
                    .values()
                    .map(|s| {
                        let above: u64 = hist(s)[k..].iter().sum();
                        if s.events == 0 { 0.0 } else { above as f64 / s.events as f64 }
                    })
                    .collect()
            })
            .collect()
    }

    /// 精度とカーブを含む JSON
    pub fn to_json(&self) -> serde_json::Result<String> {
        #[derive(Serialize)]
        struct Report<'a> {
            accuracy: TestAccuracy,
            curves: TurnOnCurves,
            #[serde(flatten)]
            stats: &'a TestStatistics,
        }
        serde_json::to_string_pretty(&Report {
            accuracy: self.accuracy(),
            curves: self.turn_on_curves(),
            stats: self,
        })
    }
}
