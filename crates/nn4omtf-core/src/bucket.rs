//! バケット計算
//!
//! 連続値（pt・電荷符号）を分類クラスのインデックスへ変換する。
//!
//! 正解ラベル用と OMTF 出力用の 2 系統のポリシーがある。
//!
//! - ラベル用: `numpy.digitize` と同じ右開区間 `E[i-1] <= v < E[i]`
//! - OMTF 用 pt: 先頭に 0 のエッジを足して digitize し、1 を引く。
//!   OMTF は不一致時に pt = -999 を返すため、負値はバケット 0 に寄せる。
//! - OMTF 用符号: 不一致時に charge ≈ -2.0 を返すため 3 クラスになる。
//!
//! ```text
//! ラベル符号:    0 = 負, 1 = 正                 (2 クラス)
//! OMTF 符号:     0 = 不一致, 1 = 負, 2 = 正     (3 クラス)
//! ```
//!
//! 符号の 2 つの空間は 1 つずれているので、位置で直接比較してはいけない。
//! 比較は `reference_sign_to_label` を通す。

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// ラベル符号のクラス数
pub const SIGN_CLASSES: usize = 2;

/// OMTF 符号のクラス数（不一致クラスを含む）
pub const REFERENCE_SIGN_CLASSES: usize = 3;

/// OMTF 符号の「不一致」バケット
pub const REFERENCE_SIGN_NO_MATCH: usize = 0;

/// OMTF が不一致時に返す charge の値
pub const OMTF_SIGN_SENTINEL: f32 = -2.0;

/// 不一致 sentinel とみなす許容幅
///
/// 実際の値は厳密な -2.0 ではなく -2.00... 近辺に散らばる。
const OMTF_SIGN_SENTINEL_TOLERANCE: f32 = 0.25;

/// バケットのエッジ列
///
/// 有限・狭義単調増加であることを構築時に保証する。
/// クラス数は `len() + 1`。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f32>", into = "Vec<f32>")]
pub struct BucketEdges(Vec<f32>);

impl BucketEdges {
    /// エッジ列を検証して作成
    pub fn new(edges: Vec<f32>) -> Result<Self, ConfigError> {
        if edges.is_empty() {
            return Err(ConfigError::EmptyEdges);
        }
        for (index, &value) in edges.iter().enumerate() {
            if !value.is_finite() {
                return Err(ConfigError::NonFiniteEdge { index, value });
            }
        }
        for (i, pair) in edges.windows(2).enumerate() {
            if pair[0] >= pair[1] {
                return Err(ConfigError::UnorderedEdges {
                    index: i + 1,
                    prev: pair[0],
                    next: pair[1],
                });
            }
        }
        Ok(Self(edges))
    }

    /// pt 用のエッジ列を作成
    ///
    /// OMTF 用ポリシーは先頭に 0 を足すため、最初のエッジは正でなければならない。
    pub fn pt(edges: Vec<f32>) -> Result<Self, ConfigError> {
        let edges = Self::new(edges)?;
        if edges.0[0] <= 0.0 {
            return Err(ConfigError::NonPositivePtEdge(edges.0[0]));
        }
        Ok(edges)
    }

    /// 出力クラス数との整合性を確認
    pub fn check_class_count(&self, classes: usize) -> Result<(), ConfigError> {
        if classes != self.class_count() {
            return Err(ConfigError::ClassCountMismatch {
                edges: self.len(),
                expected: self.class_count(),
                actual: classes,
            });
        }
        Ok(())
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    /// エッジ数
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// クラス数（エッジ数 + 1）
    pub fn class_count(&self) -> usize {
        self.0.len() + 1
    }
}

impl TryFrom<Vec<f32>> for BucketEdges {
    type Error = ConfigError;

    fn try_from(edges: Vec<f32>) -> Result<Self, Self::Error> {
        Self::new(edges)
    }
}

impl From<BucketEdges> for Vec<f32> {
    fn from(edges: BucketEdges) -> Self {
        edges.0
    }
}

/// `numpy.digitize(v, edges)` 相当（edges は昇順）
///
/// `v` 以下のエッジの個数を返す。範囲外の値は先頭・末尾のバケットになる。
#[inline]
pub fn digitize(v: f32, edges: &[f32]) -> usize {
    edges.partition_point(|&e| e <= v)
}

/// 正解 pt のバケット（`[0, k]`）
#[inline]
pub fn label_bucket(v: f32, edges: &BucketEdges) -> usize {
    digitize(v, edges.as_slice())
}

/// OMTF pt のバケット（`[0, k]`）
///
/// エッジ列 `[0, e1, .., ek]` で digitize して 1 を引く。
/// 負値（不一致時の -999 を含む）はバケット 0 に寄せる。
#[inline]
pub fn reference_bucket(v: f32, edges: &BucketEdges) -> usize {
    let with_zero_edge = usize::from(v >= 0.0) + digitize(v, edges.as_slice());
    with_zero_edge.saturating_sub(1)
}

/// 正解符号のバケット（0 = 負, 1 = 正）
#[inline]
pub fn sign_bucket(v: f32) -> usize {
    usize::from(v >= 0.0)
}

/// OMTF 符号のバケット（0 = 不一致, 1 = 負, 2 = 正）
///
/// エッジ `[-1.5, 0]` で digitize すると -5.0 のような負値まで不一致に落ちるため、
/// 不一致は -2.0 ± 0.25 の窓だけで判定し、それ以外は 0 を境に負・正へ分ける。
/// したがって -1.6 は「負」になる。
#[inline]
pub fn reference_sign_bucket(v: f32) -> usize {
    if (v - OMTF_SIGN_SENTINEL).abs() <= OMTF_SIGN_SENTINEL_TOLERANCE {
        REFERENCE_SIGN_NO_MATCH
    } else {
        1 + digitize(v, &[0.0])
    }
}

/// OMTF 符号バケットをラベル符号の空間に移す
///
/// 不一致バケットには対応するラベルがないので `None`。
#[inline]
pub fn reference_sign_to_label(k: usize) -> Option<usize> {
    k.checked_sub(1).filter(|&s| s < SIGN_CLASSES)
}

/// one-hot ベクトルを書き込む
///
/// `k` が範囲外なら全ゼロ。
#[inline]
pub fn write_one_hot(k: usize, out: &mut [f32]) {
    out.fill(0.0);
    if let Some(slot) = out.get_mut(k) {
        *slot = 1.0;
    }
}
