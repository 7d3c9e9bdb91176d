//! イベントレコード
//!
//! 1 イベント分の固定長バイナリレコードのスキーマと、
//! それを学習用のテンソル・ラベル・診断値に変換するデコーダ。
//!
//! # ペイロード（すべて little-endian f32）
//!
//! ```text
//! hits reduced  18 x 2
//! hits full     18 x 14
//! production    4   (pt, eta, phi, charge)
//! omtf          6   (pt, eta, phi, charge, quality, ref_layer)
//! pt code       1
//! ```
//!
//! デコードは純粋関数で、共有状態を持たないので任意に並列化できる。

use std::fmt;
use std::str::FromStr;

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::bucket::{
    BucketEdges, SIGN_CLASSES, label_bucket, reference_bucket, reference_sign_bucket,
    sign_bucket, write_one_hot,
};
use crate::error::{ConfigError, DecodeError};

/// hits の行数（OMTF の論理レイヤ数）
pub const HITS_ROWS: usize = 18;
/// REDUCED hits の列数
pub const HITS_REDUCED_COLS: usize = 2;
/// FULL hits の列数
pub const HITS_FULL_COLS: usize = 14;

/// production レコードの要素数と添字
pub const PROD_LEN: usize = 4;
pub const PROD_IDX_PT: usize = 0;
pub const PROD_IDX_SIGN: usize = 3;

/// OMTF レコードの要素数と添字
pub const OMTF_LEN: usize = 6;
pub const OMTF_IDX_PT: usize = 0;
pub const OMTF_IDX_SIGN: usize = 3;

/// 生の hits で「ヒットなし」を表す値
pub const HITS_NO_HIT: f32 = 5400.0;

const REDUCED_LEN: usize = HITS_ROWS * HITS_REDUCED_COLS;
const FULL_LEN: usize = HITS_ROWS * HITS_FULL_COLS;

const OFFSET_REDUCED: usize = 0;
const OFFSET_FULL: usize = OFFSET_REDUCED + REDUCED_LEN;
const OFFSET_PROD: usize = OFFSET_FULL + FULL_LEN;
const OFFSET_OMTF: usize = OFFSET_PROD + PROD_LEN;
const OFFSET_PT_CODE: usize = OFFSET_OMTF + OMTF_LEN;
const PAYLOAD_FLOATS: usize = OFFSET_PT_CODE + 1;

/// ペイロードのバイト数
pub const PAYLOAD_SIZE: usize = PAYLOAD_FLOATS * 4;

/// 入力 hits の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HitsVariant {
    /// `[18, 2]`
    Reduced,
    /// `[18, 14]`
    Full,
}

impl HitsVariant {
    /// 1 イベントあたりの形状
    pub const fn shape(self) -> [usize; 2] {
        match self {
            Self::Reduced => [HITS_ROWS, HITS_REDUCED_COLS],
            Self::Full => [HITS_ROWS, HITS_FULL_COLS],
        }
    }

    /// 1 イベントあたりの要素数
    pub const fn len(self) -> usize {
        match self {
            Self::Reduced => REDUCED_LEN,
            Self::Full => FULL_LEN,
        }
    }

    const fn offset(self) -> usize {
        match self {
            Self::Reduced => OFFSET_REDUCED,
            Self::Full => OFFSET_FULL,
        }
    }
}

impl FromStr for HitsVariant {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "reduced" => Ok(Self::Reduced),
            "full" => Ok(Self::Full),
            _ => Err(ConfigError::UnknownHitsVariant(s.to_string())),
        }
    }
}

impl fmt::Display for HitsVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Reduced => "reduced",
            Self::Full => "full",
        })
    }
}

/// 診断値のフィールド
///
/// 損失には使わない。順序は `ExtraField::ALL` で固定。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtraField {
    /// サンプルの pt コード
    PtCode,
    /// production pt の生値
    PtVal,
    /// production pt のバケット
    PtK,
    /// production 符号のバケット
    SgnK,
    /// OMTF pt の生値
    OmtfPtVal,
    /// OMTF pt のバケット
    OmtfPtK,
    /// OMTF 符号のバケット（0 = 不一致）
    OmtfSgnK,
}

/// 診断値フィールドの数
pub const EXTRA_FIELD_COUNT: usize = 7;

impl ExtraField {
    pub const ALL: [ExtraField; EXTRA_FIELD_COUNT] = [
        Self::PtCode,
        Self::PtVal,
        Self::PtK,
        Self::SgnK,
        Self::OmtfPtVal,
        Self::OmtfPtK,
        Self::OmtfSgnK,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Self::PtCode => "PT_CODE",
            Self::PtVal => "PT_VAL",
            Self::PtK => "PT_K",
            Self::SgnK => "SGN_K",
            Self::OmtfPtVal => "OMTF_PT_VAL",
            Self::OmtfPtK => "OMTF_PT_K",
            Self::OmtfSgnK => "OMTF_SGN_K",
        }
    }

    /// `ALL` 内での位置
    pub const fn index(self) -> usize {
        self as usize
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.name() == name)
    }
}

/// 診断値フィールド名（`ExtraField::ALL` と同順）
pub const EXTRA_FIELD_NAMES: [&str; EXTRA_FIELD_COUNT] = [
    ExtraField::PtCode.name(),
    ExtraField::PtVal.name(),
    ExtraField::PtK.name(),
    ExtraField::SgnK.name(),
    ExtraField::OmtfPtVal.name(),
    ExtraField::OmtfPtK.name(),
    ExtraField::OmtfSgnK.name(),
];

/// hits の値の置き換え `(null, shift)`
///
/// 「ヒットなし」は `null_value` に、それ以外は `shift_value` を足す。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HitsRemap {
    pub null_value: f32,
    pub shift_value: f32,
}

impl HitsRemap {
    pub fn apply(&self, hits: &mut [f32]) {
        for h in hits {
            *h = if *h == HITS_NO_HIT { self.null_value } else { *h + self.shift_value };
        }
    }
}

/// 書き込み用のイベント
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub hits_reduced: Vec<f32>,
    pub hits_full: Vec<f32>,
    pub prod: [f32; PROD_LEN],
    pub omtf: [f32; OMTF_LEN],
    pub pt_code: f32,
}

impl Event {
    /// ヒットなしで埋めたイベント
    pub fn empty(prod: [f32; PROD_LEN], omtf: [f32; OMTF_LEN], pt_code: f32) -> Self {
        Self {
            hits_reduced: vec![HITS_NO_HIT; REDUCED_LEN],
            hits_full: vec![HITS_NO_HIT; FULL_LEN],
            prod,
            omtf,
            pt_code,
        }
    }

    /// ペイロードへエンコード
    ///
    /// # Panics
    /// hits の要素数がスキーマと一致しない場合
    pub fn encode(&self) -> Vec<u8> {
        assert_eq!(self.hits_reduced.len(), REDUCED_LEN, "hits_reduced length");
        assert_eq!(self.hits_full.len(), FULL_LEN, "hits_full length");

        let mut floats = Vec::with_capacity(PAYLOAD_FLOATS);
        floats.extend_from_slice(&self.hits_reduced);
        floats.extend_from_slice(&self.hits_full);
        floats.extend_from_slice(&self.prod);
        floats.extend_from_slice(&self.omtf);
        floats.push(self.pt_code);

        let mut bytes = vec![0u8; PAYLOAD_SIZE];
        LittleEndian::write_f32_into(&floats, &mut bytes);
        bytes
    }
}

/// デコード済みの 1 イベント
#[derive(Debug, Clone, PartialEq)]
pub struct Example {
    /// 選択した種類の hits（remap 適用済み）
    pub hits: Vec<f32>,
    /// pt の one-hot
    pub pt_label: Vec<f32>,
    /// 符号の one-hot（0 = 負, 1 = 正）
    pub sign_label: [f32; SIGN_CLASSES],
    /// 診断値（`ExtraField::ALL` の順）
    pub extra: [f32; EXTRA_FIELD_COUNT],
    /// 信号なしイベント（検出有効時のみ true になり得る）
    pub no_signal: bool,
}

impl Example {
    pub fn extra(&self, field: ExtraField) -> f32 {
        self.extra[field.index()]
    }
}

/// デコード設定
#[derive(Debug, Clone)]
pub struct DecodeSpec {
    variant: HitsVariant,
    edges: BucketEdges,
    classes: usize,
    remap: Option<HitsRemap>,
    detect_no_signal: bool,
}

impl DecodeSpec {
    /// エッジ数と出力クラス数の整合性を確認して作成
    pub fn new(
        variant: HitsVariant,
        edges: BucketEdges,
        classes: usize,
    ) -> Result<Self, ConfigError> {
        edges.check_class_count(classes)?;
        Ok(Self { variant, edges, classes, remap: None, detect_no_signal: false })
    }

    pub fn with_remap(mut self, remap: Option<HitsRemap>) -> Self {
        self.remap = remap;
        self
    }

    pub fn with_no_signal_detection(mut self, enabled: bool) -> Self {
        self.detect_no_signal = enabled;
        self
    }

    pub fn variant(&self) -> HitsVariant {
        self.variant
    }

    pub fn edges(&self) -> &BucketEdges {
        &self.edges
    }

    pub fn classes(&self) -> usize {
        self.classes
    }
}

fn finite(value: f32, field: &'static str) -> Result<f32, DecodeError> {
    if value.is_finite() { Ok(value) } else { Err(DecodeError::NonFinite { field }) }
}

/// ペイロードを 1 イベントにデコード
pub fn decode(payload: &[u8], spec: &DecodeSpec) -> Result<Example, DecodeError> {
    if payload.len() != PAYLOAD_SIZE {
        return Err(DecodeError::PayloadSize { expected: PAYLOAD_SIZE, actual: payload.len() });
    }

    let read = |offset: usize, len: usize| {
        let mut out = vec![0.0f32; len];
        LittleEndian::read_f32_into(&payload[offset * 4..(offset + len) * 4], &mut out);
        out
    };

    let mut hits = read(spec.variant.offset(), spec.variant.len());
    let prod = read(OFFSET_PROD, PROD_LEN);
    let omtf = read(OFFSET_OMTF, OMTF_LEN);
    let pt_code = finite(read(OFFSET_PT_CODE, 1)[0], "pt_code")?;

    let prod_pt = finite(prod[PROD_IDX_PT], "prod.pt")?;
    let prod_sign = finite(prod[PROD_IDX_SIGN], "prod.charge")?;
    let omtf_pt = finite(omtf[OMTF_IDX_PT], "omtf.pt")?;
    let omtf_sign = finite(omtf[OMTF_IDX_SIGN], "omtf.charge")?;

    // 検出は remap 前の生値で行う
    let no_signal = spec.detect_no_signal && hits.iter().all(|&h| h == HITS_NO_HIT);
    if let Some(remap) = &spec.remap {
        remap.apply(&mut hits);
    }

    let pt_k = label_bucket(prod_pt, &spec.edges);
    let sgn_k = sign_bucket(prod_sign);
    let omtf_pt_k = reference_bucket(omtf_pt, &spec.edges);
    let omtf_sgn_k = reference_sign_bucket(omtf_sign);

    let mut pt_label = vec![0.0; spec.classes];
    write_one_hot(pt_k, &mut pt_label);
    let mut sign_label = [0.0; SIGN_CLASSES];
    write_one_hot(sgn_k, &mut sign_label);

    let extra = [
        pt_code,
        prod_pt,
        pt_k as f32,
        sgn_k as f32,
        omtf_pt,
        omtf_pt_k as f32,
        omtf_sgn_k as f32,
    ];

    Ok(Example { hits, pt_label, sign_label, extra, no_signal })
}
