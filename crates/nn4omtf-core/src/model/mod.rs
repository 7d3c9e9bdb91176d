//! モデル
//!
//! ネットワーク本体は `Model` trait の向こう側にある。
//! Runner は hits を渡してロジットを受け取り、損失の勾配を返すだけ。
//!
//! # 構成
//! - `network`: 参照実装の 2 ヘッド線形 softmax 分類器
//! - `optimizer`: Adam

pub mod network;
pub mod optimizer;

pub use network::LinearClassifier;
pub use optimizer::Adam;

use crate::bucket::BucketEdges;
use crate::record::HitsVariant;
use crate::stats::{TestAccuracy, TestStatistics};
use crate::tensor::BatchArray;

/// 順伝播のモード
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardMode {
    /// 逆伝播用の中間値を保持する
    Train,
    Eval,
}

/// 2 つのヘッドのロジット
#[derive(Debug, Clone, PartialEq)]
pub struct Logits {
    /// `[n, pt classes]`
    pub pt: BatchArray,
    /// `[n, 2]`
    pub sgn: BatchArray,
}

/// ロジットに対する損失の勾配
#[derive(Debug, Clone, PartialEq)]
pub struct Gradients {
    pub pt: BatchArray,
    pub sgn: BatchArray,
}

/// 学習・テスト対象のモデル
pub trait Model {
    fn name(&self) -> &str;

    /// 入力に使う hits の種類
    fn hits_variant(&self) -> HitsVariant;

    /// pt の出力クラスに対応するエッジ
    fn pt_edges(&self) -> &BucketEdges;

    /// セッション開始時に状態を読み込む
    fn restore(&mut self, session_name: &str) -> anyhow::Result<()>;

    fn forward(&mut self, hits: &BatchArray, mode: ForwardMode) -> anyhow::Result<Logits>;

    /// 直前の `ForwardMode::Train` の順伝播に対して 1 ステップ更新する
    fn backward(&mut self, grads: &Gradients, learning_rate: f32) -> anyhow::Result<()>;

    fn save(&mut self) -> anyhow::Result<()>;

    /// 学習終了時の後処理
    fn finish(&mut self) -> anyhow::Result<()>;

    /// テスト結果を記録する
    fn record_test(
        &mut self,
        session_name: &str,
        accuracy: &TestAccuracy,
        stats: &TestStatistics,
    ) -> anyhow::Result<()>;
}
