//! オプティマイザ

/// パラメータと勾配の組
pub type ParamGroup<'a> = (&'a mut [f32], &'a [f32]);

/// Adam オプティマイザ
///
/// パラメータ群ごとにモーメントを持つ。群の並びは毎回同じでなければならない。
pub struct Adam {
    /// β1（一次モーメントの減衰率）
    pub beta1: f32,
    /// β2（二次モーメントの減衰率）
    pub beta2: f32,
    /// 数値安定性のための小さな値
    pub epsilon: f32,
    /// 重み減衰
    pub weight_decay: f32,

    /// ステップ数
    t: usize,
    /// 群ごとの (一次, 二次) モーメント
    moments: Vec<(Vec<f32>, Vec<f32>)>,
}

impl Adam {
    /// 各パラメータ群の要素数から作成
    pub fn new(group_sizes: &[usize]) -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
            t: 0,
            moments: group_sizes.iter().map(|&n| (vec![0.0; n], vec![0.0; n])).collect(),
        }
    }

    pub fn with_weight_decay(mut self, wd: f32) -> Self {
        self.weight_decay = wd;
        self
    }

    /// 実行済みステップ数
    pub fn steps(&self) -> usize {
        self.t
    }

    /// 1 ステップ更新
    pub fn step(&mut self, lr: f32, groups: &mut [ParamGroup<'_>]) {
        debug_assert_eq!(groups.len(), self.moments.len());
        self.t += 1;

        // バイアス補正付き学習率
        let lr_t = lr * (1.0 - self.beta2.powi(self.t as i32)).sqrt()
            / (1.0 - self.beta1.powi(self.t as i32));

        for ((params, grads), (m, v)) in groups.iter_mut().zip(self.moments.iter_mut()) {
            adam_update_params(
                params,
                grads,
                m,
                v,
                self.beta1,
                self.beta2,
                self.epsilon,
                self.weight_decay,
                lr_t,
            );
        }
    }
}

/// Adam の更新式
#[allow(clippy::too_many_arguments)]
fn adam_update_params(
    params: &mut [f32],
    grads: &[f32],
    m: &mut [f32],
    v: &mut [f32],
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    weight_decay: f32,
    lr_t: f32,
) {
    for i in 0..params.len() {
        let g = grads[i] + weight_decay * params[i];

        m[i] = beta1 * m[i] + (1.0 - beta1) * g;
        v[i] = beta2 * v[i] + (1.0 - beta2) * g * g;

        params[i] -= lr_t * m[i] / (v[i].sqrt() + epsilon);
    }
}
