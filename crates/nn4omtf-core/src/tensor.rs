//! バッチ配列
//!
//! 先頭次元をバッチとする行優先の f32 配列。
//! hits・ラベル・ロジットの受け渡しに使う。

/// 行優先の f32 配列 `[batch, ..]`
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BatchArray {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl BatchArray {
    /// 形状とデータから作成
    ///
    /// # Panics
    /// 要素数が形状と一致しない場合
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Self {
        assert_eq!(
            shape.iter().product::<usize>(),
            data.len(),
            "BatchArray: shape {shape:?} does not match {} elements",
            data.len()
        );
        Self { shape, data }
    }

    /// ゼロ初期化
    pub fn zeros(shape: Vec<usize>) -> Self {
        let n = shape.iter().product();
        Self { shape, data: vec![0.0; n] }
    }

    /// 行（1 サンプル）の列から作成。`row_shape` は 1 サンプルの形状
    pub fn from_rows<'a, I>(row_shape: &[usize], rows: I) -> Self
    where
        I: IntoIterator<Item = &'a [f32]>,
    {
        let width: usize = row_shape.iter().product();
        let mut data = Vec::new();
        let mut n = 0;
        for row in rows {
            debug_assert_eq!(row.len(), width);
            data.extend_from_slice(row);
            n += 1;
        }
        let mut shape = Vec::with_capacity(row_shape.len() + 1);
        shape.push(n);
        shape.extend_from_slice(row_shape);
        Self { shape, data }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// バッチサイズ（先頭次元）
    pub fn rows(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }

    /// 1 サンプルあたりの要素数
    pub fn row_len(&self) -> usize {
        self.shape.iter().skip(1).product()
    }

    pub fn row(&self, i: usize) -> &[f32] {
        let w = self.row_len();
        &self.data[i * w..(i + 1) * w]
    }

    pub fn row_mut(&mut self, i: usize) -> &mut [f32] {
        let w = self.row_len();
        &mut self.data[i * w..(i + 1) * w]
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn is_empty(&self) -> bool {
        self.rows() == 0
    }

    /// 各行の argmax
    pub fn argmax_rows(&self) -> Vec<usize> {
        (0..self.rows()).map(|i| argmax(self.row(i))).collect()
    }
}

/// 最大値のインデックス（同値は先頭を優先）
#[inline]
pub fn argmax(values: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate().skip(1) {
        if v > values[best] {
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_rows() {
        let a = [1.0, 2.0];
        let b = [3.0, 4.0];
        let arr = BatchArray::from_rows(&[2], [&a[..], &b[..]]);
        assert_eq!(arr.shape(), &[2, 2]);
        assert_eq!(arr.row(1), &[3.0, 4.0]);
        assert_eq!(arr.row_len(), 2);
    }

    #[test]
    fn test_argmax_rows() {
        let arr = BatchArray::new(vec![3, 3], vec![0.1, 0.7, 0.2, 5.0, 1.0, 1.0, 2.0, 2.0, 2.0]);
        assert_eq!(arr.argmax_rows(), vec![1, 0, 0]);
    }

    #[test]
    fn test_empty() {
        let arr = BatchArray::from_rows(&[18, 2], std::iter::empty());
        assert!(arr.is_empty());
        assert_eq!(arr.shape(), &[0, 18, 2]);
    }
}
