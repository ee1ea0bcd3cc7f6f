//! 機械学習モデルの共通定義
//!
//! 顔画像（48x48・グレースケール）から関心の有無を判定するCNNモデルと
//! 関連する設定を提供します。

use anyhow::{anyhow, Result};
use burn::{
    config::Config,
    module::{Module, Param},
    nn::{
        conv::{Conv2d, Conv2dConfig},
        loss::CrossEntropyLossConfig,
        pool::{MaxPool2d, MaxPool2dConfig},
        Linear, LinearConfig, Relu,
    },
    tensor::{activation::softmax, backend::Backend, Int, Tensor},
    train::ClassificationOutput,
};
use tracing::debug;

/// クラス数
pub const NUM_CLASSES: usize = 2;

/// 画像サイズ
pub const IMAGE_SIZE: usize = 48;

/// 受け付ける最小の入力サイズ (Conv3 後に 2x2 が残る)
pub const MIN_IMAGE_SIZE: usize = 14;

/// 入力チャネル数（グレースケール）
pub const INPUT_CHANNELS: usize = 1;

/// 最終畳み込み層のチャネル数
pub const FEATURE_CHANNELS: usize = 64;

/// 全結合の隠れ層ユニット数
pub const HIDDEN_UNITS: usize = 64;

/// モデル設定
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// 分類クラス数
    #[config(default = 2)]
    pub num_classes: usize,
    /// 入力画像サイズ（正方形）
    #[config(default = 48)]
    pub image_size: usize,
}

impl ModelConfig {
    /// 最終畳み込み層の出力サイズ
    ///
    /// - Conv1 (3x3, no padding): size -> size - 2
    /// - Pool1 (2x2): 切り捨てで半分
    /// - Conv2 (3x3, no padding): -2
    /// - Pool2 (2x2): 切り捨てで半分
    /// - Conv3 (3x3, no padding): -2
    pub fn feature_map_size(&self) -> Option<usize> {
        let after_pool1 = self.image_size.checked_sub(2)? / 2;
        let after_pool2 = after_pool1.checked_sub(2)? / 2;
        after_pool2.checked_sub(2).filter(|&size| size > 0)
    }

    /// Flatten 後の特徴次元
    pub fn flattened_dim(&self) -> Option<usize> {
        self.feature_map_size()
            .map(|size| FEATURE_CHANNELS * size * size)
    }

    /// モデルを初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<EngagementClassifier<B>> {
        let feature_map_size = self.feature_map_size().ok_or_else(|| {
            anyhow!(
                "入力サイズが小さすぎます: {} (最小{}x{}が必要)",
                self.image_size,
                MIN_IMAGE_SIZE,
                MIN_IMAGE_SIZE
            )
        })?;
        if self.num_classes < 2 {
            anyhow::bail!("num_classes must be at least 2 (got {})", self.num_classes);
        }
        let d = FEATURE_CHANNELS * feature_map_size * feature_map_size;

        debug!("[Model] 入力: 1 x {}x{}", self.image_size, self.image_size);
        debug!("[Model] Conv3後: {} x {}x{}", FEATURE_CHANNELS, feature_map_size, feature_map_size);
        debug!("[Model] FC1: {} -> {}", d, HIDDEN_UNITS);
        debug!("[Model] FC2: {} -> {}", HIDDEN_UNITS, self.num_classes);

        Ok(EngagementClassifier {
            conv1: Conv2dConfig::new([INPUT_CHANNELS, 32], [3, 3])
                .with_stride([1, 1])
                .init(device),
            pool1: MaxPool2dConfig::new([2, 2]).init(),
            conv2: Conv2dConfig::new([32, 64], [3, 3])
                .with_stride([1, 1])
                .init(device),
            pool2: MaxPool2dConfig::new([2, 2]).init(),
            conv3: Conv2dConfig::new([64, FEATURE_CHANNELS], [3, 3])
                .with_stride([1, 1])
                .init(device),
            fc1: LinearConfig::new(d, HIDDEN_UNITS).init(device),
            fc2: LinearConfig::new(HIDDEN_UNITS, self.num_classes).init(device),
            activation: Relu::new(),
        })
    }
}

/// 関心度判定用CNNモデル
///
/// # アーキテクチャ
/// - Conv 3x3 (1 -> 32) + ReLU + MaxPool 2x2
/// - Conv 3x3 (32 -> 64) + ReLU + MaxPool 2x2
/// - Conv 3x3 (64 -> 64) + ReLU
/// - Flatten
/// - FC: d -> 64 + ReLU
/// - FC: 64 -> num_classes
/// - Softmax (推論時)
#[derive(Module, Debug)]
pub struct EngagementClassifier<B: Backend> {
    conv1: Conv2d<B>, // 1 -> 32
    pool1: MaxPool2d, // 2x2
    conv2: Conv2d<B>, // 32 -> 64
    pool2: MaxPool2d, // 2x2
    conv3: Conv2d<B>, // 64 -> 64

    fc1: Linear<B>, // d -> 64
    fc2: Linear<B>, // 64 -> num_classes

    activation: Relu,
}

impl<B: Backend> EngagementClassifier<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 1, size, size]
    ///
    /// # 戻り値
    /// - クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, _, _, _] = images.dims();

        let x = self.conv1.forward(images);
        let x = self.activation.forward(x);
        let x = self.pool1.forward(x);

        let x = self.conv2.forward(x);
        let x = self.activation.forward(x);
        let x = self.pool2.forward(x);

        let x = self.conv3.forward(x);
        let x = self.activation.forward(x);

        let [_, c, h, w] = x.dims();
        let x = x.reshape([batch_size, c * h * w]);

        let x = self.fc1.forward(x);
        let x = self.activation.forward(x);

        self.fc2.forward(x)
    }

    /// クラスごとの確率 [batch_size, num_classes]
    pub fn predict_proba(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }

    /// 予測を実行
    ///
    /// # 戻り値
    /// - (予測クラスID [batch_size, 1], ロジット)
    pub fn predict(&self, images: Tensor<B, 4>) -> (Tensor<B, 2, Int>, Tensor<B, 2>) {
        let output = self.forward(images);
        let predictions = output.clone().argmax(1);
        (predictions, output)
    }

    /// 順伝播と損失計算（学習用）
    pub fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let output = self.forward(images);
        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), targets.clone());

        ClassificationOutput::new(loss, output, targets)
    }

    /// 層ごとの重みを取り出す（Web変換用）
    ///
    /// 順序は順伝播の順。畳み込みの重みは `[out, in, kh, kw]`、
    /// 全結合の重みは `[in, out]` のまま返します。
    pub fn layer_params(&self) -> Result<Vec<LayerParams>> {
        let [d, _] = self.fc1.weight.val().dims();
        let size = ((d / FEATURE_CHANNELS) as f64).sqrt().round() as usize;
        if FEATURE_CHANNELS * size * size != d {
            anyhow::bail!("fc1 input {} is not {} x n x n", d, FEATURE_CHANNELS);
        }

        Ok(vec![
            LayerParams::conv("conv1", &self.conv1)?,
            LayerParams::conv("conv2", &self.conv2)?,
            LayerParams::conv("conv3", &self.conv3)?,
            LayerParams::dense("fc1", &self.fc1, Some([FEATURE_CHANNELS, size, size]))?,
            LayerParams::dense("fc2", &self.fc2, None)?,
        ])
    }
}

/// ホスト側に取り出したテンソル（行優先）
#[derive(Debug, Clone, PartialEq)]
pub struct RawTensor {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

impl RawTensor {
    pub fn new(shape: Vec<usize>, values: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != values.len() {
            anyhow::bail!("shape {:?} needs {} values, got {}", shape, expected, values.len());
        }
        Ok(Self { shape, values })
    }

    fn from_param<B: Backend, const D: usize>(param: &Param<Tensor<B, D>>) -> Result<Self> {
        let tensor = param.val();
        let shape = tensor.dims().to_vec();
        let values = tensor
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| anyhow!("重みの取得エラー: {:?}", e))?;
        Self::new(shape, values)
    }
}

/// 層の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    Conv2d,
    /// `flattened_from` は channels-first の [c, h, w]（Flatten 直後の層のみ）
    Dense { flattened_from: Option<[usize; 3]> },
}

/// 1層分の重みとバイアス
#[derive(Debug, Clone)]
pub struct LayerParams {
    pub name: &'static str,
    pub kind: LayerKind,
    pub weight: RawTensor,
    pub bias: RawTensor,
}

impl LayerParams {
    fn conv<B: Backend>(name: &'static str, conv: &Conv2d<B>) -> Result<Self> {
        let bias = conv
            .bias
            .as_ref()
            .ok_or_else(|| anyhow!("{} にバイアスがありません", name))?;
        Ok(Self {
            name,
            kind: LayerKind::Conv2d,
            weight: RawTensor::from_param(&conv.weight)?,
            bias: RawTensor::from_param(bias)?,
        })
    }

    fn dense<B: Backend>(
        name: &'static str,
        linear: &Linear<B>,
        flattened_from: Option<[usize; 3]>,
    ) -> Result<Self> {
        let bias = linear
            .bias
            .as_ref()
            .ok_or_else(|| anyhow!("{} にバイアスがありません", name))?;
        Ok(Self {
            name,
            kind: LayerKind::Dense { flattened_from },
            weight: RawTensor::from_param(&linear.weight)?,
            bias: RawTensor::from_param(bias)?,
        })
    }
}
