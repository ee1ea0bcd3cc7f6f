//! モデル推論機能

use anyhow::{anyhow, Context, Result};
use std::path::Path;

use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{backend::Backend, Tensor},
};
use image::imageops::FilterType;

use crate::ml::{EngagementClassifier, ModelConfig};
use crate::model::{load_model_with_metadata, ModelMetadata};

/// 1枚分の分類結果
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub class_index: usize,
    pub label: String,
    /// クラスごとの確率（メタデータのラベル順）
    pub probabilities: Vec<f32>,
}

/// 推論エンジン
pub struct InferenceEngine<B: Backend> {
    model: EngagementClassifier<B>,
    metadata: ModelMetadata,
    device: B::Device,
}

impl<B: Backend> InferenceEngine<B> {
    /// モデルを読み込んで推論エンジンを初期化
    pub fn load<P: AsRef<Path>>(model_path: P, device: B::Device) -> Result<Self> {
        let (metadata, model_binary) = load_model_with_metadata(model_path.as_ref())?;
        let model = load_classifier::<B>(&metadata, model_binary, &device)?;
        Ok(Self { model, metadata, device })
    }

    pub fn from_parts(model: EngagementClassifier<B>, metadata: ModelMetadata, device: B::Device) -> Self {
        Self { model, metadata, device }
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    /// 単一画像ファイルを分類
    ///
    /// グレースケール化し、入力サイズと異なる場合はリサイズします。
    pub fn classify_image<P: AsRef<Path>>(&self, image_path: P) -> Result<Prediction> {
        let pixels = load_grayscale_image(
            image_path.as_ref(),
            self.metadata.image_size,
            self.metadata.pixel_scale,
        )?;
        self.classify_pixels(&pixels)
    }

    /// 前処理済みの画素 (`size * size`) を分類
    pub fn classify_pixels(&self, pixels: &[f32]) -> Result<Prediction> {
        let size = self.metadata.image_size as usize;
        if pixels.len() != size * size {
            anyhow::bail!("expected {} pixels, got {}", size * size, pixels.len());
        }

        let tensor = Tensor::<B, 1>::from_floats(pixels, &self.device).reshape([1, 1, size, size]);
        let probabilities = self
            .model
            .predict_proba(tensor)
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| anyhow!("推論結果の取得エラー: {:?}", e))?;

        let class_index = probabilities
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .ok_or_else(|| anyhow!("推論結果が空です"))?;

        let label = self
            .metadata
            .class_labels
            .get(class_index)
            .cloned()
            .ok_or_else(|| anyhow!("クラスインデックス {} は範囲外です", class_index))?;

        Ok(Prediction { class_index, label, probabilities })
    }

    /// 複数画像をバッチ分類
    pub fn classify_batch(&self, image_paths: &[impl AsRef<Path>]) -> Result<Vec<Prediction>> {
        image_paths.iter().map(|path| self.classify_image(path)).collect()
    }
}

/// メタデータに合わせてモデルを初期化し、重みを復元
pub fn load_classifier<B: Backend>(
    metadata: &ModelMetadata,
    model_binary: Vec<u8>,
    device: &B::Device,
) -> Result<EngagementClassifier<B>> {
    let model = ModelConfig::new()
        .with_num_classes(metadata.num_classes())
        .with_image_size(metadata.image_size as usize)
        .init::<B>(device)?;

    let record = BinBytesRecorder::<FullPrecisionSettings>::default()
        .load(model_binary, device)
        .map_err(|e| anyhow!("モデル重みの読み込みエラー: {:?}", e))?;

    Ok(model.load_record(record))
}

/// 画像を読み込んでグレースケール化・正規化
pub fn load_grayscale_image(path: &Path, size: u32, pixel_scale: f32) -> Result<Vec<f32>> {
    let img = image::open(path)
        .with_context(|| format!("画像を開けません: {}", path.display()))?
        .to_luma8();

    let img = if img.dimensions() == (size, size) {
        img
    } else {
        image::imageops::resize(&img, size, size, FilterType::Triangle)
    };

    Ok(img.pixels().map(|p| p[0] as f32 * pixel_scale).collect())
}
