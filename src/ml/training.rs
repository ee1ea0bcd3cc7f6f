//! モデル学習と評価

use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use tempfile::TempDir;
use tracing::{info, warn};

use burn::{
    data::{
        dataloader::{batcher::Batcher, DataLoaderBuilder},
        dataset::Dataset,
    },
    module::Module,
    optim::AdamConfig,
    record::{BinBytesRecorder, FullPrecisionSettings, Recorder},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion,
    },
    train::{
        metric::{AccuracyMetric, LossMetric},
        ClassificationOutput, LearnerBuilder, LearningStrategy, TrainOutput, TrainStep, ValidStep,
    },
};

use crate::ml::dataset::{load_arrays, FaceBatch, FaceBatcher, FaceDataset, FaceItem};
use crate::ml::{EngagementClassifier, ModelConfig};
use crate::model::{save_model_with_metadata, AppConfig, ModelMetadata};

/// Keras の Adam と同じ epsilon
const ADAM_EPSILON: f32 = 1e-7;

/// TrainStep実装 (学習時の順伝播 + 逆伝播)
impl<B: AutodiffBackend> TrainStep<FaceBatch<B>, ClassificationOutput<B>> for EngagementClassifier<B> {
    fn step(&self, batch: FaceBatch<B>) -> TrainOutput<ClassificationOutput<B>> {
        let item = self.forward_classification(batch.images, batch.targets);
        let grads = item.loss.backward();
        TrainOutput::new(self, grads, item)
    }
}

/// ValidStep実装 (検証時の順伝播のみ)
impl<B: Backend> ValidStep<FaceBatch<B>, ClassificationOutput<B>> for EngagementClassifier<B> {
    fn step(&self, batch: FaceBatch<B>) -> ClassificationOutput<B> {
        self.forward_classification(batch.images, batch.targets)
    }
}

/// 評価結果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    /// サンプル平均の交差エントロピー
    pub loss: f64,
    /// 正解率 (0.0〜1.0)
    pub accuracy: f64,
    pub num_samples: usize,
}

/// 学習結果
#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub model_path: PathBuf,
    pub metadata: ModelMetadata,
    pub evaluation: Evaluation,
}

/// データセット全体で損失と正解率を計算
pub fn evaluate<B: Backend>(
    model: &EngagementClassifier<B>,
    dataset: &FaceDataset,
    batch_size: usize,
    device: &B::Device,
) -> Result<Evaluation> {
    if dataset.is_empty() {
        anyhow::bail!("評価データが空です");
    }
    if batch_size == 0 {
        anyhow::bail!("batch_size must be greater than 0");
    }

    let batcher = FaceBatcher::<B>::new(device.clone(), dataset.image_size());
    let indices: Vec<usize> = (0..dataset.len()).collect();

    let mut total_loss = 0.0;
    let mut correct = 0usize;
    let mut seen = 0usize;

    for chunk in indices.chunks(batch_size) {
        let items: Vec<FaceItem> = chunk.iter().filter_map(|&i| dataset.get(i)).collect();
        let n = items.len();
        if n == 0 {
            continue;
        }

        let batch = batcher.batch(items, device);
        let output = model.forward_classification(batch.images, batch.targets);

        let loss = output.loss.into_scalar().elem::<f64>();
        total_loss += loss * n as f64;

        let predicted = output.output.argmax(1).reshape([n]);
        let hits = predicted
            .equal(output.targets)
            .int()
            .sum()
            .into_scalar()
            .elem::<i64>();
        correct += hits as usize;
        seen += n;
    }

    Ok(Evaluation {
        loss: total_loss / seen as f64,
        accuracy: correct as f64 / seen as f64,
        num_samples: seen,
    })
}

/// モデルの重みを BinBytesRecorder (f32) でバイト列にする
pub fn model_to_bytes<B: Backend>(model: &EngagementClassifier<B>) -> Result<Vec<u8>> {
    // CompactRecorder は f16 で保存してしまうので FullPrecisionSettings を使う
    BinBytesRecorder::<FullPrecisionSettings>::default()
        .record(model.clone().into_record(), ())
        .map_err(|e| anyhow!("モデル重みのシリアライズエラー: {:?}", e))
}

/// モデル学習を実行
///
/// 配列の読み込み、80/20 分割、学習、テストデータでの評価、
/// `config.paths.model` への保存までを一度に行います。
pub fn train_model<B: AutodiffBackend>(config: &AppConfig, device: B::Device) -> Result<TrainingReport> {
    config.validate()?;
    let settings = &config.training;
    let model_settings = &config.model;

    let arrays = load_arrays(
        &config.paths.images,
        &config.paths.labels,
        model_settings.image_size,
        model_settings.num_classes,
    )
    .context("学習データの読み込みに失敗しました")?;

    for (class_id, count) in arrays.class_counts(model_settings.num_classes).iter().enumerate() {
        let name = model_settings.class_labels.get(class_id).map(String::as_str).unwrap_or("?");
        info!("  クラス {} ({}): {} 件", class_id, name, count);
        if *count == 0 {
            warn!("クラス {} ({}) のサンプルがありません", class_id, name);
        }
    }

    let (dataset_train, dataset_test) = arrays
        .split(settings.test_ratio, settings.seed)
        .context("学習/テストデータの分割に失敗しました")?;
    let num_train = dataset_train.len();
    let num_test = dataset_test.len();
    let pixel_scale = dataset_train.pixel_scale();

    info!("学習データ: {} 件", num_train);
    info!("テストデータ: {} 件", num_test);

    let model_config = ModelConfig::new()
        .with_num_classes(model_settings.num_classes)
        .with_image_size(model_settings.image_size);
    let model = model_config.init::<B>(&device)?;
    info!(
        "モデル設定: {} クラス, 入力サイズ: {}x{}, パラメータ数: {}",
        model_config.num_classes,
        model_config.image_size,
        model_config.image_size,
        model.num_params()
    );

    let batcher_train = FaceBatcher::<B>::new(device.clone(), model_settings.image_size);
    let batcher_test = FaceBatcher::<B::InnerBackend>::new(device.clone(), model_settings.image_size);

    let dataloader_train = DataLoaderBuilder::new(batcher_train)
        .batch_size(settings.batch_size)
        .shuffle(settings.seed)
        .num_workers(settings.num_workers)
        .build(dataset_train);

    let dataloader_test = DataLoaderBuilder::new(batcher_test)
        .batch_size(settings.batch_size)
        .num_workers(settings.num_workers)
        .build(dataset_test.clone());

    // 学習中のメトリクス出力先 (drop 時に削除)
    let artifact_dir = create_artifact_dir()?;
    let artifact_dir_str = artifact_dir.path().to_string_lossy().to_string();

    info!(
        "学習を開始します (エポック数: {}, バッチサイズ: {}, 学習率: {})",
        settings.num_epochs, settings.batch_size, settings.learning_rate
    );

    let learner = LearnerBuilder::new(&artifact_dir_str)
        .metric_train_numeric(AccuracyMetric::new())
        .metric_valid_numeric(AccuracyMetric::new())
        .metric_train_numeric(LossMetric::new())
        .metric_valid_numeric(LossMetric::new())
        .learning_strategy(LearningStrategy::SingleDevice(device.clone()))
        .num_epochs(settings.num_epochs)
        .summary()
        .build(
            model,
            AdamConfig::new().with_epsilon(ADAM_EPSILON).init(),
            settings.learning_rate,
        );

    let model_valid = learner.fit(dataloader_train, dataloader_test).model;
    info!("学習が完了しました");

    let evaluation = evaluate(&model_valid, &dataset_test, settings.batch_size, &device)?;
    info!("Test loss: {:.4}", evaluation.loss);
    info!("Test accuracy: {}", evaluation.accuracy);

    let model_binary = model_to_bytes(&model_valid)?;
    let metadata = ModelMetadata::new(
        model_settings.class_labels.clone(),
        model_settings.image_size as u32,
        settings.num_epochs as u32,
        settings.batch_size as u32,
        settings.learning_rate,
        num_train as u32,
        num_test as u32,
        evaluation.accuracy,
        evaluation.loss,
        model_valid.num_params() as u64,
    )
    .with_pixel_scale(pixel_scale);

    save_model_with_metadata(&config.paths.model, &metadata, &model_binary)?;

    Ok(TrainingReport {
        model_path: config.paths.model.clone(),
        metadata,
        evaluation,
    })
}

/// 実行ごとに別の一時ディレクトリを作る
fn create_artifact_dir() -> Result<TempDir> {
    tempfile::Builder::new()
        .prefix("engagement_cnn_training")
        .tempdir()
        .context("Failed to create artifact directory")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::dataset::FaceArrays;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    fn tiny_dataset(n: usize) -> FaceDataset {
        let pixels = (0..n * 48 * 48).map(|i| (i % 7) as f32 / 7.0).collect();
        let labels = (0..n).map(|i| i % 2).collect();
        FaceArrays::new(pixels, labels, 48, 1.0 / 255.0)
            .unwrap()
            .into_dataset()
    }

    #[test]
    fn test_evaluate_covers_every_sample() {
        let device = NdArrayDevice::Cpu;
        let model = ModelConfig::new().init::<TestBackend>(&device).unwrap();
        let dataset = tiny_dataset(5);

        let evaluation = evaluate(&model, &dataset, 2, &device).unwrap();
        assert_eq!(evaluation.num_samples, 5);
        assert!((0.0..=1.0).contains(&evaluation.accuracy));
        assert!(evaluation.loss.is_finite() && evaluation.loss > 0.0);
    }

    #[test]
    fn test_evaluate_is_independent_of_batch_size() {
        let device = NdArrayDevice::Cpu;
        let model = ModelConfig::new().init::<TestBackend>(&device).unwrap();
        let dataset = tiny_dataset(6);

        let a = evaluate(&model, &dataset, 1, &device).unwrap();
        let b = evaluate(&model, &dataset, 4, &device).unwrap();
        assert_eq!(a.accuracy, b.accuracy);
        assert!((a.loss - b.loss).abs() < 1e-4);
    }

    #[test]
    fn test_evaluate_rejects_zero_batch() {
        let device = NdArrayDevice::Cpu;
        let model = ModelConfig::new().init::<TestBackend>(&device).unwrap();
        assert!(evaluate(&model, &tiny_dataset(2), 0, &device).is_err());
    }

    #[test]
    fn test_train_step_produces_gradients() {
        type AutodiffBackend = burn_autodiff::Autodiff<TestBackend>;
        let device = NdArrayDevice::Cpu;
        let model = ModelConfig::new().init::<AutodiffBackend>(&device).unwrap();

        let dataset = tiny_dataset(2);
        let items: Vec<FaceItem> = (0..2).filter_map(|i| dataset.get(i)).collect();
        let batch = FaceBatcher::<AutodiffBackend>::new(device, 48).batch(items, &device);

        let output = TrainStep::step(&model, batch);
        let loss = output.item.loss.into_scalar().elem::<f64>();
        assert!(loss.is_finite());
    }

    #[test]
    fn test_artifact_dirs_are_private_and_removed() {
        let a = create_artifact_dir().unwrap();
        let b = create_artifact_dir().unwrap();
        assert_ne!(a.path(), b.path());

        let path = a.path().to_path_buf();
        std::fs::write(path.join("log.txt"), "epoch 1").unwrap();
        drop(a);
        assert!(!path.exists());
        assert!(b.path().exists());
    }

    #[test]
    fn test_model_bytes_are_full_precision() {
        let model = ModelConfig::new()
            .init::<TestBackend>(&NdArrayDevice::Cpu)
            .unwrap();
        let bytes = model_to_bytes(&model).unwrap();
        // f32 で 318_082 個のパラメータ + ヘッダ類
        assert!(bytes.len() >= 318_082 * 4);
    }
}
