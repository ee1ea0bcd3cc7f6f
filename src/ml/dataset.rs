//! 学習データ（`.npy` 配列）の読み込みと分割
//!
//! 顔画像の切り出しは別工程で済んでおり、ここでは2つの配列だけを扱います。
//!
//! - `X_data.npy`: `[N, 48, 48]` / `[N, 48, 48, 1]` / `[N, 1, 48, 48]` の画像配列
//!   (`f32`, `f64`, `u8`)
//! - `y_data.npy`: `[N]` または `[N, 1]` の整数ラベル

use std::path::{Path, PathBuf};
use std::sync::Arc;

use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    tensor::{backend::Backend, Int, Tensor},
};
use ndarray::ArrayD;
use ndarray_npy::{ReadNpyError, ReadNpyExt, ReadableElement};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use thiserror::Error;
use tracing::{debug, info};

/// `u8` 画素値を [0, 1] に揃える係数
pub const U8_PIXEL_SCALE: f32 = 1.0 / 255.0;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Npy {
        path: PathBuf,
        #[source]
        source: ReadNpyError,
    },

    #[error("{path}: unsupported element type (expected one of {expected})")]
    UnsupportedDtype { path: PathBuf, expected: &'static str },

    #[error("unsupported image array shape {shape:?} (expected [N, H, W], [N, H, W, 1] or [N, 1, H, W])")]
    UnsupportedImageShape { shape: Vec<usize> },

    #[error("unsupported label array shape {shape:?} (expected [N] or [N, 1])")]
    UnsupportedLabelShape { shape: Vec<usize> },

    #[error("images must be square, got {height}x{width}")]
    NotSquare { height: usize, width: usize },

    #[error("image size {actual}x{actual} does not match the model input size {expected}x{expected}")]
    ImageSizeMismatch { expected: usize, actual: usize },

    #[error("{images} samples but {labels} labels")]
    CountMismatch { images: usize, labels: usize },

    #[error("dataset is empty")]
    Empty,

    #[error("label {label} at index {index} is outside 0..{num_classes}")]
    LabelOutOfRange { index: usize, label: i64, num_classes: usize },

    #[error("label {value} at index {index} is not a non-negative integer")]
    InvalidLabel { index: usize, value: f64 },

    #[error("split of {total} samples with test ratio {test_ratio} leaves an empty partition")]
    EmptyPartition { total: usize, test_ratio: f64 },
}

pub type DatasetResult<T> = Result<T, DatasetError>;

/// メモリ上に読み込んだ画像とラベル
#[derive(Debug, Clone)]
pub struct FaceArrays {
    /// 画素値 `N * size * size`（行優先）
    pixels: Vec<f32>,
    labels: Vec<usize>,
    image_size: usize,
    /// 元の画素値 (0〜255) に掛けると学習データと同じ値域になる係数
    pixel_scale: f32,
}

impl FaceArrays {
    /// 検証済みの配列から作成
    pub fn new(
        pixels: Vec<f32>,
        labels: Vec<usize>,
        image_size: usize,
        pixel_scale: f32,
    ) -> DatasetResult<Self> {
        let per_sample = image_size * image_size;
        let images = if per_sample == 0 { 0 } else { pixels.len() / per_sample };
        if per_sample == 0 || pixels.len() % per_sample != 0 || images != labels.len() {
            return Err(DatasetError::CountMismatch { images, labels: labels.len() });
        }
        if labels.is_empty() {
            return Err(DatasetError::Empty);
        }
        Ok(Self { pixels, labels, image_size, pixel_scale })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn image_size(&self) -> usize {
        self.image_size
    }

    pub fn pixel_scale(&self) -> f32 {
        self.pixel_scale
    }

    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    /// サンプル `index` の画素
    pub fn sample(&self, index: usize) -> Option<&[f32]> {
        let per_sample = self.image_size * self.image_size;
        let start = index.checked_mul(per_sample)?;
        self.pixels.get(start..start + per_sample)
    }

    /// クラスごとのサンプル数
    pub fn class_counts(&self, num_classes: usize) -> Vec<usize> {
        let mut counts = vec![0; num_classes];
        for &label in &self.labels {
            if let Some(count) = counts.get_mut(label) {
                *count += 1;
            }
        }
        counts
    }

    /// シャッフルしてから学習用とテスト用に分割
    ///
    /// テスト側は `ceil(N * test_ratio)` 件、残りが学習側になります。
    pub fn split(self, test_ratio: f64, seed: u64) -> DatasetResult<(FaceDataset, FaceDataset)> {
        let total = self.len();
        let test_len = (total as f64 * test_ratio).ceil() as usize;
        if test_len == 0 || test_len >= total {
            return Err(DatasetError::EmptyPartition { total, test_ratio });
        }

        let mut indices: Vec<usize> = (0..total).collect();
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        indices.shuffle(&mut rng);

        let train_indices = indices.split_off(test_len);
        let test_indices = indices;

        let store = Arc::new(self);
        Ok((
            FaceDataset { store: store.clone(), indices: train_indices },
            FaceDataset { store, indices: test_indices },
        ))
    }

    /// 分割せずに全件をデータセット化
    pub fn into_dataset(self) -> FaceDataset {
        let indices = (0..self.len()).collect();
        FaceDataset { store: Arc::new(self), indices }
    }
}

/// 画像配列とラベル配列を読み込む
pub fn load_arrays(
    images_path: &Path,
    labels_path: &Path,
    image_size: usize,
    num_classes: usize,
) -> DatasetResult<FaceArrays> {
    let (pixels, pixel_scale) = load_images(images_path, image_size)?;
    let labels = load_labels(labels_path, num_classes)?;

    let per_sample = image_size * image_size;
    let images = pixels.len().checked_div(per_sample).unwrap_or(0);
    if images != labels.len() {
        return Err(DatasetError::CountMismatch { images, labels: labels.len() });
    }

    info!(
        "{} から {} 件の画像 ({}x{}) を読み込みました",
        images_path.display(),
        images,
        image_size,
        image_size
    );
    FaceArrays::new(pixels, labels, image_size, pixel_scale)
}

fn read_bytes(path: &Path) -> DatasetResult<Vec<u8>> {
    std::fs::read(path).map_err(|source| DatasetError::Io { path: path.to_path_buf(), source })
}

/// 要素型を順に試して読む。型が一致しない場合だけ次の候補に進む
fn try_read<T: ReadableElement>(path: &Path, bytes: &[u8]) -> DatasetResult<Option<ArrayD<T>>> {
    match ArrayD::<T>::read_npy(bytes) {
        Ok(array) => Ok(Some(array)),
        Err(ReadNpyError::WrongDescriptor(_)) => Ok(None),
        Err(source) => Err(DatasetError::Npy { path: path.to_path_buf(), source }),
    }
}

fn load_images(path: &Path, image_size: usize) -> DatasetResult<(Vec<f32>, f32)> {
    let bytes = read_bytes(path)?;

    if let Some(array) = try_read::<u8>(path, &bytes)? {
        debug!("{}: u8 画像配列", path.display());
        flatten_images(array.shape(), image_size)?;
        let values = array.iter().map(|&v| v as f32 * U8_PIXEL_SCALE).collect();
        return Ok((values, U8_PIXEL_SCALE));
    }

    let array = if let Some(array) = try_read::<f32>(path, &bytes)? {
        array
    } else if let Some(array) = try_read::<f64>(path, &bytes)? {
        array.mapv(|v| v as f32)
    } else {
        return Err(DatasetError::UnsupportedDtype {
            path: path.to_path_buf(),
            expected: "uint8, float32, float64",
        });
    };

    flatten_images(array.shape(), image_size)?;
    let values: Vec<f32> = array.iter().copied().collect();

    // 0〜1 に正規化済みなら推論時も 1/255 を掛ける
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let pixel_scale = if max <= 1.0 { U8_PIXEL_SCALE } else { 1.0 };
    debug!("{}: float 画像配列 (max = {}, pixel_scale = {})", path.display(), max, pixel_scale);

    Ok((values, pixel_scale))
}

/// 画像配列の形状を検証してサンプル数を返す
///
/// 1チャネルなので channels-last / channels-first のどちらでも
/// 行優先で並べた値は `[N, H, W]` と同じ順になる。
fn flatten_images(shape: &[usize], image_size: usize) -> DatasetResult<usize> {
    let (n, height, width) = match *shape {
        [n, h, w] => (n, h, w),
        [n, h, w, 1] => (n, h, w),
        [n, 1, h, w] => (n, h, w),
        _ => return Err(DatasetError::UnsupportedImageShape { shape: shape.to_vec() }),
    };

    if height != width {
        return Err(DatasetError::NotSquare { height, width });
    }
    if height != image_size {
        return Err(DatasetError::ImageSizeMismatch { expected: image_size, actual: height });
    }
    if n == 0 {
        return Err(DatasetError::Empty);
    }
    Ok(n)
}

fn label_shape_ok(shape: &[usize]) -> DatasetResult<()> {
    match *shape {
        [_] | [_, 1] => Ok(()),
        _ => Err(DatasetError::UnsupportedLabelShape { shape: shape.to_vec() }),
    }
}

fn check_label(index: usize, label: i64, num_classes: usize) -> DatasetResult<usize> {
    if label < 0 || label as usize >= num_classes {
        return Err(DatasetError::LabelOutOfRange { index, label, num_classes });
    }
    Ok(label as usize)
}

fn integral_labels<T: Copy + Into<i64>>(array: &ArrayD<T>, num_classes: usize) -> DatasetResult<Vec<usize>> {
    label_shape_ok(array.shape())?;
    array
        .iter()
        .enumerate()
        .map(|(index, &v)| check_label(index, v.into(), num_classes))
        .collect()
}

fn float_labels(array: &ArrayD<f64>, num_classes: usize) -> DatasetResult<Vec<usize>> {
    label_shape_ok(array.shape())?;
    array
        .iter()
        .enumerate()
        .map(|(index, &value)| {
            if value.fract() != 0.0 || !value.is_finite() {
                return Err(DatasetError::InvalidLabel { index, value });
            }
            check_label(index, value as i64, num_classes)
        })
        .collect()
}

fn load_labels(path: &Path, num_classes: usize) -> DatasetResult<Vec<usize>> {
    let bytes = read_bytes(path)?;

    if let Some(array) = try_read::<i64>(path, &bytes)? {
        return integral_labels(&array, num_classes);
    }
    if let Some(array) = try_read::<i32>(path, &bytes)? {
        return integral_labels(&array, num_classes);
    }
    if let Some(array) = try_read::<u8>(path, &bytes)? {
        return integral_labels(&array, num_classes);
    }
    if let Some(array) = try_read::<f32>(path, &bytes)? {
        return float_labels(&array.mapv(f64::from), num_classes);
    }
    if let Some(array) = try_read::<f64>(path, &bytes)? {
        return float_labels(&array, num_classes);
    }

    Err(DatasetError::UnsupportedDtype {
        path: path.to_path_buf(),
        expected: "int64, int32, uint8, float32, float64",
    })
}

/// 分割後のデータセット（インデックスのみ保持）
#[derive(Debug, Clone)]
pub struct FaceDataset {
    store: Arc<FaceArrays>,
    indices: Vec<usize>,
}

impl FaceDataset {
    pub fn image_size(&self) -> usize {
        self.store.image_size()
    }

    pub fn pixel_scale(&self) -> f32 {
        self.store.pixel_scale()
    }
}

/// データセットアイテム
#[derive(Clone, Debug)]
pub struct FaceItem {
    pub pixels: Vec<f32>,
    pub label: usize,
}

impl Dataset<FaceItem> for FaceDataset {
    fn get(&self, index: usize) -> Option<FaceItem> {
        let actual_index = *self.indices.get(index)?;
        let pixels = self.store.sample(actual_index)?.to_vec();
        let label = *self.store.labels.get(actual_index)?;
        Some(FaceItem { pixels, label })
    }

    fn len(&self) -> usize {
        self.indices.len()
    }
}

/// バッチャー
#[derive(Clone, Debug)]
pub struct FaceBatcher<B: Backend> {
    device: B::Device,
    image_size: usize,
}

impl<B: Backend> FaceBatcher<B> {
    pub fn new(device: B::Device, image_size: usize) -> Self {
        Self { device, image_size }
    }
}

/// バッチデータ
#[derive(Clone, Debug)]
pub struct FaceBatch<B: Backend> {
    /// `[batch, 1, size, size]`
    pub images: Tensor<B, 4>,
    /// `[batch]`
    pub targets: Tensor<B, 1, Int>,
}

impl<B: Backend> Batcher<B, FaceItem, FaceBatch<B>> for FaceBatcher<B> {
    fn batch(&self, items: Vec<FaceItem>, _device: &B::Device) -> FaceBatch<B> {
        let batch_size = items.len();
        let size = self.image_size;

        let mut all_pixels = Vec::with_capacity(batch_size * size * size);
        let mut targets = Vec::with_capacity(batch_size);
        for item in items {
            all_pixels.extend_from_slice(&item.pixels);
            targets.push(item.label as i64);
        }

        // 1回の転送でバッチ全体をデバイスへ
        let images = Tensor::<B, 1>::from_floats(all_pixels.as_slice(), &self.device)
            .reshape([batch_size, 1, size, size]);
        let targets = Tensor::<B, 1, Int>::from_ints(targets.as_slice(), &self.device);

        FaceBatch { images, targets }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::{NdArray, NdArrayDevice};
    use ndarray::{Array1, Array2, Array4, ArrayD, IxDyn};
    use ndarray_npy::WriteNpyExt;
    use std::fs::File;

    type TestBackend = NdArray<f32>;

    fn write_npy<T: ndarray_npy::WritableElement, D: ndarray::Dimension>(
        path: &Path,
        array: &ndarray::Array<T, D>,
    ) {
        array.write_npy(File::create(path).unwrap()).unwrap();
    }

    fn sample_arrays(n: usize) -> FaceArrays {
        let pixels = (0..n * 16).map(|v| v as f32).collect();
        let labels = (0..n).map(|i| i % 2).collect();
        FaceArrays::new(pixels, labels, 4, 1.0).unwrap()
    }

    #[test]
    fn test_load_channels_last_f32() {
        let dir = tempfile::tempdir().unwrap();
        let x_path = dir.path().join("X_data.npy");
        let y_path = dir.path().join("y_data.npy");

        let images = Array4::<f32>::from_shape_fn((3, 4, 4, 1), |(n, y, x, _)| {
            (n * 100 + y * 4 + x) as f32 / 1000.0
        });
        write_npy(&x_path, &images);
        write_npy(&y_path, &Array1::<i64>::from(vec![0, 1, 1]));

        let arrays = load_arrays(&x_path, &y_path, 4, 2).unwrap();
        assert_eq!(arrays.len(), 3);
        assert_eq!(arrays.labels(), &[0, 1, 1]);
        assert_eq!(arrays.pixel_scale(), U8_PIXEL_SCALE);
        let second = arrays.sample(1).unwrap();
        assert_eq!(second.len(), 16);
        assert!((second[5] - 0.105).abs() < 1e-6);
        assert_eq!(arrays.class_counts(2), vec![1, 2]);
    }

    #[test]
    fn test_load_u8_is_rescaled() {
        let dir = tempfile::tempdir().unwrap();
        let x_path = dir.path().join("X_data.npy");
        let y_path = dir.path().join("y_data.npy");

        let images = ArrayD::<u8>::from_elem(IxDyn(&[2, 4, 4]), 255);
        write_npy(&x_path, &images);
        write_npy(&y_path, &Array1::<i32>::from(vec![1, 0]));

        let arrays = load_arrays(&x_path, &y_path, 4, 2).unwrap();
        assert!(arrays.sample(0).unwrap().iter().all(|&v| (v - 1.0).abs() < 1e-6));
        assert_eq!(arrays.labels(), &[1, 0]);
    }

    #[test]
    fn test_raw_float_pixels_keep_unit_scale() {
        let dir = tempfile::tempdir().unwrap();
        let x_path = dir.path().join("X_data.npy");
        let y_path = dir.path().join("y_data.npy");

        let images = ArrayD::<f64>::from_elem(IxDyn(&[1, 1, 4, 4]), 200.0);
        write_npy(&x_path, &images);
        write_npy(&y_path, &Array2::<f64>::from_elem((1, 1), 1.0));

        let arrays = load_arrays(&x_path, &y_path, 4, 2).unwrap();
        assert_eq!(arrays.pixel_scale(), 1.0);
        assert_eq!(arrays.sample(0).unwrap()[0], 200.0);
        assert_eq!(arrays.labels(), &[1]);
    }

    #[test]
    fn test_count_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let x_path = dir.path().join("X_data.npy");
        let y_path = dir.path().join("y_data.npy");

        write_npy(&x_path, &ArrayD::<f32>::zeros(IxDyn(&[3, 4, 4])));
        write_npy(&y_path, &Array1::<i64>::from(vec![0, 1]));

        let err = load_arrays(&x_path, &y_path, 4, 2).unwrap_err();
        assert!(matches!(err, DatasetError::CountMismatch { images: 3, labels: 2 }));
    }

    #[test]
    fn test_wrong_image_size() {
        let dir = tempfile::tempdir().unwrap();
        let x_path = dir.path().join("X_data.npy");
        let y_path = dir.path().join("y_data.npy");

        write_npy(&x_path, &ArrayD::<f32>::zeros(IxDyn(&[2, 5, 5, 1])));
        write_npy(&y_path, &Array1::<i64>::from(vec![0, 1]));

        let err = load_arrays(&x_path, &y_path, 4, 2).unwrap_err();
        assert!(matches!(err, DatasetError::ImageSizeMismatch { expected: 4, actual: 5 }));
    }

    #[test]
    fn test_image_shape_checks() {
        assert!(matches!(
            flatten_images(&[2, 4, 6], 4),
            Err(DatasetError::NotSquare { height: 4, width: 6 })
        ));
        assert!(matches!(
            flatten_images(&[2, 4, 4, 3], 4),
            Err(DatasetError::UnsupportedImageShape { .. })
        ));
        assert_eq!(flatten_images(&[7, 1, 4, 4], 4).unwrap(), 7);
    }

    #[test]
    fn test_label_out_of_range() {
        let dir = tempfile::tempdir().unwrap();
        let y_path = dir.path().join("y_data.npy");
        write_npy(&y_path, &Array1::<i64>::from(vec![0, 2]));

        let err = load_labels(&y_path, 2).unwrap_err();
        assert!(matches!(err, DatasetError::LabelOutOfRange { index: 1, label: 2, .. }));
    }

    #[test]
    fn test_fractional_label_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let y_path = dir.path().join("y_data.npy");
        write_npy(&y_path, &Array1::<f32>::from(vec![0.0, 0.5]));

        assert!(matches!(
            load_labels(&y_path, 2),
            Err(DatasetError::InvalidLabel { index: 1, .. })
        ));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_labels(&dir.path().join("absent.npy"), 2).unwrap_err();
        assert!(matches!(err, DatasetError::Io { .. }));
    }

    #[test]
    fn test_split_sizes_and_determinism() {
        let (train, test) = sample_arrays(10).split(0.2, 42).unwrap();
        assert_eq!(train.len(), 8);
        assert_eq!(test.len(), 2);

        let (train2, test2) = sample_arrays(10).split(0.2, 42).unwrap();
        assert_eq!(train.indices, train2.indices);
        assert_eq!(test.indices, test2.indices);

        // 分割は重複も欠落もしない
        let mut all: Vec<usize> = train.indices.iter().chain(&test.indices).copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_split_exact_multiples_of_five() {
        for (n, expected) in [(5, 1), (20, 4), (40, 8), (100, 20), (1000, 200)] {
            let (train, test) = sample_arrays(n).split(0.2, 42).unwrap();
            assert_eq!(test.len(), expected, "N={}", n);
            assert_eq!(train.len(), n - expected, "N={}", n);
        }
    }

    #[test]
    fn test_split_rounds_test_partition_up() {
        let (train, test) = sample_arrays(11).split(0.2, 42).unwrap();
        assert_eq!(test.len(), 3);
        assert_eq!(train.len(), 8);
    }

    #[test]
    fn test_split_rejects_empty_partition() {
        let err = sample_arrays(1).split(0.2, 42).unwrap_err();
        assert!(matches!(err, DatasetError::EmptyPartition { total: 1, .. }));
    }

    #[test]
    fn test_dataset_get_maps_through_indices() {
        let dataset = sample_arrays(3).into_dataset();
        let item = dataset.get(2).unwrap();
        assert_eq!(item.label, 0);
        assert_eq!(item.pixels[0], 32.0);
        assert!(dataset.get(3).is_none());
    }

    #[test]
    fn test_batcher_shapes() {
        let device = NdArrayDevice::Cpu;
        let dataset = sample_arrays(3).into_dataset();
        let items: Vec<FaceItem> = (0..3).filter_map(|i| dataset.get(i)).collect();

        let batcher = FaceBatcher::<TestBackend>::new(device, 4);
        let batch = batcher.batch(items, &device);
        assert_eq!(batch.images.dims(), [3, 1, 4, 4]);
        assert_eq!(batch.targets.dims(), [3]);
    }
}
