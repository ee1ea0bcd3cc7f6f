//! 学習済みモデルのWeb向け変換
//!
//! `model.tar.gz` を読み込み、ブラウザ側の推論ランタイム (TensorFlow.js)
//! が読める形式で出力ディレクトリへ書き出します。
//! フロントエンドがクラス名と前処理係数を参照できるよう `metadata.json` も同梱します。

pub mod tfjs;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::info;

use burn::tensor::backend::Backend;
use burn_ndarray::{NdArray, NdArrayDevice};

use crate::ml::load_classifier;
use crate::model::{load_model_with_metadata, ModelMetadata};

pub use tfjs::{ExportError, TfjsExport, DEFAULT_SHARD_BYTES};

pub const METADATA_JSON: &str = "metadata.json";

/// 変換結果
#[derive(Debug, Clone)]
pub struct ConversionReport {
    pub output_dir: PathBuf,
    pub metadata: ModelMetadata,
    pub export: TfjsExport,
    pub metadata_json: PathBuf,
}

/// モデルファイルを変換（CPUで重みを読み出す）
pub fn convert_model(model_path: &Path, output_dir: &Path) -> Result<ConversionReport> {
    convert_model_with::<NdArray<f32>>(model_path, output_dir, &NdArrayDevice::Cpu)
}

/// 任意のバックエンドで重みを復元して変換
pub fn convert_model_with<B: Backend>(
    model_path: &Path,
    output_dir: &Path,
    device: &B::Device,
) -> Result<ConversionReport> {
    info!("モデルを読み込みます: {}", model_path.display());
    let (metadata, model_binary) = load_model_with_metadata(model_path)?;
    let model = load_classifier::<B>(&metadata, model_binary, device)?;

    let layers = model.layer_params()?;
    let export = tfjs::write_layers_model(
        &layers,
        metadata.image_size as usize,
        output_dir,
        DEFAULT_SHARD_BYTES,
    )
    .with_context(|| format!("Web形式への書き出しに失敗しました: {}", output_dir.display()))?;

    let metadata_json = output_dir.join(METADATA_JSON);
    std::fs::write(&metadata_json, metadata.to_json_string()?)
        .with_context(|| format!("Failed to write {:?}", metadata_json))?;

    info!(
        "変換完了: {} ({} シャード, {} bytes)",
        output_dir.display(),
        export.shards.len(),
        export.weight_bytes
    );

    Ok(ConversionReport {
        output_dir: output_dir.to_path_buf(),
        metadata,
        export,
        metadata_json,
    })
}
