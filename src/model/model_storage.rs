//! モデルとメタデータの永続化
//!
//! Tar.gz形式でモデルとメタデータを1ファイルに統合して保存・読み込みします。
//!
//! ファイル構成（tar.gz内部）:
//! - metadata.json   - メタデータ（クラスラベル、入力サイズ、評価結果など）
//! - model.bin       - モデルの重み（BinBytesRecorder, f32）

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tar::{Archive, Builder};
use tracing::info;

use crate::model::model_metadata::ModelMetadata;

const METADATA_ENTRY: &str = "metadata.json";
const MODEL_ENTRY: &str = "model.bin";

/// メタデータと共にモデルをTar.gz形式で保存
///
/// 既存ファイルは上書きされます。親ディレクトリが無ければ作成します。
pub fn save_model_with_metadata(
    output_path: &Path,
    metadata: &ModelMetadata,
    model_binary: &[u8],
) -> Result<()> {
    if let Some(parent) = output_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create parent directory: {:?}", parent))?;
        }
    }

    let tar_gz_file = File::create(output_path)
        .with_context(|| format!("Failed to create tar.gz file: {:?}", output_path))?;

    let encoder = GzEncoder::new(tar_gz_file, Compression::default());
    let mut tar_builder = Builder::new(encoder);

    let json_str = metadata.to_json_string()?;
    append_entry(&mut tar_builder, METADATA_ENTRY, json_str.as_bytes())?;
    append_entry(&mut tar_builder, MODEL_ENTRY, model_binary)?;

    // tar を閉じてから gzip を閉じる
    let encoder = tar_builder
        .into_inner()
        .context("Failed to finalize tar archive")?;
    encoder.finish().context("Failed to finalize gzip stream")?;

    info!(
        "モデルを保存しました: {} ({} bytes の重み)",
        output_path.display(),
        model_binary.len()
    );
    Ok(())
}

fn append_entry<W: std::io::Write>(builder: &mut Builder<W>, name: &str, data: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name)?;
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append(&header, data)
        .with_context(|| format!("Failed to add {} to tar", name))
}

fn open_archive(tar_gz_path: &Path) -> Result<Archive<GzDecoder<File>>> {
    let tar_gz_file = File::open(tar_gz_path)
        .with_context(|| format!("Failed to open tar.gz file: {:?}", tar_gz_path))?;
    Ok(Archive::new(GzDecoder::new(tar_gz_file)))
}

/// Tar.gzからモデルメタデータを読み込む
pub fn load_metadata(tar_gz_path: &Path) -> Result<ModelMetadata> {
    let mut archive = open_archive(tar_gz_path)?;

    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.path()?.to_str() == Some(METADATA_ENTRY) {
            let mut json_str = String::new();
            entry.read_to_string(&mut json_str)?;
            return ModelMetadata::from_json_string(&json_str);
        }
    }

    Err(anyhow::anyhow!("metadata.json not found in tar.gz archive"))
}

/// Tar.gzからモデルバイナリを読み込む
pub fn load_model_binary(tar_gz_path: &Path) -> Result<Vec<u8>> {
    let mut archive = open_archive(tar_gz_path)?;

    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.path()?.to_str() == Some(MODEL_ENTRY) {
            let mut buffer = Vec::new();
            entry.read_to_end(&mut buffer)?;
            return Ok(buffer);
        }
    }

    Err(anyhow::anyhow!("model.bin not found in tar.gz archive"))
}

/// メタデータとモデルバイナリを共に読み込む
pub fn load_model_with_metadata(tar_gz_path: &Path) -> Result<(ModelMetadata, Vec<u8>)> {
    let mut archive = open_archive(tar_gz_path)?;

    let mut metadata_opt: Option<ModelMetadata> = None;
    let mut model_binary_opt: Option<Vec<u8>> = None;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_str().map(str::to_owned);

        match path.as_deref() {
            Some(METADATA_ENTRY) => {
                let mut json_str = String::new();
                entry.read_to_string(&mut json_str)?;
                metadata_opt = Some(ModelMetadata::from_json_string(&json_str)?);
            }
            Some(MODEL_ENTRY) => {
                let mut buffer = Vec::new();
                entry.read_to_end(&mut buffer)?;
                model_binary_opt = Some(buffer);
            }
            _ => {}
        }
    }

    match (metadata_opt, model_binary_opt) {
        (Some(metadata), Some(binary)) => Ok((metadata, binary)),
        (None, _) => Err(anyhow::anyhow!("metadata.json not found in tar.gz archive")),
        (_, None) => Err(anyhow::anyhow!("model.bin not found in tar.gz archive")),
    }
}

/// メタデータをログに表示
pub fn print_metadata_info(metadata: &ModelMetadata) {
    info!("=== モデルメタデータ ===");
    info!("クラスラベル: {}", metadata.class_labels.join(", "));
    info!("モデル入力サイズ: {}x{}x1", metadata.image_size, metadata.image_size);
    info!("学習エポック数: {}", metadata.num_epochs);
    info!("バッチサイズ: {}, 学習率: {}", metadata.batch_size, metadata.learning_rate);
    info!(
        "学習データ: {} 件, テストデータ: {} 件",
        metadata.num_train_samples, metadata.num_test_samples
    );
    info!(
        "Test accuracy: {:.4}, Test loss: {:.4}",
        metadata.test_accuracy, metadata.test_loss
    );
    info!("パラメータ数: {}", metadata.num_params);
    info!("学習日時: {}", metadata.trained_at);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::model_metadata::sample_metadata;

    #[test]
    fn test_save_then_load_both_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("model.tar.gz");
        let metadata = sample_metadata();
        let binary: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();

        save_model_with_metadata(&path, &metadata, &binary).unwrap();
        assert!(path.exists());

        assert_eq!(load_metadata(&path).unwrap(), metadata);
        assert_eq!(load_model_binary(&path).unwrap(), binary);

        let (m, b) = load_model_with_metadata(&path).unwrap();
        assert_eq!(m, metadata);
        assert_eq!(b, binary);
    }

    #[test]
    fn test_save_overwrites_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.tar.gz");
        let metadata = sample_metadata();

        save_model_with_metadata(&path, &metadata, &[1, 2, 3]).unwrap();
        save_model_with_metadata(&path, &metadata, &[9]).unwrap();

        assert_eq!(load_model_binary(&path).unwrap(), vec![9]);
    }

    #[test]
    fn test_missing_model_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.tar.gz");

        let file = File::create(&path).unwrap();
        let mut builder = Builder::new(GzEncoder::new(file, Compression::default()));
        let json = sample_metadata().to_json_string().unwrap();
        append_entry(&mut builder, METADATA_ENTRY, json.as_bytes()).unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        assert!(load_metadata(&path).is_ok());
        let err = load_model_with_metadata(&path).unwrap_err();
        assert!(err.to_string().contains("model.bin"));
    }

    #[test]
    fn test_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_metadata(&dir.path().join("absent.tar.gz")).is_err());
    }
}
