//! アプリケーション設定管理モジュール
//!
//! 計算デバイス・入出力パス・学習パラメータをJSON形式で保存・読み込みします。
//! 設定ファイルが無い場合は元の学習スクリプトと同じ固定値で動作します。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::ml::MIN_IMAGE_SIZE;

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    #[default]
    Wgpu,
    /// NdArray (CPU) バックエンド
    Cpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// 入出力パス
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PathSettings {
    /// 画像配列 (.npy)
    pub images: PathBuf,
    /// ラベル配列 (.npy)
    pub labels: PathBuf,
    /// 学習済みモデル (tar.gz)
    pub model: PathBuf,
    /// Web向けに変換したモデルの出力先ディレクトリ
    pub web_model_dir: PathBuf,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            images: PathBuf::from("X_data.npy"),
            labels: PathBuf::from("y_data.npy"),
            model: PathBuf::from("model.tar.gz"),
            web_model_dir: PathBuf::from("public/model"),
        }
    }
}

/// モデル設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelSettings {
    /// 分類クラス数
    pub num_classes: usize,
    /// 入力画像サイズ（正方形、1チャネル）
    pub image_size: usize,
    /// クラス名（ラベル値の順）
    pub class_labels: Vec<String>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            num_classes: 2,
            image_size: 48,
            class_labels: vec!["not_interested".to_string(), "interested".to_string()],
        }
    }
}

/// トレーニング設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrainingSettings {
    /// エポック数
    pub num_epochs: usize,
    /// バッチサイズ
    pub batch_size: usize,
    /// ワーカー数
    pub num_workers: usize,
    /// 学習率
    pub learning_rate: f64,
    /// ランダムシード（データ分割用）
    pub seed: u64,
    /// テストデータの割合
    pub test_ratio: f64,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self {
            num_epochs: 25,
            batch_size: 32,
            num_workers: 0,
            learning_rate: 1e-3,
            seed: 42,
            test_ratio: 0.2,
        }
    }
}

/// アプリケーション設定
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    /// 計算デバイスの種類
    #[serde(default)]
    pub device_type: DeviceType,
    /// 入出力パス
    #[serde(default)]
    pub paths: PathSettings,
    /// モデル設定
    #[serde(default)]
    pub model: ModelSettings,
    /// トレーニング設定
    #[serde(default)]
    pub training: TrainingSettings,
}

impl AppConfig {
    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("engagement_cnn.json")
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// 指定パス（省略時はデフォルトパス）から設定を読み込む、存在しない場合はデフォルト設定を返す
    ///
    /// 明示的に指定されたファイルが読めない場合はエラーにします。
    pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = path {
            info!("設定ファイルを読み込みます: {}", path.display());
            return Self::load(path);
        }

        Self::load_from_default_path(&Self::default_path())
    }

    /// 既定の場所の設定を読む。無い・壊れている場合はデフォルト設定
    fn load_from_default_path(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            info!("設定ファイルが存在しません。デフォルト設定を使用します");
            return Ok(Self::default());
        }

        match Self::load(path) {
            Ok(config) => {
                info!("設定ファイルを読み込みました: {}", path.display());
                Ok(config)
            }
            Err(e) => {
                warn!(
                    "設定ファイルの読み込みに失敗しました ({}): {}. デフォルト設定を使用します",
                    path.display(),
                    e
                );
                Ok(Self::default())
            }
        }
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// 値の整合性を確認
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.model.num_classes < 2 {
            anyhow::bail!("num_classes must be at least 2 (got {})", self.model.num_classes);
        }
        if self.model.class_labels.len() != self.model.num_classes {
            anyhow::bail!(
                "class_labels has {} entries but num_classes is {}",
                self.model.class_labels.len(),
                self.model.num_classes
            );
        }
        if self.model.image_size < MIN_IMAGE_SIZE {
            anyhow::bail!(
                "image_size must be at least {} (got {})",
                MIN_IMAGE_SIZE,
                self.model.image_size
            );
        }
        if self.training.batch_size == 0 {
            anyhow::bail!("batch_size must be greater than 0");
        }
        if self.training.num_epochs == 0 {
            anyhow::bail!("num_epochs must be greater than 0");
        }
        if !(self.training.test_ratio > 0.0 && self.training.test_ratio < 1.0) {
            anyhow::bail!("test_ratio must be in (0, 1) (got {})", self.training.test_ratio);
        }
        Ok(())
    }

    /// 設定情報を表示
    pub fn display(&self) {
        info!("=== アプリケーション設定 ===");
        info!("計算デバイス: {}", self.device_type);
        info!("画像配列: {}", self.paths.images.display());
        info!("ラベル配列: {}", self.paths.labels.display());
        info!("モデル: {}", self.paths.model.display());
        info!("Webモデル出力先: {}", self.paths.web_model_dir.display());
        info!(
            "クラス ({}): {}",
            self.model.num_classes,
            self.model.class_labels.join(", ")
        );
        info!(
            "エポック数: {}, バッチサイズ: {}, 学習率: {}, シード: {}, テスト割合: {}",
            self.training.num_epochs,
            self.training.batch_size,
            self.training.learning_rate,
            self.training.seed,
            self.training.test_ratio
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.device_type, DeviceType::Wgpu);
        assert_eq!(config.model.num_classes, 2);
        assert_eq!(config.model.image_size, 48);
        assert_eq!(config.training.num_epochs, 25);
        assert_eq!(config.training.batch_size, 32);
        assert_eq!(config.paths.images, PathBuf::from("X_data.npy"));
        assert_eq!(config.paths.web_model_dir, PathBuf::from("public/model"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_serialize_deserialize() {
        let config = AppConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: AppConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let json = r#"{ "device_type": "Cpu" }"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.device_type, DeviceType::Cpu);
        assert_eq!(config.training, TrainingSettings::default());
    }

    #[test]
    fn test_explicit_path_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        assert!(AppConfig::load_or_default(Some(&missing)).is_err());
    }

    #[test]
    fn test_default_path_missing_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load_from_default_path(&dir.path().join("engagement_cnn.json")).unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_default_path_broken_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engagement_cnn.json");
        fs::write(&path, "{ not json").unwrap();
        assert_eq!(AppConfig::load_from_default_path(&path).unwrap(), AppConfig::default());

        // 値が不正なファイルも同じ扱い
        let mut invalid = AppConfig::default();
        invalid.model.image_size = 0;
        invalid.save(&path).unwrap();
        assert_eq!(AppConfig::load_from_default_path(&path).unwrap(), AppConfig::default());
    }

    #[test]
    fn test_default_path_valid_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engagement_cnn.json");
        let mut saved = AppConfig::default();
        saved.training.num_epochs = 7;
        saved.save(&path).unwrap();
        let config = AppConfig::load_from_default_path(&path).unwrap();
        assert_eq!(config.training.num_epochs, 7);
        assert_eq!(config.training.batch_size, 32);
    }

    #[test]
    fn test_validate_rejects_small_image_size() {
        let mut config = AppConfig::default();
        config.model.image_size = 0;
        assert!(config.validate().is_err());
        config.model.image_size = 13;
        assert!(config.validate().is_err());
        config.model.image_size = 14;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = AppConfig::default();
        config.training.num_epochs = 3;
        config.save(&path).unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded.training.num_epochs, 3);
    }

    #[test]
    fn test_validate_rejects_label_mismatch() {
        let mut config = AppConfig::default();
        config.model.class_labels.push("extra".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_device_type_display() {
        assert_eq!(format!("{}", DeviceType::Wgpu), "WGPU (GPU)");
        assert_eq!(format!("{}", DeviceType::Cpu), "CPU (NdArray)");
    }
}
