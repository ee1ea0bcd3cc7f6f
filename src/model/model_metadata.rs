//! モデルメタデータの定義
//!
//! tar.gz形式のモデルファイルに `metadata.json` として同梱され、
//! Web変換時にもそのまま出力ディレクトリへコピーされます。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

fn default_pixel_scale() -> f32 {
    1.0 / 255.0
}

/// モデルメタデータ
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelMetadata {
    /// クラスラベル（ラベル値の順）
    /// 例: ["not_interested", "interested"]
    pub class_labels: Vec<String>,

    /// モデル入力サイズ（CNNへの入力解像度、通常48x48・1チャネル）
    pub image_size: u32,

    /// 学習エポック数
    pub num_epochs: u32,

    /// バッチサイズ
    pub batch_size: u32,

    /// 学習率
    pub learning_rate: f64,

    /// 学習データ数
    pub num_train_samples: u32,

    /// テストデータ数
    pub num_test_samples: u32,

    /// テストデータでの正解率 (0.0〜1.0)
    pub test_accuracy: f64,

    /// テストデータでの損失
    pub test_loss: f64,

    /// 学習可能パラメータ数
    pub num_params: u64,

    /// 元の画素値 (0〜255) に掛けるとモデル入力の値域になる係数
    #[serde(default = "default_pixel_scale")]
    pub pixel_scale: f32,

    /// モデルの学習時刻（ISO8601形式）
    pub trained_at: String,
}

impl ModelMetadata {
    /// 学習時刻を現在時刻にして新しいメタデータを作成
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        class_labels: Vec<String>,
        image_size: u32,
        num_epochs: u32,
        batch_size: u32,
        learning_rate: f64,
        num_train_samples: u32,
        num_test_samples: u32,
        test_accuracy: f64,
        test_loss: f64,
        num_params: u64,
    ) -> Self {
        let trained_at = chrono::Local::now().to_rfc3339();

        Self {
            class_labels,
            image_size,
            num_epochs,
            batch_size,
            learning_rate,
            num_train_samples,
            num_test_samples,
            test_accuracy,
            test_loss,
            num_params,
            pixel_scale: default_pixel_scale(),
            trained_at,
        }
    }

    pub fn with_pixel_scale(mut self, pixel_scale: f32) -> Self {
        self.pixel_scale = pixel_scale;
        self
    }

    pub fn num_classes(&self) -> usize {
        self.class_labels.len()
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize metadata from JSON")
    }
}

#[cfg(test)]
pub(crate) fn sample_metadata() -> ModelMetadata {
    ModelMetadata::new(
        vec!["not_interested".to_string(), "interested".to_string()],
        48,
        25,
        32,
        1e-3,
        80,
        20,
        0.85,
        0.41,
        318_082,
    )
}
