//! `train` — 画像配列からモデルを学習して保存する
//!
//! ```bash
//! cargo run --bin train
//! cargo run --bin train -- --config engagement_cnn.json --cpu
//! ```

#![recursion_limit = "256"]

use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use engagement_cnn::backend::{self, CpuTrainingBackend};
use engagement_cnn::ml::train_model;
use engagement_cnn::model::{AppConfig, DeviceType};

#[derive(Parser, Debug)]
#[command(name = "train", version, about = "Train the engagement classifier from X_data.npy / y_data.npy")]
struct Args {
    /// 設定ファイル (JSON)。省略時は ./engagement_cnn.json があれば読み込む
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// 画像配列
    #[arg(long, value_name = "FILE")]
    images: Option<PathBuf>,

    /// ラベル配列
    #[arg(long, value_name = "FILE")]
    labels: Option<PathBuf>,

    /// 学習済みモデルの保存先
    #[arg(long, value_name = "FILE")]
    model: Option<PathBuf>,

    /// エポック数
    #[arg(long)]
    epochs: Option<usize>,

    /// バッチサイズ
    #[arg(long)]
    batch_size: Option<usize>,

    /// CPU (NdArray) で学習する
    #[arg(long, default_value_t = false)]
    cpu: bool,

    /// ログレベル (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    engagement_cnn::init_logging(&args.log_level);

    info!("engagement_cnn train v{}", engagement_cnn::VERSION);

    let mut config = AppConfig::load_or_default(args.config.as_deref())?;
    if let Some(images) = args.images {
        config.paths.images = images;
    }
    if let Some(labels) = args.labels {
        config.paths.labels = labels;
    }
    if let Some(model) = args.model {
        config.paths.model = model;
    }
    if let Some(epochs) = args.epochs {
        config.training.num_epochs = epochs;
    }
    if let Some(batch_size) = args.batch_size {
        config.training.batch_size = batch_size;
    }
    if args.cpu {
        config.device_type = DeviceType::Cpu;
    }
    config.validate()?;
    config.display();

    let report = match backend::resolve_device_type(config.device_type) {
        #[cfg(feature = "wgpu")]
        DeviceType::Wgpu => train_model::<backend::GpuTrainingBackend>(&config, backend::WgpuDevice::default())?,
        _ => train_model::<CpuTrainingBackend>(&config, backend::cpu_device())?,
    };

    println!("Test accuracy: {}", report.evaluation.accuracy);
    info!("モデルを保存しました: {}", report.model_path.display());
    Ok(())
}
