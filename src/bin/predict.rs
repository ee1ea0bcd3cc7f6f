//! `predict` — 保存済みモデルで顔画像を分類する

use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use engagement_cnn::backend::{self, CpuBackend};
use engagement_cnn::ml::{InferenceEngine, Prediction};
use engagement_cnn::model::{print_metadata_info, AppConfig, DeviceType};

#[derive(Parser, Debug)]
#[command(name = "predict", version, about = "Classify face crops with a trained model")]
struct Args {
    /// 分類する画像
    images: Vec<PathBuf>,

    /// 設定ファイル (JSON)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// モデルファイル
    #[arg(long, value_name = "FILE")]
    model: Option<PathBuf>,

    /// メタデータを表示する
    #[arg(long, default_value_t = false)]
    info: bool,

    /// CPU (NdArray) で推論する
    #[arg(long, default_value_t = false)]
    cpu: bool,

    /// ログレベル
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn report(path: &std::path::Path, prediction: &Prediction) {
    let probabilities: Vec<String> =
        prediction.probabilities.iter().map(|p| format!("{:.4}", p)).collect();
    println!("{}\t{}\t[{}]", path.display(), prediction.label, probabilities.join(", "));
}

fn run<B: burn::tensor::backend::Backend>(
    args: &Args,
    model_path: &std::path::Path,
    device: B::Device,
) -> anyhow::Result<()> {
    let engine = InferenceEngine::<B>::load(model_path, device)?;
    if args.info {
        print_metadata_info(engine.metadata());
    }
    for path in &args.images {
        let prediction = engine.classify_image(path)?;
        report(path, &prediction);
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    engagement_cnn::init_logging(&args.log_level);

    let mut config = AppConfig::load_or_default(args.config.as_deref())?;
    if args.cpu {
        config.device_type = DeviceType::Cpu;
    }
    let model_path = args.model.clone().unwrap_or(config.paths.model);
    if args.images.is_empty() && !args.info {
        anyhow::bail!("分類する画像を指定してください (メタデータのみなら --info)");
    }

    match backend::resolve_device_type(config.device_type) {
        #[cfg(feature = "wgpu")]
        DeviceType::Wgpu => run::<backend::GpuBackend>(&args, &model_path, backend::WgpuDevice::default())?,
        _ => run::<CpuBackend>(&args, &model_path, backend::cpu_device())?,
    }

    info!("{} 件を分類しました", args.images.len());
    Ok(())
}
