//! `convert` — 学習済みモデルをブラウザ用 (TensorFlow.js layers-model) に変換する

use clap::Parser;
use std::path::PathBuf;

use engagement_cnn::model::AppConfig;
use engagement_cnn::web::convert_model;

#[derive(Parser, Debug)]
#[command(name = "convert", version, about = "Convert model.tar.gz into a web-loadable model directory")]
struct Args {
    /// 設定ファイル (JSON)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// 変換元のモデル
    #[arg(long, value_name = "FILE")]
    model: Option<PathBuf>,

    /// 出力ディレクトリ
    #[arg(short, long, value_name = "DIR")]
    output: Option<PathBuf>,

    /// ログレベル
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    engagement_cnn::init_logging(&args.log_level);

    let config = AppConfig::load_or_default(args.config.as_deref())?;
    let model_path = args.model.unwrap_or(config.paths.model);
    let output_dir = args.output.unwrap_or(config.paths.web_model_dir);

    let report = convert_model(&model_path, &output_dir)?;
    for shard in &report.export.shards {
        tracing::debug!("shard: {}", shard.display());
    }
    tracing::info!("model.json: {}", report.export.model_json.display());
    Ok(())
}
