//! 授業中の関心度判定モデル（顔画像 48x48 の2クラスCNN）の学習とWeb向け変換

pub mod backend;
pub mod ml;
pub mod model;
pub mod web;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// バイナリ共通のログ初期化
///
/// `RUST_LOG` が設定されていればそちらを優先します。
pub fn init_logging(default_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
