//! TensorFlow.js "layers-model" 形式への書き出し
//!
//! 出力ディレクトリの構成:
//! - `model.json`              - トポロジ（Keras Sequential 互換）と重みマニフェスト
//! - `group1-shard{k}of{n}.bin` - float32 リトルエンディアンの重み（最大4MiBずつ）
//!
//! burn は channels-first (NCHW)、TF.js は channels-last (NHWC) なので
//! 畳み込みカーネルと Flatten 直後の全結合カーネルの並びを変換します。

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use crate::ml::{LayerKind, LayerParams, RawTensor};

/// tfjs-converter と同じシャードサイズ
pub const DEFAULT_SHARD_BYTES: usize = 4 * 1024 * 1024;

pub const MODEL_JSON: &str = "model.json";

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize model.json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{layer}: expected {expected} but got shape {shape:?}")]
    Shape {
        layer: String,
        expected: String,
        shape: Vec<usize>,
    },

    #[error("unexpected layer sequence: {0}")]
    Layout(String),
}

pub type ExportResult<T> = Result<T, ExportError>;

/// 重みマニフェストの1エントリ
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct WeightEntry {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: &'static str,
}

/// 重みマニフェストのグループ
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct WeightGroup {
    pub paths: Vec<String>,
    pub weights: Vec<WeightEntry>,
}

/// 書き出し結果
#[derive(Debug, Clone)]
pub struct TfjsExport {
    pub model_json: PathBuf,
    pub shards: Vec<PathBuf>,
    pub weight_bytes: usize,
}

/// `[out, in, kh, kw]` を `[kh, kw, in, out]` に並べ替える
pub fn conv_kernel_to_hwio(layer: &str, kernel: &RawTensor) -> ExportResult<RawTensor> {
    let [o, i, kh, kw] = match *kernel.shape.as_slice() {
        [o, i, kh, kw] => [o, i, kh, kw],
        _ => {
            return Err(ExportError::Shape {
                layer: layer.to_string(),
                expected: "[out, in, kh, kw]".to_string(),
                shape: kernel.shape.clone(),
            })
        }
    };

    let mut values = vec![0.0; kernel.values.len()];
    for co in 0..o {
        for ci in 0..i {
            for y in 0..kh {
                for x in 0..kw {
                    let src = ((co * i + ci) * kh + y) * kw + x;
                    let dst = ((y * kw + x) * i + ci) * o + co;
                    values[dst] = kernel.values[src];
                }
            }
        }
    }

    Ok(RawTensor { shape: vec![kh, kw, i, o], values })
}

/// Flatten 直後の全結合カーネル `[c*h*w, out]` の行を (c, h, w) 順から (h, w, c) 順にする
pub fn dense_kernel_to_channels_last(
    layer: &str,
    kernel: &RawTensor,
    [c, h, w]: [usize; 3],
) -> ExportResult<RawTensor> {
    let (rows, out) = match *kernel.shape.as_slice() {
        [rows, out] if rows == c * h * w => (rows, out),
        _ => {
            return Err(ExportError::Shape {
                layer: layer.to_string(),
                expected: format!("[{}, units]", c * h * w),
                shape: kernel.shape.clone(),
            })
        }
    };

    let mut values = vec![0.0; rows * out];
    for ch in 0..c {
        for y in 0..h {
            for x in 0..w {
                let src_row = (ch * h + y) * w + x;
                let dst_row = (y * w + x) * c + ch;
                values[dst_row * out..(dst_row + 1) * out]
                    .copy_from_slice(&kernel.values[src_row * out..(src_row + 1) * out]);
            }
        }
    }

    Ok(RawTensor { shape: vec![rows, out], values })
}

/// Keras 既定のレイヤー名 (`conv2d`, `conv2d_1`, ...) を振る
fn keras_name(base: &str, index: usize) -> String {
    if index == 0 {
        base.to_string()
    } else {
        format!("{}_{}", base, index)
    }
}

/// 層ごとの Keras 名と TF.js 側の並びに変換済みの重み
struct ConvertedLayer {
    keras_name: String,
    kernel: RawTensor,
    bias: RawTensor,
}

fn convert_layers(layers: &[LayerParams]) -> ExportResult<Vec<ConvertedLayer>> {
    let mut conv_index = 0;
    let mut dense_index = 0;
    let mut converted = Vec::with_capacity(layers.len());

    for layer in layers {
        let (keras_name, kernel) = match layer.kind {
            LayerKind::Conv2d => {
                let name = keras_name("conv2d", conv_index);
                conv_index += 1;
                (name, conv_kernel_to_hwio(layer.name, &layer.weight)?)
            }
            LayerKind::Dense { flattened_from } => {
                let name = keras_name("dense", dense_index);
                dense_index += 1;
                let kernel = match flattened_from {
                    Some(chw) => dense_kernel_to_channels_last(layer.name, &layer.weight, chw)?,
                    None => layer.weight.clone(),
                };
                (name, kernel)
            }
        };
        converted.push(ConvertedLayer { keras_name, kernel, bias: layer.bias.clone() });
    }

    Ok(converted)
}

fn base_config(name: &str) -> serde_json::Map<String, Value> {
    let mut config = serde_json::Map::new();
    config.insert("name".into(), json!(name));
    config.insert("trainable".into(), json!(true));
    config.insert("dtype".into(), json!("float32"));
    config
}

/// Keras Sequential 互換のトポロジを組み立てる
///
/// 畳み込み3層のうち最初の2層の後に MaxPooling を挟み、Flatten のあと全結合を並べます。
fn build_topology(layers: &[ConvertedLayer], image_size: usize) -> ExportResult<Value> {
    let num_conv = layers.iter().filter(|l| l.kernel.shape.len() == 4).count();
    let num_dense = layers.len() - num_conv;
    if num_conv == 0 || num_dense == 0 || layers[..num_conv].iter().any(|l| l.kernel.shape.len() != 4) {
        return Err(ExportError::Layout(
            "expected convolution layers followed by dense layers".to_string(),
        ));
    }

    let mut topology = Vec::new();
    let mut pool_index = 0;

    for (index, layer) in layers.iter().enumerate() {
        let is_conv = index < num_conv;
        let mut config = base_config(&layer.keras_name);
        if index == 0 {
            config.insert(
                "batch_input_shape".into(),
                json!([Value::Null, image_size, image_size, layer.kernel.shape[2]]),
            );
        }

        if is_conv {
            let [kh, kw] = [layer.kernel.shape[0], layer.kernel.shape[1]];
            config.insert("filters".into(), json!(layer.kernel.shape[3]));
            config.insert("kernel_size".into(), json!([kh, kw]));
            config.insert("strides".into(), json!([1, 1]));
            config.insert("padding".into(), json!("valid"));
            config.insert("data_format".into(), json!("channels_last"));
            config.insert("dilation_rate".into(), json!([1, 1]));
            config.insert("activation".into(), json!("relu"));
            config.insert("use_bias".into(), json!(true));
            topology.push(json!({ "class_name": "Conv2D", "config": config }));

            // 最後の畳み込み層の後はプーリングしない
            if index + 1 < num_conv {
                let mut pool = base_config(&keras_name("max_pooling2d", pool_index));
                pool_index += 1;
                pool.insert("pool_size".into(), json!([2, 2]));
                pool.insert("padding".into(), json!("valid"));
                pool.insert("strides".into(), json!([2, 2]));
                pool.insert("data_format".into(), json!("channels_last"));
                topology.push(json!({ "class_name": "MaxPooling2D", "config": pool }));
            }
        } else {
            if index == num_conv {
                let mut flatten = base_config("flatten");
                flatten.insert("data_format".into(), json!("channels_last"));
                topology.push(json!({ "class_name": "Flatten", "config": flatten }));
            }
            let is_output = index + 1 == layers.len();
            config.insert("units".into(), json!(layer.kernel.shape[1]));
            config.insert("activation".into(), json!(if is_output { "softmax" } else { "relu" }));
            config.insert("use_bias".into(), json!(true));
            topology.push(json!({ "class_name": "Dense", "config": config }));
        }
    }

    Ok(json!({
        "class_name": "Sequential",
        "config": { "name": "sequential", "layers": topology },
        "keras_version": "2.15.0",
        "backend": "tensorflow",
    }))
}

/// 重みをバイト列にし、シャードの大きさで区切る
fn shard_bytes(bytes: &[u8], shard_size: usize) -> Vec<&[u8]> {
    if bytes.is_empty() {
        return vec![bytes];
    }
    bytes.chunks(shard_size.max(1)).collect()
}

fn shard_name(index: usize, total: usize) -> String {
    format!("group1-shard{}of{}.bin", index + 1, total)
}

fn write_file(path: &Path, contents: &[u8]) -> ExportResult<()> {
    fs::write(path, contents).map_err(|source| ExportError::Io { path: path.to_path_buf(), source })
}

/// `model.json` と重みシャードを `output_dir` に書き出す
pub fn write_layers_model(
    layers: &[LayerParams],
    image_size: usize,
    output_dir: &Path,
    shard_size: usize,
) -> ExportResult<TfjsExport> {
    let converted = convert_layers(layers)?;
    let topology = build_topology(&converted, image_size)?;

    let mut weights = Vec::new();
    let mut bytes = Vec::new();
    for layer in &converted {
        for (suffix, tensor) in [("kernel", &layer.kernel), ("bias", &layer.bias)] {
            weights.push(WeightEntry {
                name: format!("{}/{}", layer.keras_name, suffix),
                shape: tensor.shape.clone(),
                dtype: "float32",
            });
            bytes.extend(tensor.values.iter().flat_map(|v| v.to_le_bytes()));
        }
    }

    fs::create_dir_all(output_dir)
        .map_err(|source| ExportError::Io { path: output_dir.to_path_buf(), source })?;

    let chunks = shard_bytes(&bytes, shard_size);
    let mut shards = Vec::with_capacity(chunks.len());
    let mut paths = Vec::with_capacity(chunks.len());
    for (index, chunk) in chunks.iter().enumerate() {
        let name = shard_name(index, chunks.len());
        let path = output_dir.join(&name);
        write_file(&path, chunk)?;
        debug!("{} ({} bytes)", path.display(), chunk.len());
        paths.push(name);
        shards.push(path);
    }

    let model_json = json!({
        "format": "layers-model",
        "generatedBy": concat!("engagement_cnn v", env!("CARGO_PKG_VERSION")),
        "convertedBy": concat!("engagement_cnn v", env!("CARGO_PKG_VERSION")),
        "modelTopology": topology,
        "weightsManifest": [WeightGroup { paths, weights }],
    });
    let model_json_path = output_dir.join(MODEL_JSON);
    write_file(&model_json_path, serde_json::to_string(&model_json)?.as_bytes())?;

    Ok(TfjsExport { model_json: model_json_path, shards, weight_bytes: bytes.len() })
}
