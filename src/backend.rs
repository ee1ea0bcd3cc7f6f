//! バックエンド選択
//!
//! GPU は `wgpu` フィーチャ有効時のみ。無効な場合や CPU 指定時は NdArray を使います。

use burn_autodiff::Autodiff;
use burn_ndarray::{NdArray, NdArrayDevice};

use crate::model::DeviceType;

/// CPU バックエンド
pub type CpuBackend = NdArray<f32>;

/// CPU 学習用バックエンド
pub type CpuTrainingBackend = Autodiff<CpuBackend>;

/// GPU バックエンド
#[cfg(feature = "wgpu")]
pub type GpuBackend = burn_wgpu::Wgpu;

/// GPU 学習用バックエンド
#[cfg(feature = "wgpu")]
pub type GpuTrainingBackend = Autodiff<GpuBackend>;

#[cfg(feature = "wgpu")]
pub use burn_wgpu::WgpuDevice;

pub fn cpu_device() -> NdArrayDevice {
    NdArrayDevice::Cpu
}

/// 設定とビルド構成から実際に使うデバイス種別を決める
pub fn resolve_device_type(requested: DeviceType) -> DeviceType {
    match requested {
        DeviceType::Wgpu if cfg!(feature = "wgpu") => DeviceType::Wgpu,
        DeviceType::Wgpu => {
            tracing::warn!("wgpu フィーチャが無効なため CPU (NdArray) を使用します");
            DeviceType::Cpu
        }
        DeviceType::Cpu => DeviceType::Cpu,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_is_always_available() {
        assert_eq!(resolve_device_type(DeviceType::Cpu), DeviceType::Cpu);
    }

    #[test]
    fn test_wgpu_follows_feature() {
        let expected = if cfg!(feature = "wgpu") { DeviceType::Wgpu } else { DeviceType::Cpu };
        assert_eq!(resolve_device_type(DeviceType::Wgpu), expected);
    }
}
