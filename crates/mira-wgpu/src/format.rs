//! Scalar/channel to texture format mapping.
//!
//! wgpu has no three-channel formats, and the device layer never asks for
//! one: three logical channels are always stored four wide. Formats are the
//! non-normalized integer and float variants so transfers stay byte-exact.

use mira_core::{DataType, MiraError, Result};

/// Texture format for a storage channel count of 1, 2 or 4.
pub fn texture_format(data_type: DataType, storage_channels: u32) -> Result<wgpu::TextureFormat> {
    use wgpu::TextureFormat as F;
    let format = match (data_type, storage_channels) {
        (DataType::Int8, 1) => F::R8Sint,
        (DataType::Int8, 2) => F::Rg8Sint,
        (DataType::Int8, 4) => F::Rgba8Sint,
        (DataType::Uint8, 1) => F::R8Uint,
        (DataType::Uint8, 2) => F::Rg8Uint,
        (DataType::Uint8, 4) => F::Rgba8Uint,
        (DataType::Int16, 1) => F::R16Sint,
        (DataType::Int16, 2) => F::Rg16Sint,
        (DataType::Int16, 4) => F::Rgba16Sint,
        (DataType::Uint16, 1) => F::R16Uint,
        (DataType::Uint16, 2) => F::Rg16Uint,
        (DataType::Uint16, 4) => F::Rgba16Uint,
        (DataType::Float32, 1) => F::R32Float,
        (DataType::Float32, 2) => F::Rg32Float,
        (DataType::Float32, 4) => F::Rgba32Float,
        (dt, c) => {
            return Err(MiraError::Device(format!(
                "no texture format for {dt} with {c} storage channels"
            )))
        }
    };
    Ok(format)
}

/// Bytes per texel for a storage layout.
pub fn texel_size(data_type: DataType, storage_channels: u32) -> usize {
    data_type.size() * storage_channels as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_supported_combination_maps() {
        for data_type in [
            DataType::Int8,
            DataType::Uint8,
            DataType::Int16,
            DataType::Uint16,
            DataType::Float32,
        ] {
            for channels in [1, 2, 4] {
                let format = texture_format(data_type, channels).unwrap();
                assert_eq!(
                    format.block_copy_size(None).unwrap() as usize,
                    texel_size(data_type, channels),
                    "{data_type} x{channels}"
                );
            }
        }
    }

    #[test]
    fn three_channel_storage_is_rejected() {
        assert!(texture_format(DataType::Uint8, 3).is_err());
    }
}
