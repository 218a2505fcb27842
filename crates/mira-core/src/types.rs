//! Element types and image descriptors.
//!
//! [`DataType`] is deliberately a closed enum: every scalar the pipeline can
//! carry is listed here, and code that needs to act per-scalar goes through
//! the single [`dispatch_data_type!`] point instead of growing its own match.

use serde::{Deserialize, Serialize};

use crate::error::{MiraError, Result};

/// Scalar element type of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Int8,
    Uint8,
    Int16,
    Uint16,
    Float32,
}

impl DataType {
    /// Size of one scalar in bytes.
    pub fn size(self) -> usize {
        match self {
            DataType::Int8 | DataType::Uint8 => 1,
            DataType::Int16 | DataType::Uint16 => 2,
            DataType::Float32 => 4,
        }
    }

    pub fn is_signed(self) -> bool {
        matches!(self, DataType::Int8 | DataType::Int16 | DataType::Float32)
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DataType::Int8 => "i8",
            DataType::Uint8 => "u8",
            DataType::Int16 => "i16",
            DataType::Uint16 => "u16",
            DataType::Float32 => "f32",
        };
        f.write_str(name)
    }
}

/// Expands `$body` once per scalar type, with `$t` bound to the concrete Rust
/// type matching `$data_type`. The one place per-scalar behavior branches.
#[macro_export]
macro_rules! dispatch_data_type {
    ($data_type:expr, $t:ident => $body:expr) => {
        match $data_type {
            $crate::types::DataType::Int8 => {
                type $t = i8;
                $body
            }
            $crate::types::DataType::Uint8 => {
                type $t = u8;
                $body
            }
            $crate::types::DataType::Int16 => {
                type $t = i16;
                $body
            }
            $crate::types::DataType::Uint16 => {
                type $t = u16;
                $body
            }
            $crate::types::DataType::Float32 => {
                type $t = f32;
                $body
            }
        }
    };
}

/// Logical shape of an image as the caller sees it.
///
/// `depth == 1` for 2D images. `channels` is the logical channel count
/// (1 to 4); what a device actually stores may be wider, see
/// [`ImageLayout::storage_channels`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDescriptor {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub dimensions: u8,
    pub channels: u32,
    pub data_type: DataType,
}

impl ImageDescriptor {
    pub fn new_2d(width: u32, height: u32, data_type: DataType, channels: u32) -> Result<Self> {
        Self::validate(width, height, 1, channels)?;
        Ok(Self { width, height, depth: 1, dimensions: 2, channels, data_type })
    }

    pub fn new_3d(
        width: u32,
        height: u32,
        depth: u32,
        data_type: DataType,
        channels: u32,
    ) -> Result<Self> {
        Self::validate(width, height, depth, channels)?;
        Ok(Self { width, height, depth, dimensions: 3, channels, data_type })
    }

    fn validate(width: u32, height: u32, depth: u32, channels: u32) -> Result<()> {
        if width == 0 || height == 0 || depth == 0 {
            return Err(MiraError::InvalidDescriptor(format!(
                "dimensions must be non-zero, got {width}x{height}x{depth}"
            )));
        }
        if channels == 0 || channels > 4 {
            return Err(MiraError::InvalidDescriptor(format!(
                "channel count must be 1..=4, got {channels}"
            )));
        }
        Ok(())
    }

    /// Number of pixels (voxels for 3D).
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize * self.depth as usize
    }

    /// Size in bytes of the host representation (tightly packed, logical
    /// channel count).
    pub fn host_byte_len(&self) -> usize {
        self.pixel_count() * self.channels as usize * self.data_type.size()
    }
}

/// Physical layout of a device-side image allocation.
///
/// Devices that cannot store 1- to 3-channel images natively round the
/// channel count up; the transfer engine pads and compacts accordingly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageLayout {
    pub descriptor: ImageDescriptor,
    pub storage_channels: u32,
}

impl ImageLayout {
    /// Size in bytes of the device-side allocation.
    pub fn byte_len(&self) -> usize {
        self.descriptor.pixel_count()
            * self.storage_channels as usize
            * self.descriptor.data_type.size()
    }

    /// Whether upload/download needs the pad/compact step.
    pub fn is_padded(&self) -> bool {
        self.storage_channels != self.descriptor.channels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_rejects_degenerate_shapes() {
        assert!(ImageDescriptor::new_2d(0, 4, DataType::Uint8, 1).is_err());
        assert!(ImageDescriptor::new_3d(4, 4, 0, DataType::Uint8, 1).is_err());
        assert!(ImageDescriptor::new_2d(4, 4, DataType::Uint8, 5).is_err());
        assert!(ImageDescriptor::new_2d(4, 4, DataType::Uint8, 0).is_err());
    }

    #[test]
    fn signedness_per_scalar() {
        assert!(DataType::Int8.is_signed());
        assert!(DataType::Int16.is_signed());
        assert!(DataType::Float32.is_signed());
        assert!(!DataType::Uint8.is_signed());
        assert!(!DataType::Uint16.is_signed());
    }

    #[test]
    fn byte_lengths_follow_scalar_and_channel_count() {
        let desc = ImageDescriptor::new_2d(8, 4, DataType::Int16, 3).unwrap();
        assert_eq!(desc.host_byte_len(), 8 * 4 * 3 * 2);

        let layout = ImageLayout { descriptor: desc, storage_channels: 4 };
        assert!(layout.is_padded());
        assert_eq!(layout.byte_len(), 8 * 4 * 4 * 2);
    }

    #[test]
    fn dispatch_binds_the_matching_scalar() {
        let size = dispatch_data_type!(DataType::Uint16, T => std::mem::size_of::<T>());
        assert_eq!(size, 2);
    }
}
