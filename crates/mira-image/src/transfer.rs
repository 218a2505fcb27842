//! Host/device transfer helpers.
//!
//! Device image storage may be wider than the logical channel count (three
//! channels are always stored four wide, one and two only on devices without
//! narrow formats). Upload pads each pixel into the wider layout, download
//! compacts it back. Padding is byte-exact per scalar: extra channels are
//! zero on upload and discarded on download.

use bytemuck::Pod;
use mira_core::{dispatch_data_type, AcceleratorDevice, ImageDescriptor, ImageLayout};

/// Layout a given device uses for this descriptor.
pub(crate) fn layout_for(descriptor: ImageDescriptor, device: &AcceleratorDevice) -> ImageLayout {
    ImageLayout { descriptor, storage_channels: device.storage_channels(descriptor.channels) }
}

/// Host bytes (tight, logical channels) to device bytes (storage channels).
pub(crate) fn pack_host_to_device(layout: &ImageLayout, host: &[u8]) -> Vec<u8> {
    debug_assert_eq!(host.len(), layout.descriptor.host_byte_len());
    if !layout.is_padded() {
        return host.to_vec();
    }
    let channels = layout.descriptor.channels as usize;
    let storage = layout.storage_channels as usize;
    dispatch_data_type!(layout.descriptor.data_type, T => {
        let src: Vec<T> = bytemuck::pod_collect_to_vec(host);
        let padded = pad(&src, channels, storage);
        bytemuck::cast_slice(&padded).to_vec()
    })
}

/// Device bytes (storage channels) back to host bytes (logical channels).
pub(crate) fn unpack_device_to_host(layout: &ImageLayout, device: &[u8]) -> Vec<u8> {
    debug_assert_eq!(device.len(), layout.byte_len());
    if !layout.is_padded() {
        return device.to_vec();
    }
    let channels = layout.descriptor.channels as usize;
    let storage = layout.storage_channels as usize;
    dispatch_data_type!(layout.descriptor.data_type, T => {
        let src: Vec<T> = bytemuck::pod_collect_to_vec(device);
        let compacted = compact(&src, channels, storage);
        bytemuck::cast_slice(&compacted).to_vec()
    })
}

fn pad<T: Pod>(src: &[T], channels: usize, storage: usize) -> Vec<T> {
    let pixels = src.len() / channels;
    let mut out = vec![T::zeroed(); pixels * storage];
    for pixel in 0..pixels {
        out[pixel * storage..pixel * storage + channels]
            .copy_from_slice(&src[pixel * channels..(pixel + 1) * channels]);
    }
    out
}

fn compact<T: Pod>(src: &[T], channels: usize, storage: usize) -> Vec<T> {
    let pixels = src.len() / storage;
    let mut out = vec![T::zeroed(); pixels * channels];
    for pixel in 0..pixels {
        out[pixel * channels..(pixel + 1) * channels]
            .copy_from_slice(&src[pixel * storage..pixel * storage + channels]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use mira_core::DataType;

    fn padded_layout(data_type: DataType, channels: u32) -> ImageLayout {
        ImageLayout {
            descriptor: ImageDescriptor::new_2d(2, 2, data_type, channels).unwrap(),
            storage_channels: 4,
        }
    }

    #[test]
    fn three_channel_u8_pads_with_zero_alpha() {
        let layout = padded_layout(DataType::Uint8, 3);
        let host: Vec<u8> = (1..=12).collect();
        let packed = pack_host_to_device(&layout, &host);
        assert_eq!(packed, vec![1, 2, 3, 0, 4, 5, 6, 0, 7, 8, 9, 0, 10, 11, 12, 0]);
        assert_eq!(unpack_device_to_host(&layout, &packed), host);
    }

    #[test]
    fn single_channel_i16_round_trips() {
        let layout = padded_layout(DataType::Int16, 1);
        let host_values: Vec<i16> = vec![-5, 300, 0, i16::MIN];
        let host: Vec<u8> = bytemuck::cast_slice(&host_values).to_vec();
        let packed = pack_host_to_device(&layout, &host);
        assert_eq!(packed.len(), 4 * 4 * 2);
        assert_eq!(unpack_device_to_host(&layout, &packed), host);
    }

    #[test]
    fn unpadded_layouts_pass_through() {
        let layout = ImageLayout {
            descriptor: ImageDescriptor::new_2d(2, 2, DataType::Float32, 4).unwrap(),
            storage_channels: 4,
        };
        let host: Vec<u8> = (0..layout.byte_len() as u32).map(|i| i as u8).collect();
        assert_eq!(pack_host_to_device(&layout, &host), host);
        assert_eq!(unpack_device_to_host(&layout, &host), host);
    }

    #[test]
    fn float_padding_preserves_bit_patterns() {
        let layout = padded_layout(DataType::Float32, 2);
        let host_values: Vec<f32> = vec![1.5, -0.0, f32::NAN, 3.25, 0.0, -7.0, 2.0, 9.0];
        let host: Vec<u8> = bytemuck::cast_slice(&host_values).to_vec();
        let packed = pack_host_to_device(&layout, &host);
        // Bit-exact comparison, NaN included.
        assert_eq!(unpack_device_to_host(&layout, &packed), host);
    }
}
