//! Hardware round-trip tests. These need a real adapter, so they are
//! ignored by default; run with `cargo test -p mira-wgpu -- --ignored`.

use std::sync::Arc;

use mira_core::{DataType, ExecutionDevice};
use mira_image::{Image, Location};
use mira_wgpu::WgpuDevice;

#[test]
#[ignore = "requires a GPU"]
fn image_upload_download_is_byte_exact() {
    let gpu = WgpuDevice::register().unwrap();
    let exec = ExecutionDevice::Accelerator(Arc::clone(&gpu));

    for data_type in [
        DataType::Int8,
        DataType::Uint8,
        DataType::Int16,
        DataType::Uint16,
        DataType::Float32,
    ] {
        for channels in 1..=4u32 {
            let byte_len = 5 * 3 * channels as usize * data_type.size();
            let data: Vec<u8> = (0..byte_len as u32).map(|i| (i * 13 + 7) as u8).collect();
            let image =
                Image::new_2d_with_data(5, 3, data_type, channels, &exec, &data).unwrap();
            assert_eq!(image.up_to_date_locations(), vec![Location::DeviceImage(gpu.id())]);
            let pixels = image.read_host().unwrap();
            assert_eq!(&pixels[..], &data[..], "{data_type} x{channels}");
        }
    }
}

#[test]
#[ignore = "requires a GPU"]
fn buffer_storage_round_trips_unaligned_sizes() {
    let gpu = WgpuDevice::register().unwrap();
    // 3x2 single-channel u8: 6 bytes, deliberately not 4-byte aligned.
    let image = Image::new_2d(3, 2, DataType::Uint8, 1).unwrap();
    {
        let mut pixels = image.write_host().unwrap();
        pixels.copy_from_slice(&[10, 20, 30, 40, 50, 60]);
    }
    drop(image.read_device_buffer(&gpu).unwrap());
    image.free(&ExecutionDevice::Host).unwrap();

    let pixels = image.read_host().unwrap();
    assert_eq!(&pixels[..], &[10, 20, 30, 40, 50, 60]);
}

#[test]
#[ignore = "requires a GPU"]
fn volume_storage_round_trips() {
    let gpu = WgpuDevice::register().unwrap();
    let exec = ExecutionDevice::Accelerator(Arc::clone(&gpu));
    let byte_len = 4 * 4 * 3 * 2 * 2; // 4x4x3, two channels, u16
    let data: Vec<u8> = (0..byte_len as u32).map(|i| i as u8).collect();
    let image =
        Image::new_3d_with_data(4, 4, 3, DataType::Uint16, 2, &exec, &data).unwrap();
    let pixels = image.read_host().unwrap();
    assert_eq!(&pixels[..], &data[..]);
}
