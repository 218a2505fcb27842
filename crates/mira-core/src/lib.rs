//! Core vocabulary for the MIRA imaging pipeline.
//!
//! This crate holds the pieces every other MIRA crate speaks in terms of:
//!
//! - [`error::MiraError`] and the crate-wide [`Result`] alias
//! - [`types::DataType`] and the image descriptors shared between the data
//!   layer and the device layer
//! - [`device::DeviceBackend`], the narrow trait an accelerator implements,
//!   together with [`device::AcceleratorDevice`] and
//!   [`device::ExecutionDevice`]
//! - [`software::SoftwareDevice`], a RAM-backed backend used as the reference
//!   implementation and as the test double for everything above the device
//!   layer
//!
//! Higher layers (`mira-image`, `mira-stream`) depend only on this crate,
//! never on a concrete accelerator backend.

pub mod device;
pub mod error;
pub mod software;
pub mod types;

pub use device::{AcceleratorDevice, DeviceBackend, DeviceCapabilities, DeviceId, ExecutionDevice};
pub use error::{MiraError, Result};
pub use types::{DataType, ImageDescriptor, ImageLayout};
