//! Zero-copy capture of Vulkan swapchains over DMA-BUF.
//!
//! The crate has two halves that meet on a UNIX socket:
//!
//! * a Vulkan **layer** (built as a `cdylib`) that is loaded into a graphics
//!   application, copies every presented backbuffer into an exportable image
//!   and hands the consumer a DMA-BUF file descriptor for it, and
//! * a **broker** (library API) embedded in the recording application that
//!   accepts producer connections, tracks their shared textures and surfaces
//!   the selected one to the host's renderer.
//!
//! The wire protocol between the two lives in [`protocol`]; file descriptors
//! travel as `SCM_RIGHTS` ancillary data.

pub mod broker;
pub mod dispatch;
pub mod export;
pub mod layer;
pub mod producer;
pub mod protocol;
pub mod registry;
pub mod source;

use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;

pub use broker::{Broker, Client};
pub use protocol::{ApiKind, ClientInfo, Message, TextureInfo, SOCKET_PATH};
pub use source::{CaptureSource, ImportedTexture, SourceSettings, TextureImporter, VulkanImporter};

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("vulkan call failed: {0}")]
    Vulkan(#[from] ash::vk::Result),

    #[error("socket operation failed: {0}")]
    Socket(#[from] nix::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wire codec failure: {0}")]
    Codec(#[from] bincode::Error),

    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    #[error("no usable memory type for the export image")]
    NoMemoryType,

    #[error("unsupported DRM format {0:#010x}")]
    UnsupportedFormat(u32),

    #[error("not connected to the capture broker")]
    NotConnected,
}

pub type Result<T> = std::result::Result<T, CaptureError>;

/// Lock a mutex, ignoring poisoning. The guarded state stays consistent on
/// panic-unwind because every writer restores its invariants before touching
/// anything fallible.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
