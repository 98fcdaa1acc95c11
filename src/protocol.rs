//! Wire protocol between capture producers and the broker.
//!
//! Both message kinds are a single discriminant byte followed by a
//! fixed-layout payload (bincode's legacy config: little-endian, fixed-width
//! integers, no padding). `TextureInfo` frames additionally carry 1..=4 file
//! descriptors as `SCM_RIGHTS` ancillary data; the `nfd` field must match the
//! delivered descriptor count exactly.

use ash::vk;
use drm_fourcc::DrmFourcc;
use serde::{Deserialize, Serialize};

use crate::{CaptureError, Result};

/// Rendezvous point. The broker unlinks and rebinds it at startup.
pub const SOCKET_PATH: &str = "/tmp/obs-vkcapture.sock";

pub const DRM_FORMAT_MOD_INVALID: u64 = 0x00ff_ffff_ffff_ffff;

/// Upper bound on the planes (and so file descriptors) of one texture.
pub const MAX_PLANES: usize = 4;

pub const MSG_CLIENT_INFO: u8 = 1;
pub const MSG_TEXTURE_INFO: u8 = 2;

/// Wire size of a `ClientInfo` frame including the discriminant byte.
pub const CLIENT_INFO_SIZE: usize = 1 + 4 + EXE_NAME_LEN + 1;
/// Wire size of a `TextureInfo` frame including the discriminant byte.
pub const TEXTURE_INFO_SIZE: usize = 1 + 3 * 4 + 1 + 1 + 2 * MAX_PLANES * 4 + 8 + 4;

/// The largest frame either side may ever receive.
pub const MAX_FRAME_SIZE: usize = TEXTURE_INFO_SIZE;

const EXE_NAME_LEN: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApiKind {
    Vulkan,
    OpenGl,
}

impl ApiKind {
    pub fn to_wire(self) -> u8 {
        match self {
            ApiKind::Vulkan => 1,
            ApiKind::OpenGl => 2,
        }
    }

    pub fn from_wire(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(ApiKind::Vulkan),
            2 => Some(ApiKind::OpenGl),
            _ => None,
        }
    }
}

/// Producer identity, sent once right after connecting.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub pid: u32,
    /// NUL-padded executable basename, truncated to fit.
    pub exe: [u8; EXE_NAME_LEN],
    pub api: u8,
}

impl ClientInfo {
    pub fn new(pid: u32, exe_name: &str, api: ApiKind) -> Self {
        let mut exe = [0u8; EXE_NAME_LEN];
        let bytes = exe_name.as_bytes();
        let len = bytes.len().min(EXE_NAME_LEN);
        exe[..len].copy_from_slice(&bytes[..len]);
        Self {
            pid,
            exe,
            api: api.to_wire(),
        }
    }

    /// Identity of the calling process.
    pub fn for_current_process(api: ApiKind) -> Self {
        let exe = std::env::current_exe()
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_default();
        Self::new(std::process::id(), &exe, api)
    }

    pub fn exe_name(&self) -> String {
        let end = self.exe.iter().position(|&b| b == 0).unwrap_or(EXE_NAME_LEN);
        String::from_utf8_lossy(&self.exe[..end]).into_owned()
    }

    pub fn api_kind(&self) -> Option<ApiKind> {
        ApiKind::from_wire(self.api)
    }
}

/// Geometry and layout of the exported texture. Accompanied by `nfd` plane
/// file descriptors in the same message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextureInfo {
    pub width: u32,
    pub height: u32,
    /// DRM FourCC, or 0 when the consumer should infer the format.
    pub format: u32,
    pub flip: bool,
    /// Plane count, 1..=4. Must equal the number of fds in the message.
    pub nfd: u8,
    pub strides: [u32; MAX_PLANES],
    pub offsets: [u32; MAX_PLANES],
    /// DRM format modifier, or `DRM_FORMAT_MOD_INVALID`.
    pub modifier: u64,
    /// X11 window id for cursor overlay, 0 when absent.
    pub winid: u32,
}

impl TextureInfo {
    pub fn has_modifier(&self) -> bool {
        self.modifier != DRM_FORMAT_MOD_INVALID
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Message {
    Client(ClientInfo),
    Texture(TextureInfo),
}

impl Message {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let (discriminant, size) = match self {
            Message::Client(_) => (MSG_CLIENT_INFO, CLIENT_INFO_SIZE),
            Message::Texture(_) => (MSG_TEXTURE_INFO, TEXTURE_INFO_SIZE),
        };
        let mut frame = Vec::with_capacity(size);
        frame.push(discriminant);
        match self {
            Message::Client(info) => bincode::serialize_into(&mut frame, info)?,
            Message::Texture(info) => bincode::serialize_into(&mut frame, info)?,
        }
        debug_assert_eq!(frame.len(), size);
        Ok(frame)
    }

    /// Decode one frame. The buffer must hold exactly one message; a size
    /// mismatch is a protocol violation, not a partial read to retry.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        match frame.first() {
            Some(&MSG_CLIENT_INFO) => {
                if frame.len() != CLIENT_INFO_SIZE {
                    return Err(CaptureError::Protocol("client info frame size mismatch"));
                }
                Ok(Message::Client(bincode::deserialize(&frame[1..])?))
            }
            Some(&MSG_TEXTURE_INFO) => {
                if frame.len() != TEXTURE_INFO_SIZE {
                    return Err(CaptureError::Protocol("texture info frame size mismatch"));
                }
                Ok(Message::Texture(bincode::deserialize(&frame[1..])?))
            }
            Some(_) => Err(CaptureError::Protocol("unknown message discriminant")),
            None => Err(CaptureError::Protocol("empty frame")),
        }
    }
}

const FOURCC_ARGB8888: u32 = DrmFourcc::Argb8888 as u32;
const FOURCC_XRGB8888: u32 = DrmFourcc::Xrgb8888 as u32;
const FOURCC_ABGR8888: u32 = DrmFourcc::Abgr8888 as u32;
const FOURCC_XBGR8888: u32 = DrmFourcc::Xbgr8888 as u32;
const FOURCC_ABGR2101010: u32 = DrmFourcc::Abgr2101010 as u32;
const FOURCC_ARGB2101010: u32 = DrmFourcc::Argb2101010 as u32;

/// DRM FourCC for a swapchain format, 0 when there is no stable mapping.
pub fn drm_format_for(format: vk::Format) -> u32 {
    match format {
        vk::Format::B8G8R8A8_UNORM | vk::Format::B8G8R8A8_SRGB => FOURCC_ARGB8888,
        vk::Format::R8G8B8A8_UNORM | vk::Format::R8G8B8A8_SRGB => FOURCC_ABGR8888,
        vk::Format::A2B10G10R10_UNORM_PACK32 => FOURCC_ABGR2101010,
        vk::Format::A2R10G10B10_UNORM_PACK32 => FOURCC_ARGB2101010,
        _ => 0,
    }
}

/// Vulkan format for an incoming FourCC, with an "ignore alpha" marker for
/// the X variants whose alpha channel is undefined.
pub fn vk_format_for(fourcc: u32) -> Option<(vk::Format, bool)> {
    match fourcc {
        FOURCC_ARGB8888 => Some((vk::Format::B8G8R8A8_UNORM, false)),
        FOURCC_XRGB8888 => Some((vk::Format::B8G8R8A8_UNORM, true)),
        FOURCC_ABGR8888 => Some((vk::Format::R8G8B8A8_UNORM, false)),
        FOURCC_XBGR8888 => Some((vk::Format::R8G8B8A8_UNORM, true)),
        FOURCC_ABGR2101010 => Some((vk::Format::A2B10G10R10_UNORM_PACK32, false)),
        FOURCC_ARGB2101010 => Some((vk::Format::A2R10G10B10_UNORM_PACK32, false)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texture_info() -> TextureInfo {
        TextureInfo {
            width: 1920,
            height: 1080,
            format: drm_format_for(vk::Format::B8G8R8A8_UNORM),
            flip: false,
            nfd: 1,
            strides: [7680, 0, 0, 0],
            offsets: [0; 4],
            modifier: DRM_FORMAT_MOD_INVALID,
            winid: 0,
        }
    }

    #[test]
    fn frame_sizes_match_the_constants() {
        let client = Message::Client(ClientInfo::new(4321, "game", ApiKind::Vulkan));
        assert_eq!(client.encode().unwrap().len(), CLIENT_INFO_SIZE);

        let texture = Message::Texture(texture_info());
        assert_eq!(texture.encode().unwrap().len(), TEXTURE_INFO_SIZE);
    }

    #[test]
    fn round_trips() {
        let info = ClientInfo::new(77, "vkcube", ApiKind::OpenGl);
        let frame = Message::Client(info).encode().unwrap();
        assert_eq!(frame[0], MSG_CLIENT_INFO);
        match Message::decode(&frame).unwrap() {
            Message::Client(back) => {
                assert_eq!(back, info);
                assert_eq!(back.exe_name(), "vkcube");
                assert_eq!(back.api_kind(), Some(ApiKind::OpenGl));
            }
            other => panic!("decoded {other:?}"),
        }

        let info = texture_info();
        let frame = Message::Texture(info).encode().unwrap();
        assert_eq!(frame[0], MSG_TEXTURE_INFO);
        assert_eq!(Message::decode(&frame).unwrap(), Message::Texture(info));
    }

    #[test]
    fn exe_name_is_truncated_not_rejected() {
        let long = "a".repeat(100);
        let info = ClientInfo::new(1, &long, ApiKind::Vulkan);
        assert_eq!(info.exe_name().len(), 32);
    }

    #[test]
    fn rejects_malformed_frames() {
        assert!(Message::decode(&[]).is_err());
        assert!(Message::decode(&[9, 0, 0]).is_err());

        let mut frame = Message::Texture(texture_info()).encode().unwrap();
        frame.truncate(TEXTURE_INFO_SIZE - 1);
        assert!(Message::decode(&frame).is_err());

        let mut frame = Message::Client(ClientInfo::new(1, "x", ApiKind::Vulkan))
            .encode()
            .unwrap();
        frame.push(0);
        assert!(Message::decode(&frame).is_err());
    }

    #[test]
    fn fourcc_mapping_is_symmetric_for_exported_formats() {
        for format in [
            vk::Format::B8G8R8A8_UNORM,
            vk::Format::R8G8B8A8_UNORM,
            vk::Format::A2B10G10R10_UNORM_PACK32,
        ] {
            let fourcc = drm_format_for(format);
            assert_ne!(fourcc, 0);
            let (back, ignore_alpha) = vk_format_for(fourcc).unwrap();
            assert_eq!(back, format);
            assert!(!ignore_alpha);
        }
        assert_eq!(drm_format_for(vk::Format::D32_SFLOAT), 0);
        assert!(vk_format_for(0).is_none());
    }
}
