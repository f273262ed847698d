//! Typed I/O ports on modules and nodes.
//!
//! Connectors carry the negotiated region of interest, the pixel layout,
//! and the wiring of the DAG. Outputs (write/source) can feed many inputs;
//! inputs (read/sink) have exactly one upstream, recorded in the
//! `connected_mi`/`connected_mc` index pair. We only track where inputs
//! come from; that is also the direction the depth-first walks follow,
//! from sinks back to sources.

use ash::vk;
use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

use crate::alloc::MemHandle;
use crate::token::Token;

pub const MAX_MODULE_CONNECTORS: usize = 10;
pub const MAX_NODE_CONNECTORS: usize = 30;

pub const ROLE_READ: Token = Token::new("read");
pub const ROLE_WRITE: Token = Token::new("write");
pub const ROLE_SOURCE: Token = Token::new("source");
pub const ROLE_SINK: Token = Token::new("sink");

/// Wildcard channel/format on a read or sink connector; resolved to the
/// upstream's concrete tokens when the connection is made.
pub const ANY: Token = Token::new("*");

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ConnectorFlags: u32 {
        /// Read through a bilinear sampler.
        const SMOOTH = 1;
        /// Clear to zero before the kernel writes.
        const CLEAR = 2;
        /// Produced by a raster kernel, not a compute shader.
        const DRAWN = 4;
    }
}

/// Region of interest: full buffer dimensions plus the window actually
/// demanded or produced. Uploaded verbatim (16-byte padded) into the
/// uniform buffer, hence the POD layout.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct Roi {
    pub full_wd: u32,
    pub full_ht: u32,
    pub wd: u32,
    pub ht: u32,
    pub x: u32,
    pub y: u32,
    pub scale: f32,
}

#[derive(Debug, Clone)]
pub struct Connector {
    pub name: Token,
    pub role: Token,
    pub chan: Token,
    pub format: Token,
    pub flags: ConnectorFlags,

    /// Upstream module or node index, or -1. On write/source connectors
    /// this field is repurposed as the live-read count by the
    /// reference-counting pass; outputs cannot know all their readers, so
    /// they store the count instead of a link.
    pub connected_mi: i32,
    pub connected_mc: i32,

    /// Module connectors only: the node (and its connector) this port was
    /// expanded into, filled in by `create_nodes`.
    pub connected_ni: i32,
    pub connected_nc: i32,

    pub roi: Roi,

    // GPU state, bound during the allocation passes. The arena entries may
    // be released again while offsets stay valid for consecutive runs.
    pub mem: Option<MemHandle>,
    pub mem_staging: Option<MemHandle>,
    pub offset: u64,
    pub size: u64,
    pub offset_staging: u64,
    pub size_staging: u64,
    pub image: vk::Image,
    pub image_view: vk::ImageView,
    pub staging: vk::Buffer,
    /// Layout the image currently is in; owned by the output connector
    /// that created the image.
    pub layout: vk::ImageLayout,
}

impl Default for Connector {
    fn default() -> Connector {
        Connector {
            name: Token::default(),
            role: Token::default(),
            chan: Token::default(),
            format: Token::default(),
            flags: ConnectorFlags::empty(),
            connected_mi: -1,
            connected_mc: -1,
            connected_ni: -1,
            connected_nc: -1,
            roi: Roi::default(),
            mem: None,
            mem_staging: None,
            offset: 0,
            size: 0,
            offset_staging: 0,
            size_staging: 0,
            image: vk::Image::null(),
            image_view: vk::ImageView::null(),
            staging: vk::Buffer::null(),
            layout: vk::ImageLayout::UNDEFINED,
        }
    }
}

impl Connector {
    pub fn new(name: Token, role: Token, chan: Token, format: Token) -> Connector {
        Connector {
            name,
            role,
            chan,
            format,
            ..Connector::default()
        }
    }

    pub fn is_input(&self) -> bool {
        self.role == ROLE_READ || self.role == ROLE_SINK
    }

    pub fn is_output(&self) -> bool {
        self.role == ROLE_WRITE || self.role == ROLE_SOURCE
    }

    pub fn is_source(&self) -> bool {
        self.role == ROLE_SOURCE
    }

    pub fn is_sink(&self) -> bool {
        self.role == ROLE_SINK
    }

    /// Storage size of one pixel component, or `None` for formats the
    /// pipeline does not know.
    pub fn bytes_per_pixel(&self) -> Option<u64> {
        match self.format {
            t if t == Token::new("ui32") || t == Token::new("f32") => Some(4),
            t if t == Token::new("ui16") || t == Token::new("f16") => Some(2),
            t if t == Token::new("ui8") => Some(1),
            _ => None,
        }
    }

    /// Channel count from the layout token: one byte per channel, three
    /// promoted to four (no 3-channel storage images), and the CFA layouts
    /// `rggb`/`rgbx` packed as a single channel.
    pub fn channels(&self) -> u32 {
        if self.chan == Token::new("rggb") || self.chan == Token::new("rgbx") {
            return 1;
        }
        match self.chan.len() {
            0 | 1 => 1,
            2 => 2,
            _ => 4,
        }
    }

    pub fn vk_format(&self) -> Option<vk::Format> {
        let c = self.channels();
        let f = match self.format {
            t if t == Token::new("ui32") => match c {
                1 => vk::Format::R32_UINT,
                2 => vk::Format::R32G32_UINT,
                _ => vk::Format::R32G32B32A32_UINT,
            },
            t if t == Token::new("f32") => match c {
                1 => vk::Format::R32_SFLOAT,
                2 => vk::Format::R32G32_SFLOAT,
                _ => vk::Format::R32G32B32A32_SFLOAT,
            },
            t if t == Token::new("f16") => match c {
                1 => vk::Format::R16_SFLOAT,
                2 => vk::Format::R16G16_SFLOAT,
                _ => vk::Format::R16G16B16A16_SFLOAT,
            },
            t if t == Token::new("ui16") => match c {
                1 => vk::Format::R16_UINT,
                2 => vk::Format::R16G16_UINT,
                _ => vk::Format::R16G16B16A16_UINT,
            },
            t if t == Token::new("ui8") => match c {
                1 => vk::Format::R8_UINT,
                2 => vk::Format::R8G8_UINT,
                _ => vk::Format::R8G8B8A8_UINT,
            },
            _ => return None,
        };
        Some(f)
    }

    /// Byte size of the negotiated window.
    pub fn bufsize(&self) -> u64 {
        let bpp = self.bytes_per_pixel().unwrap_or(0);
        self.channels() as u64 * bpp * self.roi.wd as u64 * self.roi.ht as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(chan: &str, format: &str) -> Connector {
        let mut c = Connector::new(
            Token::new("output"),
            ROLE_WRITE,
            Token::new(chan),
            Token::new(format),
        );
        c.roi.wd = 16;
        c.roi.ht = 16;
        c
    }

    #[test]
    fn bayer_counts_one_channel() {
        assert_eq!(conn("rggb", "ui16").channels(), 1);
        assert_eq!(conn("rgbx", "f16").channels(), 1);
        assert_eq!(conn("y", "f16").channels(), 1);
        assert_eq!(conn("rg", "f16").channels(), 2);
        assert_eq!(conn("rgb", "f16").channels(), 4);
        assert_eq!(conn("rgba", "f16").channels(), 4);
    }

    #[test]
    fn bufsize_is_bpp_times_channels_times_window() {
        // 16x16 rggb/ui16: one channel, two bytes
        let c = conn("rggb", "ui16");
        assert_eq!(c.bufsize(), 16 * 16 * 2);

        let mut c = conn("rgb", "f16");
        c.roi.wd = 50;
        c.roi.ht = 50;
        assert_eq!(
            c.bufsize(),
            c.bytes_per_pixel().unwrap() * c.channels() as u64 * 50 * 50
        );
    }

    #[test]
    fn vk_formats() {
        assert_eq!(conn("rggb", "ui16").vk_format(), Some(vk::Format::R16_UINT));
        assert_eq!(
            conn("rgb", "f16").vk_format(),
            Some(vk::Format::R16G16B16A16_SFLOAT)
        );
        assert_eq!(conn("y", "f32").vk_format(), Some(vk::Format::R32_SFLOAT));
        assert_eq!(conn("rgb", "bogus").vk_format(), None);
    }

    #[test]
    fn roi_pod_layout() {
        // uploaded raw into the uniform buffer
        assert_eq!(std::mem::size_of::<Roi>(), 28);
        let roi = Roi {
            full_wd: 1,
            full_ht: 2,
            wd: 3,
            ht: 4,
            x: 5,
            y: 6,
            scale: 1.0,
        };
        let bytes: &[u8] = bytemuck::bytes_of(&roi);
        assert_eq!(&bytes[0..4], &1u32.to_ne_bytes());
        assert_eq!(&bytes[24..28], &1.0f32.to_ne_bytes());
    }
}
