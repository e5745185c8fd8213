//! EDID 1.4 base block builder.
//!
//! Produces the 128-byte identification descriptor handed to the display
//! subsystem at connect time. Only the fields a compositor needs to accept a
//! synthetic digital monitor are filled in: header, packed vendor id,
//! version, basic display parameters and the standard-timing table.
//!
//! ```text
//! 0..8    header 00 FF FF FF FF FF FF 00
//! 8..10   vendor id, 3 × 5-bit letters, big-endian
//! 10..12  product code
//! 18..20  version / revision
//! 20      video input definition
//! 38..54  standard timings, 8 × 2 bytes
//! 127     checksum
//! ```

use serde::{Deserialize, Serialize};

use crate::errors::DescriptorError;

pub const EDID_SIZE: usize = 128;

/// Number of standard-timing entries the base block reserves.
pub const MODE_CAPACITY: usize = 8;

const HEADER: [u8; 8] = [0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x00];
const VENDOR_OFFSET: usize = 8;
const PRODUCT_OFFSET: usize = 10;
const VERSION_OFFSET: usize = 18;
const INPUT_OFFSET: usize = 20;
const TIMINGS_OFFSET: usize = 38;
const CHECKSUM_OFFSET: usize = EDID_SIZE - 1;

const EDID_VERSION: u8 = 1;
const EDID_REVISION: u8 = 4;

// Digital input, 8 bits per colour, DisplayPort.
const INPUT_DIGITAL: u8 = 1 << 7;
const INPUT_DEPTH_8BPC: u8 = 2 << 4;
const INPUT_IFACE_DISPLAYPORT: u8 = 5;

// Standard-timing byte pair meaning "entry not used".
const UNUSED_TIMING: u8 = 0x01;

const MIN_XRES: u32 = (1 + 31) * 8;
const MAX_XRES: u32 = (255 + 31) * 8;
const MIN_REFRESH: u32 = 60;
const MAX_REFRESH: u32 = 60 + 0x3F;

// MARK: - AspectRatio

/// Image aspect ratio of a standard timing (EDID 1.3+ encoding).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AspectRatio {
    #[serde(rename = "16:10")]
    R16_10 = 0,
    #[serde(rename = "4:3")]
    R4_3 = 1,
    #[serde(rename = "5:4")]
    R5_4 = 2,
    #[serde(rename = "16:9")]
    R16_9 = 3,
}

impl AspectRatio {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => Self::R16_10,
            1 => Self::R4_3,
            2 => Self::R5_4,
            _ => Self::R16_9,
        }
    }

    /// Vertical resolution implied by `xres` at this ratio.
    pub fn height_for(self, xres: u32) -> u32 {
        match self {
            Self::R16_10 => xres * 10 / 16,
            Self::R4_3 => xres * 3 / 4,
            Self::R5_4 => xres * 4 / 5,
            Self::R16_9 => xres * 9 / 16,
        }
    }
}

impl std::fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::R16_10 => "16:10",
            Self::R4_3 => "4:3",
            Self::R5_4 => "5:4",
            Self::R16_9 => "16:9",
        };
        f.write_str(s)
    }
}

// MARK: - StandardTiming

/// One decoded standard-timing entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StandardTiming {
    pub xres: u32,
    pub aspect: AspectRatio,
    pub refresh_hz: u32,
}

impl StandardTiming {
    pub fn height(&self) -> u32 {
        self.aspect.height_for(self.xres)
    }
}

// MARK: - Edid

/// Fixed 128-byte identification descriptor. The checksum byte is kept
/// valid after every mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edid {
    buffer: [u8; EDID_SIZE],
    modes: usize,
}

impl Edid {
    /// Start a descriptor for the three-letter PNP vendor id (`A`–`Z`).
    pub fn new(vendor: &str) -> Result<Self, DescriptorError> {
        let letters = vendor_letters(vendor)?;

        let mut buffer = [0u8; EDID_SIZE];
        buffer[..HEADER.len()].copy_from_slice(&HEADER);

        let packed: u16 = letters[0] << 10 | letters[1] << 5 | letters[2];
        buffer[VENDOR_OFFSET..VENDOR_OFFSET + 2].copy_from_slice(&packed.to_be_bytes());
        buffer[PRODUCT_OFFSET] = 1;
        buffer[PRODUCT_OFFSET + 1] = 0;

        buffer[VERSION_OFFSET] = EDID_VERSION;
        buffer[VERSION_OFFSET + 1] = EDID_REVISION;
        buffer[INPUT_OFFSET] = INPUT_DIGITAL | INPUT_DEPTH_8BPC | INPUT_IFACE_DISPLAYPORT;

        buffer[TIMINGS_OFFSET..TIMINGS_OFFSET + 2 * MODE_CAPACITY].fill(UNUSED_TIMING);

        let mut edid = Self { buffer, modes: 0 };
        edid.checksum();
        Ok(edid)
    }

    /// Append a standard timing. Fails once [`MODE_CAPACITY`] entries exist
    /// or when the values cannot be represented.
    pub fn add_mode(&mut self, xres: u32, ratio: AspectRatio, refresh_hz: u32) -> Result<(), DescriptorError> {
        if self.modes >= MODE_CAPACITY {
            return Err(DescriptorError::CapacityExceeded { capacity: MODE_CAPACITY });
        }
        if !(MIN_XRES..=MAX_XRES).contains(&xres) {
            return Err(DescriptorError::ResolutionOutOfRange { xres });
        }
        if !(MIN_REFRESH..=MAX_REFRESH).contains(&refresh_hz) {
            return Err(DescriptorError::RefreshOutOfRange { hz: refresh_hz });
        }

        let at = TIMINGS_OFFSET + 2 * self.modes;
        self.buffer[at] = (xres / 8 - 31) as u8;
        self.buffer[at + 1] = (ratio as u8) << 6 | (refresh_hz - MIN_REFRESH) as u8;
        self.modes += 1;
        self.checksum();
        Ok(())
    }

    pub fn mode_count(&self) -> usize {
        self.modes
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Packed vendor id as stored in bytes 8–9.
    pub fn vendor_id(&self) -> u16 {
        u16::from_be_bytes([self.buffer[VENDOR_OFFSET], self.buffer[VENDOR_OFFSET + 1]])
    }

    fn checksum(&mut self) {
        let sum = self.buffer[..CHECKSUM_OFFSET]
            .iter()
            .fold(0u8, |acc, b| acc.wrapping_add(*b));
        self.buffer[CHECKSUM_OFFSET] = sum.wrapping_neg();
    }
}

/// Decode the standard timing at `index` from raw descriptor bytes.
/// Returns `None` for short input or an unused entry.
pub fn standard_timing(bytes: &[u8], index: usize) -> Option<StandardTiming> {
    if bytes.len() < EDID_SIZE || index >= MODE_CAPACITY {
        return None;
    }
    let at = TIMINGS_OFFSET + 2 * index;
    let (b0, b1) = (bytes[at], bytes[at + 1]);
    if (b0 == UNUSED_TIMING && b1 == UNUSED_TIMING) || b0 == 0 {
        return None;
    }
    Some(StandardTiming {
        xres: (b0 as u32 + 31) * 8,
        aspect: AspectRatio::from_bits(b1 >> 6),
        refresh_hz: (b1 & 0x3F) as u32 + MIN_REFRESH,
    })
}

/// Sum of all bytes modulo 256; zero for a well-formed block.
pub fn block_sum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

fn vendor_letters(vendor: &str) -> Result<[u16; 3], DescriptorError> {
    let invalid = || DescriptorError::InvalidVendor { vendor: vendor.to_owned() };
    let bytes = vendor.as_bytes();
    if bytes.len() != 3 || !bytes.iter().all(u8::is_ascii_uppercase) {
        return Err(invalid());
    }
    Ok([
        (bytes[0] - b'A' + 1) as u16,
        (bytes[1] - b'A' + 1) as u16,
        (bytes[2] - b'A' + 1) as u16,
    ])
}
