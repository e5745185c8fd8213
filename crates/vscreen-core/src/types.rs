use serde::{Deserialize, Serialize};

// MARK: - DisplayMode

/// Mode announced by the display subsystem on connect and on every mode change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct DisplayMode {
    pub width: u32,
    pub height: u32,
    pub refresh_rate: u32,
    pub bits_per_pixel: u32,
    /// DRM fourcc code (e.g. `XR24`).
    pub pixel_format: u32,
}

impl DisplayMode {
    pub fn new(width: u32, height: u32, refresh_rate: u32, bits_per_pixel: u32, pixel_format: u32) -> Self {
        Self { width, height, refresh_rate, bits_per_pixel, pixel_format }
    }

    /// Size of a full frame in bits. Reallocation is decided on this value alone,
    /// so two modes with different geometry but the same total compare equal.
    pub fn total_bits(&self) -> u64 {
        self.width as u64 * self.height as u64 * self.bits_per_pixel as u64
    }

    pub fn byte_size(&self) -> usize {
        (self.total_bits() / 8) as usize
    }

    pub fn bytes_per_pixel(&self) -> u32 {
        self.bits_per_pixel / 8
    }

    /// Row pitch in bytes; rows are tightly packed.
    pub fn stride(&self) -> u32 {
        self.width * self.bits_per_pixel / 8
    }

    /// True when switching from `self` to `other` needs new buffers.
    pub fn needs_realloc(&self, other: &DisplayMode) -> bool {
        self.total_bits() != other.total_bits()
    }

    pub fn fourcc(&self) -> PixelFormat {
        PixelFormat(self.pixel_format)
    }
}

impl std::fmt::Display for DisplayMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}x{}@{}Hz ({}bpp {})",
            self.width, self.height, self.refresh_rate, self.bits_per_pixel, self.fourcc()
        )
    }
}

// MARK: - PixelFormat

/// DRM fourcc pixel format, four ASCII bytes packed little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelFormat(pub u32);

impl PixelFormat {
    pub const XRGB8888: Self = Self::from_chars(*b"XR24");
    pub const ARGB8888: Self = Self::from_chars(*b"AR24");
    pub const RGB565: Self = Self::from_chars(*b"RG16");

    pub const fn from_chars(c: [u8; 4]) -> Self {
        Self(c[0] as u32 | (c[1] as u32) << 8 | (c[2] as u32) << 16 | (c[3] as u32) << 24)
    }

    pub fn chars(&self) -> [u8; 4] {
        self.0.to_le_bytes()
    }
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for c in self.chars() {
            let c = if c.is_ascii_graphic() || c == b' ' { c as char } else { '?' };
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

// MARK: - Rect

/// Dirty rectangle reported by the display subsystem (exclusive upper bounds).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl Rect {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn area(&self) -> u64 {
        let w = (self.x2 - self.x1).max(0) as u64;
        let h = (self.y2 - self.y1).max(0) as u64;
        w * h
    }
}

impl std::fmt::Display for Rect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}x{}-{}", self.x1, self.x2, self.y1, self.y2)
    }
}

// MARK: - DpmsMode

/// Display power state reported by the compositor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DpmsMode {
    On,
    Standby,
    Suspend,
    Off,
}

impl DpmsMode {
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::On),
            1 => Some(Self::Standby),
            2 => Some(Self::Suspend),
            3 => Some(Self::Off),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_size_and_stride() {
        let mode = DisplayMode::new(1920, 1080, 60, 32, PixelFormat::XRGB8888.0);
        assert_eq!(mode.byte_size(), 1920 * 1080 * 4);
        assert_eq!(mode.stride(), 1920 * 4);
        assert_eq!(mode.bytes_per_pixel(), 4);
    }

    #[test]
    fn realloc_compares_total_bits_only() {
        let a = DisplayMode::new(1920, 1080, 60, 32, PixelFormat::XRGB8888.0);
        let b = DisplayMode::new(1080, 1920, 30, 32, PixelFormat::ARGB8888.0);
        let c = DisplayMode::new(1280, 720, 60, 32, PixelFormat::XRGB8888.0);
        assert!(!a.needs_realloc(&b));
        assert!(a.needs_realloc(&c));
    }

    #[test]
    fn fourcc_display() {
        assert_eq!(PixelFormat::XRGB8888.to_string(), "XR24");
        assert_eq!(PixelFormat(0x0000_0001).to_string(), "????");
        let mode = DisplayMode::new(800, 600, 60, 16, PixelFormat::RGB565.0);
        assert_eq!(mode.to_string(), "800x600@60Hz (16bpp RG16)");
    }

    #[test]
    fn rect_area_and_display() {
        let r = Rect::new(10, 20, 110, 70);
        assert_eq!(r.area(), 100 * 50);
        assert_eq!(r.to_string(), "10-110x20-70");
        // Inverted bounds are empty, not negative.
        assert_eq!(Rect::new(5, 5, 1, 9).area(), 0);
    }

    #[test]
    fn dpms_from_raw() {
        assert_eq!(DpmsMode::from_raw(0), Some(DpmsMode::On));
        assert_eq!(DpmsMode::from_raw(3), Some(DpmsMode::Off));
        assert_eq!(DpmsMode::from_raw(7), None);
    }
}
