//! Pixel encodings and negotiated frame geometry

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("pixel format must be exactly 4 ASCII characters, got {0:?}")]
pub struct InvalidFourCc(pub String);

/// Four-character pixel encoding code, packed little-endian into a `u32`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PixelFormat(u32);

impl PixelFormat {
    /// 16-bit RGB, 5:6:5
    pub const RGB565: PixelFormat = PixelFormat::from_bytes(*b"RGBP");

    /// Packed YUV 4:2:2
    pub const YUYV: PixelFormat = PixelFormat::from_bytes(*b"YUYV");

    pub const fn from_bytes(code: [u8; 4]) -> Self {
        Self(u32::from_le_bytes(code))
    }

    pub const fn from_u32(code: u32) -> Self {
        Self(code)
    }

    pub const fn to_bytes(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Bytes per pixel for the packed formats we know, `None` otherwise
    pub fn bytes_per_pixel(self) -> Option<u32> {
        match self {
            Self::RGB565 | Self::YUYV => Some(2),
            _ => None,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.to_bytes() {
            let c = if byte.is_ascii_graphic() || byte == b' ' {
                byte as char
            } else {
                '?'
            };
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}

impl FromStr for PixelFormat {
    type Err = InvalidFourCc;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes: [u8; 4] = s
            .as_bytes()
            .try_into()
            .map_err(|_| InvalidFourCc(s.to_string()))?;

        if !bytes.iter().all(u8::is_ascii) {
            return Err(InvalidFourCc(s.to_string()));
        }

        Ok(Self::from_bytes(bytes))
    }
}

impl TryFrom<String> for PixelFormat {
    type Error = InvalidFourCc;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PixelFormat> for String {
    fn from(value: PixelFormat) -> Self {
        value.to_string()
    }
}

/// Frame geometry exchanged with a video source
///
/// `pitch` is the number of bytes per row and is decided by the device; a request
/// may leave it at 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoFormat {
    pub pixel_format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
}

impl VideoFormat {
    pub fn new(pixel_format: PixelFormat, width: u32, height: u32, pitch: u32) -> Self {
        Self {
            pixel_format,
            width,
            height,
            pitch,
        }
    }

    /// Bytes needed to hold one frame
    pub fn frame_size(&self) -> usize {
        self.pitch as usize * self.height as usize
    }
}

impl fmt::Display for VideoFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}x{} (pitch {})",
            self.pixel_format, self.width, self.height, self.pitch
        )
    }
}
