use std::{fmt, num::NonZeroU32, str::FromStr};

/// Four-character code describing a pixel format.
///
/// # Example
/// ```rust
/// use aperture_core::prelude::FourCc;
///
/// let fcc = FourCc::new(*b"YUYV");
/// assert_eq!(fcc.to_string(), "YUYV");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCc([u8; 4]);

impl FourCc {
    /// Construct from raw bytes.
    pub const fn new(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    /// Little-endian u32 encoding.
    pub fn to_u32(self) -> u32 {
        u32::from_le_bytes(self.0)
    }

    /// Try to convert to a printable string.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }
}

impl From<u32> for FourCc {
    fn from(value: u32) -> Self {
        Self(value.to_le_bytes())
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(s) = self.as_str() {
            write!(f, "{s}")
        } else {
            write!(f, "0x{:08x}", self.to_u32())
        }
    }
}

impl FromStr for FourCc {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() != 4 {
            return Err("fourcc must be four ASCII bytes".into());
        }
        let mut arr = [0u8; 4];
        arr.copy_from_slice(bytes);
        Ok(FourCc(arr))
    }
}

/// Resolution of a frame.
///
/// Parses from `WIDTHxHEIGHT` strings, which is how resolutions arrive from
/// command lines and config files.
///
/// # Example
/// ```rust
/// use aperture_core::prelude::Resolution;
///
/// let res: Resolution = "640x480".parse().unwrap();
/// assert_eq!(res.width.get(), 640);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Resolution {
    /// Width in pixels (non-zero).
    pub width: NonZeroU32,
    /// Height in pixels (non-zero).
    pub height: NonZeroU32,
}

impl Resolution {
    /// Create a resolution, returning `None` if width or height are zero.
    pub fn new(width: u32, height: u32) -> Option<Self> {
        Some(Self {
            width: NonZeroU32::new(width)?,
            height: NonZeroU32::new(height)?,
        })
    }

    /// Pixel count, useful for nearest-size comparisons.
    pub fn area(&self) -> u64 {
        self.width.get() as u64 * self.height.get() as u64
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("expected WxH, got {s:?}"))?;
        let width: u32 = w.parse().map_err(|_| format!("bad width {w:?}"))?;
        let height: u32 = h.parse().map_err(|_| format!("bad height {h:?}"))?;
        Resolution::new(width, height).ok_or_else(|| "resolution must be non-zero".into())
    }
}

/// Basic color space hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ColorSpace {
    /// Standard sRGB.
    Srgb,
    /// Rec. 709.
    Bt709,
    /// Rec. 2020.
    Bt2020,
    /// Unspecified/unknown.
    Unknown,
}

/// Media format including code and geometry.
///
/// # Example
/// ```rust
/// use aperture_core::prelude::{ColorSpace, FourCc, MediaFormat, Resolution};
///
/// let res = Resolution::new(1920, 1080).unwrap();
/// let fmt = MediaFormat::new(FourCc::new(*b"RG24"), res, ColorSpace::Srgb);
/// assert_eq!(fmt.code.to_string(), "RG24");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MediaFormat {
    /// FourCc code describing pixel layout.
    pub code: FourCc,
    /// Resolution of the frame.
    pub resolution: Resolution,
    /// Color space hint.
    pub color: ColorSpace,
}

impl MediaFormat {
    /// Build a new format.
    pub fn new(code: FourCc, resolution: Resolution, color: ColorSpace) -> Self {
        Self {
            code,
            resolution,
            color,
        }
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for FourCc {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        // Prefer string encoding so decoding does not rely on `deserialize_any`.
        let encoded = self.as_str().unwrap_or("FFFF");
        serializer.serialize_str(encoded)
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for FourCc {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct FourCcVisitor;

        impl<'de> serde::de::Visitor<'de> for FourCcVisitor {
            type Value = FourCc;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a 4-character FourCc string")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                FourCc::from_str(v).map_err(E::custom)
            }
        }

        deserializer.deserialize_str(FourCcVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_display_roundtrip() {
        let fcc: FourCc = "RG24".parse().unwrap();
        assert_eq!(fcc, FourCc::new(*b"RG24"));
        assert_eq!(fcc.to_string(), "RG24");
    }

    #[test]
    fn fourcc_rejects_wrong_length() {
        assert!("RGB".parse::<FourCc>().is_err());
        assert!("RGB24".parse::<FourCc>().is_err());
    }

    #[test]
    fn resolution_parse() {
        let res: Resolution = "1280x720".parse().unwrap();
        assert_eq!(res.width.get(), 1280);
        assert_eq!(res.height.get(), 720);
        assert!("1280x0".parse::<Resolution>().is_err());
        assert!("720p".parse::<Resolution>().is_err());
    }
}
