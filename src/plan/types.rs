//! Closed enumerations and value types carried by a [`BuildPlan`](super::BuildPlan).

use std::fmt;

use serde::Serialize;

use crate::error::BuildError;

const MIB: u64 = 1024 * 1024;
/// Largest image the builder accepts (16 TiB).
pub const MAX_IMAGE_BYTES: u64 = 16 * 1024 * 1024 * MIB;

/// Debian architecture a profile targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    Amd64,
    Arm64,
    Armhf,
    Mips,
    Mipsel,
}

impl Architecture {
    pub const ALL: [Architecture; 5] = [
        Architecture::Amd64,
        Architecture::Arm64,
        Architecture::Armhf,
        Architecture::Mips,
        Architecture::Mipsel,
    ];

    /// Accepts Debian names plus the kernel spellings `x86_64`, `aarch64` and `arm`.
    pub fn parse(value: &str) -> Result<Self, BuildError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "amd64" | "x86_64" => Ok(Architecture::Amd64),
            "arm64" | "aarch64" => Ok(Architecture::Arm64),
            "armhf" | "arm" => Ok(Architecture::Armhf),
            "mips" => Ok(Architecture::Mips),
            "mipsel" => Ok(Architecture::Mipsel),
            _ => Err(BuildError::UnknownArchitecture(value.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Architecture::Amd64 => "amd64",
            Architecture::Arm64 => "arm64",
            Architecture::Armhf => "armhf",
            Architecture::Mips => "mips",
            Architecture::Mipsel => "mipsel",
        }
    }

    pub fn default_kernel_package(&self) -> &'static str {
        match self {
            Architecture::Amd64 => "linux-image-amd64",
            Architecture::Arm64 => "linux-image-arm64",
            Architecture::Armhf => "linux-image-armmp",
            Architecture::Mips | Architecture::Mipsel => "linux-image-4kc-malta",
        }
    }

    /// Name of the architecture as `std::env::consts::ARCH` reports it.
    pub fn host_name(&self) -> &'static str {
        match self {
            Architecture::Amd64 => "x86_64",
            Architecture::Arm64 => "aarch64",
            Architecture::Armhf => "arm",
            Architecture::Mips => "mips",
            Architecture::Mipsel => "mips",
        }
    }

    /// True when building needs binfmt emulation on this host.
    pub fn is_foreign(&self) -> bool {
        self.host_name() != std::env::consts::ARCH
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Size of the final disk image in bytes, always a whole number of MiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ImageSize(u64);

impl ImageSize {
    /// Parse sizes like `512M`, `4G`, `1.5G` or `1T`. Fractions round up to a MiB.
    /// Anything above [`MAX_IMAGE_BYTES`] is rejected.
    pub fn parse(value: &str) -> Option<Self> {
        let trimmed = value.trim();
        let lower = trimmed.to_ascii_lowercase();
        let unit_pos = lower.find(|c: char| c.is_ascii_alphabetic())?;
        let (number, unit) = lower.split_at(unit_pos);
        let multiplier: u64 = match unit.trim_end_matches("ib").trim_end_matches('b') {
            "k" => 1024,
            "m" => MIB,
            "g" => 1024 * MIB,
            "t" => 1024 * 1024 * MIB,
            _ => return None,
        };
        let number: f64 = number.trim().parse().ok()?;
        if !number.is_finite() || number <= 0.0 {
            return None;
        }
        let bytes = (number * multiplier as f64).ceil();
        if bytes > MAX_IMAGE_BYTES as f64 {
            return None;
        }
        let rounded = (bytes as u64).div_ceil(MIB).checked_mul(MIB)?;
        Some(ImageSize(rounded))
    }

    pub fn bytes(&self) -> u64 {
        self.0
    }

    pub fn mib(&self) -> u64 {
        self.0 / MIB
    }
}

impl fmt::Display for ImageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mib = self.mib();
        if mib % 1024 == 0 {
            write!(f, "{}G", mib / 1024)
        } else {
            write!(f, "{}M", mib)
        }
    }
}

/// Root filesystem written into the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Filesystem {
    Ext4,
    Btrfs,
}

impl Filesystem {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ext4" => Some(Filesystem::Ext4),
            "btrfs" => Some(Filesystem::Btrfs),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Filesystem::Ext4 => "ext4",
            Filesystem::Btrfs => "btrfs",
        }
    }
}

/// Compressor applied to the raw image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    Xz,
    Gzip,
    Zstd,
    None,
}

impl Compression {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "xz" => Some(Compression::Xz),
            "gzip" | "gz" => Some(Compression::Gzip),
            "zstd" | "zst" => Some(Compression::Zstd),
            "none" => Some(Compression::None),
            _ => None,
        }
    }

    /// File extension appended to the image name, if any.
    pub fn extension(&self) -> Option<&'static str> {
        match self {
            Compression::Xz => Some("xz"),
            Compression::Gzip => Some("gz"),
            Compression::Zstd => Some("zst"),
            Compression::None => None,
        }
    }
}
