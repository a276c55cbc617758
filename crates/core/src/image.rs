//! Pixel conversion and raw little-endian raster files.
//!
//! FVC frames arrive as bare square rasters without a header; the edge
//! length is recovered from the file size.

use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use ndarray::{Array2, ArrayView2};

/// Numeric pixel types accepted by the denoiser.
pub trait Pixel: Copy + Send + Sync {
    fn to_f32(self) -> f32;
}

macro_rules! impl_pixel {
    ($($t:ty),*) => {
        $(impl Pixel for $t {
            #[inline]
            fn to_f32(self) -> f32 {
                self as f32
            }
        })*
    };
}

impl_pixel!(u8, u16, u32, f32, f64);

pub fn to_f32<P: Pixel>(image: ArrayView2<'_, P>) -> Array2<f32> {
    image.mapv(|p| p.to_f32())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RawFormat {
    #[default]
    U16Le,
    F32Le,
}

impl RawFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::U16Le => 2,
            Self::F32Le => 4,
        }
    }
}

impl fmt::Display for RawFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::U16Le => write!(f, "u16le"),
            Self::F32Le => write!(f, "f32le"),
        }
    }
}

impl FromStr for RawFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "u16le" | "u16" => Ok(Self::U16Le),
            "f32le" | "f32" => Ok(Self::F32Le),
            other => bail!("unknown raw format '{other}' (expected u16le or f32le)"),
        }
    }
}

/// Decode a square raster; the edge length is inferred from `bytes.len()`.
pub fn decode_raw(bytes: &[u8], format: RawFormat) -> Result<Array2<f32>> {
    let bpp = format.bytes_per_pixel();
    if bytes.len() % bpp != 0 {
        bail!("{} bytes is not a whole number of {format} pixels", bytes.len());
    }
    let pixels = bytes.len() / bpp;
    let edge = (pixels as f64).sqrt().round() as usize;
    if edge == 0 || edge * edge != pixels {
        bail!("{pixels} pixels do not form a square raster");
    }

    let values: Vec<f32> = match format {
        RawFormat::U16Le => bytes
            .chunks_exact(2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]).to_f32())
            .collect(),
        RawFormat::F32Le => bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    };
    Ok(Array2::from_shape_vec((edge, edge), values)?)
}

pub fn read_raw(path: &Path, format: RawFormat) -> Result<Array2<f32>> {
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    decode_raw(&bytes, format).with_context(|| format!("invalid {format} raster: {}", path.display()))
}

/// Write `image` row-major as little-endian `f32`.
pub fn write_raw_f32(path: &Path, image: ArrayView2<'_, f32>) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    for value in image.iter() {
        writer.write_all(&value.to_le_bytes())?;
    }
    writer
        .flush()
        .with_context(|| format!("failed to write {}", path.display()))
}
