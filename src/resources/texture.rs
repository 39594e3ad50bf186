//! Host-side texture data: decoding, procedural textures and mip generation

use crate::backend::types::*;
use image::{imageops::FilterType, DynamicImage, GenericImageView, RgbaImage};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TextureError {
    #[error("Failed to decode image: {0}")]
    Decode(#[from] image::ImageError),

    #[error("Invalid texture data: {0}")]
    InvalidData(String),
}

/// Loaded texture data, every mip level of every array layer
#[derive(Debug, Clone, PartialEq)]
pub struct TextureData {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub array_layers: u32,
    pub mip_levels: u32,
    /// Indexed by `array_layer * mip_levels + mip_level`, tightly packed rows
    pub subresources: Vec<Vec<u8>>,
}

impl TextureData {
    /// Single-level RGBA8 texture from raw texels
    pub fn from_rgba8(
        name: &str,
        width: u32,
        height: u32,
        texels: Vec<u8>,
    ) -> Result<Self, TextureError> {
        if width == 0 || height == 0 || texels.len() != (width * height * 4) as usize {
            return Err(TextureError::InvalidData(format!(
                "'{}': {} bytes for {}x{} RGBA8",
                name,
                texels.len(),
                width,
                height
            )));
        }
        Ok(Self {
            name: name.to_string(),
            width,
            height,
            format: TextureFormat::Rgba8UnormSrgb,
            array_layers: 1,
            mip_levels: 1,
            subresources: vec![texels],
        })
    }

    /// Load texture from file; the path is the texture's name
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, TextureError> {
        let path = path.as_ref();
        let img = image::open(path)?;
        Self::from_image(img, &path.to_string_lossy())
    }

    /// Load texture from encoded bytes
    pub fn from_bytes(bytes: &[u8], name: &str) -> Result<Self, TextureError> {
        let img = image::load_from_memory(bytes)?;
        Self::from_image(img, name)
    }

    fn from_image(img: DynamicImage, name: &str) -> Result<Self, TextureError> {
        let (width, height) = img.dimensions();
        Self::from_rgba8(name, width, height, img.to_rgba8().into_raw())
    }

    /// Stack equally sized single-level textures into one array texture
    pub fn array(name: &str, layers: Vec<TextureData>) -> Result<Self, TextureError> {
        let Some(first) = layers.first() else {
            return Err(TextureError::InvalidData(format!("'{}' has no layers", name)));
        };
        let (width, height, format) = (first.width, first.height, first.format);
        if layers
            .iter()
            .any(|l| l.width != width || l.height != height || l.format != format || l.mip_levels != 1)
        {
            return Err(TextureError::InvalidData(format!(
                "'{}' layers differ in size, format or mip count",
                name
            )));
        }
        Ok(Self {
            name: name.to_string(),
            width,
            height,
            format,
            array_layers: layers.len() as u32,
            mip_levels: 1,
            subresources: layers.into_iter().flat_map(|l| l.subresources).collect(),
        })
    }

    /// Create a solid color texture
    pub fn solid_color(color: [u8; 4], name: &str) -> Self {
        Self {
            name: name.to_string(),
            width: 1,
            height: 1,
            format: TextureFormat::Rgba8UnormSrgb,
            array_layers: 1,
            mip_levels: 1,
            subresources: vec![color.to_vec()],
        }
    }

    /// Create a default white texture
    pub fn white() -> Self {
        Self::solid_color([255, 255, 255, 255], "white")
    }

    /// Create a default normal map (pointing up)
    pub fn default_normal() -> Self {
        // (0, 0, 1) in tangent space, encoded as (0.5, 0.5, 1.0)
        Self::solid_color([128, 128, 255, 255], "default_normal")
    }

    /// Create a checkerboard texture with 8-texel squares
    pub fn checkerboard(name: &str, size: u32, color1: [u8; 4], color2: [u8; 4]) -> Self {
        let mut data = Vec::with_capacity((size * size * 4) as usize);
        for y in 0..size {
            for x in 0..size {
                let is_even = ((x / 8) + (y / 8)) % 2 == 0;
                data.extend_from_slice(if is_even { &color1 } else { &color2 });
            }
        }
        Self {
            name: name.to_string(),
            width: size,
            height: size,
            format: TextureFormat::Rgba8UnormSrgb,
            array_layers: 1,
            mip_levels: 1,
            subresources: vec![data],
        }
    }

    /// Full mip chain down to 1x1, each level resized from the base level
    pub fn with_mips(mut self) -> Result<Self, TextureError> {
        if self.mip_levels > 1 {
            return Ok(self);
        }
        if !matches!(
            self.format,
            TextureFormat::Rgba8Unorm | TextureFormat::Rgba8UnormSrgb
        ) {
            return Err(TextureError::InvalidData(format!(
                "'{}': mip generation needs RGBA8, got {:?}",
                self.name, self.format
            )));
        }
        let levels = 32 - self.width.max(self.height).leading_zeros();
        let desc = self.descriptor();
        let mut subresources = Vec::with_capacity((levels * self.array_layers) as usize);
        for base in &self.subresources {
            let image = RgbaImage::from_raw(self.width, self.height, base.clone()).ok_or_else(|| {
                TextureError::InvalidData(format!("'{}' base level size mismatch", self.name))
            })?;
            subresources.push(base.clone());
            for mip in 1..levels {
                let (w, h) = desc.mip_extent(mip);
                subresources.push(image::imageops::resize(&image, w, h, FilterType::Triangle).into_raw());
            }
        }
        self.mip_levels = levels;
        self.subresources = subresources;
        Ok(self)
    }

    /// Descriptor of a sampled texture holding this data
    pub fn descriptor(&self) -> TextureDescriptor {
        TextureDescriptor {
            label: Some(self.name.clone()),
            width: self.width,
            height: self.height,
            array_layers: self.array_layers,
            mip_levels: self.mip_levels,
            format: self.format,
            usage: TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_DST | TextureUsage::COPY_SRC,
        }
    }

    pub fn subresource(&self, subresource: TextureSubresource) -> Option<&[u8]> {
        if subresource.mip_level >= self.mip_levels || subresource.array_layer >= self.array_layers {
            return None;
        }
        self.subresources
            .get((subresource.array_layer * self.mip_levels + subresource.mip_level) as usize)
            .map(Vec::as_slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mip_chain_reaches_one_texel() {
        let texture = TextureData::checkerboard("checker", 16, [255; 4], [0, 0, 0, 255])
            .with_mips()
            .unwrap();
        assert_eq!(texture.mip_levels, 5);
        let sizes: Vec<usize> = texture.subresources.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![1024, 256, 64, 16, 4]);
        assert_eq!(texture.descriptor().footprint(), 1364);
    }

    #[test]
    fn rejects_mismatched_texel_count() {
        assert!(matches!(
            TextureData::from_rgba8("bad", 2, 2, vec![0; 15]),
            Err(TextureError::InvalidData(_))
        ));
    }

    #[test]
    fn array_layers_are_stored_layer_major() {
        let array = TextureData::array(
            "pair",
            vec![
                TextureData::solid_color([1, 2, 3, 4], "a"),
                TextureData::solid_color([5, 6, 7, 8], "b"),
            ],
        )
        .unwrap();
        assert_eq!(array.array_layers, 2);
        let second = TextureSubresource {
            mip_level: 0,
            array_layer: 1,
        };
        assert_eq!(array.subresource(second), Some(&[5u8, 6, 7, 8][..]));
    }

    #[test]
    fn decodes_png_bytes() {
        let mut png = Vec::new();
        let image = RgbaImage::from_pixel(2, 2, image::Rgba([10, 20, 30, 255]));
        DynamicImage::ImageRgba8(image)
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageOutputFormat::Png)
            .unwrap();
        let texture = TextureData::from_bytes(&png, "encoded").unwrap();
        assert_eq!((texture.width, texture.height), (2, 2));
        assert_eq!(&texture.subresources[0][..4], &[10, 20, 30, 255]);
    }
}
