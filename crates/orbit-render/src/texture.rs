// SPDX-License-Identifier: CEPL-1.0
use crate::RenderError;
use anyhow::Result;
use std::path::Path;
use tracing::debug;

/// Decoded RGBA8 pixels, rows top to bottom.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextureData {
    width: u32,
    height: u32,
    rgba: Vec<u8>,
}

impl TextureData {
    pub fn from_rgba8(width: u32, height: u32, rgba: Vec<u8>) -> Result<Self, RenderError> {
        let want = width as usize * height as usize * 4;
        if width == 0 || height == 0 || rgba.len() != want {
            return Err(RenderError::InvalidTexture(format!(
                "texture {width}x{height} needs {want} bytes, got {}",
                rgba.len()
            )));
        }
        Ok(Self {
            width,
            height,
            rgba,
        })
    }

    /// Decodes any format the `image` crate understands and converts to RGBA8.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let img = image::open(path)
            .map_err(|e| RenderError::asset(path, e))?
            .into_rgba8();
        let (width, height) = img.dimensions();
        debug!(path = %path.display(), width, height, "texture decoded");
        Ok(Self::from_rgba8(width, height, img.into_raw())
            .map_err(|e| RenderError::asset(path, e))?)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.rgba
    }

    pub fn byte_len(&self) -> u64 {
        self.rgba.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn png_decodes_to_rgba8() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tex.png");
        let mut img = image::RgbImage::new(2, 3);
        img.put_pixel(1, 2, image::Rgb([10, 20, 30]));
        img.save(&path).unwrap();

        let tex = TextureData::load(&path).unwrap();
        assert_eq!((tex.width(), tex.height()), (2, 3));
        assert_eq!(tex.byte_len(), 2 * 3 * 4);
        // alpha is filled in for RGB sources
        let last = &tex.pixels()[tex.pixels().len() - 4..];
        assert_eq!(last, &[10, 20, 30, 255]);
    }

    #[test]
    fn garbage_file_is_asset_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.png");
        std::fs::write(&path, b"not a png").unwrap();
        let err = TextureData::load(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RenderError>(),
            Some(RenderError::Asset { .. })
        ));
    }

    #[test]
    fn raw_size_must_match() {
        assert!(TextureData::from_rgba8(1, 1, vec![0; 4]).is_ok());
        assert!(TextureData::from_rgba8(2, 1, vec![0; 4]).is_err());
        assert!(TextureData::from_rgba8(0, 0, Vec::new()).is_err());
    }
}
