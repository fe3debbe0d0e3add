//! Image file loading.

use image::{ImageReader, RgbImage};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImageLoadError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot decode {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: image::ImageError,
    },
    #[error("image {0} is empty")]
    Empty(String),
}

/// Decode an image file into 8-bit RGB.
///
/// The format is sniffed from the content, so a PNG stored under a `.jpg`
/// name still decodes.
pub fn load_rgb(path: &Path) -> Result<RgbImage, ImageLoadError> {
    let display = path.display().to_string();

    let reader = ImageReader::open(path)
        .and_then(|r| r.with_guessed_format())
        .map_err(|source| ImageLoadError::Io { path: display.clone(), source })?;

    let decoded = reader
        .decode()
        .map_err(|source| ImageLoadError::Decode { path: display.clone(), source })?;

    let rgb = decoded.to_rgb8();
    if rgb.width() == 0 || rgb.height() == 0 {
        return Err(ImageLoadError::Empty(display));
    }

    let path = &display;
    tracing::debug!(path = %path, width = rgb.width(), height = rgb.height(), "image loaded");
    Ok(rgb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb};

    #[test]
    fn test_load_png_with_jpg_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reg_V1.jpg");
        let img = RgbImage::from_pixel(8, 6, Rgb([10, 20, 30]));
        img.save_with_format(&path, ImageFormat::Png).unwrap();

        let loaded = load_rgb(&path).unwrap();
        assert_eq!(loaded.dimensions(), (8, 6));
        assert_eq!(loaded.get_pixel(3, 3), &Rgb([10, 20, 30]));
    }

    #[test]
    fn test_missing_file() {
        let err = load_rgb(Path::new("/nonexistent/facegate/img.jpg")).unwrap_err();
        assert!(matches!(err, ImageLoadError::Io { .. }));
    }

    #[test]
    fn test_garbage_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.jpg");
        std::fs::write(&path, b"definitely not an image").unwrap();
        let err = load_rgb(&path).unwrap_err();
        assert!(matches!(err, ImageLoadError::Decode { .. }));
    }
}
