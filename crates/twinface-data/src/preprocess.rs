//! Image preprocessing — decode, RGB conversion, resize, [0, 1] scaling.

use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array3;
use std::path::{Path, PathBuf};
use thiserror::Error;
use twinface_core::{EmbeddingSpec, Image};

/// Side length the canonical network expects.
pub const DEFAULT_IMAGE_SIZE: u32 = 100;
const CHANNELS: usize = 3;

#[derive(Error, Debug)]
pub enum PreprocessError {
    #[error("failed to decode image {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("network input must have 3 channels, got {0}")]
    UnsupportedChannels(usize),
    #[error("target size must be non-zero")]
    ZeroSize,
    #[error("target size {width}x{height} does not fit in u32")]
    SizeTooLarge { width: usize, height: usize },
}

/// Turns image files into network-ready [`Image`] tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preprocessor {
    width: u32,
    height: u32,
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self {
            width: DEFAULT_IMAGE_SIZE,
            height: DEFAULT_IMAGE_SIZE,
        }
    }
}

impl Preprocessor {
    pub fn new(width: u32, height: u32) -> Result<Self, PreprocessError> {
        if width == 0 || height == 0 {
            return Err(PreprocessError::ZeroSize);
        }
        Ok(Self { width, height })
    }

    /// Match the input shape of `spec`; only RGB inputs can be produced.
    pub fn for_spec(spec: &EmbeddingSpec) -> Result<Self, PreprocessError> {
        if spec.input_channels != CHANNELS {
            return Err(PreprocessError::UnsupportedChannels(spec.input_channels));
        }
        let too_large = || PreprocessError::SizeTooLarge {
            width: spec.input_width,
            height: spec.input_height,
        };
        let width = u32::try_from(spec.input_width).map_err(|_| too_large())?;
        let height = u32::try_from(spec.input_height).map_err(|_| too_large())?;
        Self::new(width, height)
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Decode `path` and convert it to a `height × width × 3` tensor.
    pub fn load(&self, path: &Path) -> Result<Image, PreprocessError> {
        let decoded = image::open(path).map_err(|source| PreprocessError::Decode {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::trace!(
            path = %path.display(),
            width = decoded.width(),
            height = decoded.height(),
            "image decoded"
        );
        Ok(self.process(&decoded.to_rgb8()))
    }

    /// Resize (bilinear) and scale an already decoded RGB image.
    pub fn process(&self, rgb: &RgbImage) -> Image {
        let resized = if rgb.dimensions() == (self.width, self.height) {
            rgb.clone()
        } else {
            image::imageops::resize(rgb, self.width, self.height, FilterType::Triangle)
        };

        let (w, h) = (self.width as usize, self.height as usize);
        let pixels = Array3::from_shape_fn((h, w, CHANNELS), |(y, x, c)| {
            resized.get_pixel(x as u32, y as u32).0[c] as f32 / 255.0
        });
        Image::new(pixels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_process_shape_and_scaling() {
        let rgb = RgbImage::from_pixel(40, 30, Rgb([255, 0, 51]));
        let img = Preprocessor::default().process(&rgb);
        assert_eq!(img.shape(), (100, 100, 3));
        assert!((img.pixels[[0, 0, 0]] - 1.0).abs() < 1e-6);
        assert_eq!(img.pixels[[50, 50, 1]], 0.0);
        assert!((img.pixels[[99, 99, 2]] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_values_within_unit_interval() {
        let rgb = RgbImage::from_fn(17, 23, |x, y| Rgb([(x * 15) as u8, (y * 11) as u8, 200]));
        let img = Preprocessor::new(9, 7).unwrap().process(&rgb);
        assert_eq!(img.shape(), (7, 9, 3));
        assert!(img.pixels.iter().all(|&v| (0.0..=1.0).contains(&v)));
    }

    #[test]
    fn test_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("face.png");
        RgbImage::from_pixel(8, 8, Rgb([0, 128, 255])).save(&path).unwrap();

        let img = Preprocessor::new(4, 4).unwrap().load(&path).unwrap();
        assert_eq!(img.shape(), (4, 4, 3));
        assert!((img.pixels[[2, 2, 1]] - 128.0 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn test_undecodable_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.jpg");
        std::fs::write(&path, b"not an image").unwrap();

        match Preprocessor::default().load(&path) {
            Err(PreprocessError::Decode { path: p, .. }) => assert_eq!(p, path),
            other => panic!("expected decode error, got {other:?}"),
        }
    }

    #[test]
    fn test_for_spec() {
        let p = Preprocessor::for_spec(&EmbeddingSpec::default()).unwrap();
        assert_eq!(p.size(), (100, 100));

        let gray = EmbeddingSpec {
            input_channels: 1,
            ..EmbeddingSpec::default()
        };
        assert!(matches!(
            Preprocessor::for_spec(&gray),
            Err(PreprocessError::UnsupportedChannels(1))
        ));
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_for_spec_size_beyond_u32() {
        let wide = EmbeddingSpec {
            input_width: u32::MAX as usize + 1,
            ..EmbeddingSpec::default()
        };
        match Preprocessor::for_spec(&wide) {
            Err(PreprocessError::SizeTooLarge { width, height }) => {
                assert_eq!(width, u32::MAX as usize + 1);
                assert_eq!(height, 100);
            }
            other => panic!("expected size error, got {other:?}"),
        }
    }
}
