use crate::error::ThumbnailError;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageError, ImageReader};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Thumbnails are stored as JPEG with tuned quality for compact rows.
pub const THUMB_JPEG_QUALITY_DEFAULT: u8 = 90;
const THUMB_FILTER: FilterType = FilterType::Lanczos3;
const THUMB_BUFFER_CAPACITY: usize = 64 * 1024;

/// Bounding box a thumbnail must fit inside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawBounds")]
pub struct ThumbnailBounds {
    pub max_width: u32,
    pub max_height: u32,
}

#[derive(Deserialize)]
struct RawBounds {
    max_width: u32,
    max_height: u32,
}

impl From<RawBounds> for ThumbnailBounds {
    fn from(raw: RawBounds) -> Self {
        Self::new(raw.max_width, raw.max_height)
    }
}

impl ThumbnailBounds {
    pub fn new(max_width: u32, max_height: u32) -> Self {
        Self {
            max_width: max_width.max(1),
            max_height: max_height.max(1),
        }
    }

    /// Half of the given native resolution.
    pub fn half_of(width: u32, height: u32) -> Self {
        Self::new(width / 2, height / 2)
    }

    pub fn contains(&self, width: u32, height: u32) -> bool {
        width <= self.max_width && height <= self.max_height
    }
}

/// Produces re-encoded, downscaled copies of source images.
#[derive(Debug, Clone, Copy)]
pub struct ThumbnailGenerator {
    jpeg_quality: u8,
}

impl Default for ThumbnailGenerator {
    fn default() -> Self {
        Self::new(THUMB_JPEG_QUALITY_DEFAULT)
    }
}

impl ThumbnailGenerator {
    pub fn new(jpeg_quality: u8) -> Self {
        Self {
            jpeg_quality: jpeg_quality.clamp(1, 100),
        }
    }

    pub fn jpeg_quality(&self) -> u8 {
        self.jpeg_quality
    }

    /// Decodes `source`, fits it inside `bounds` (or half its native size
    /// when `bounds` is `None`) and returns the JPEG bytes.
    ///
    /// Images already inside the box are never upscaled. Alpha is dropped,
    /// not composited.
    pub fn generate(
        &self,
        source: &Path,
        bounds: Option<ThumbnailBounds>,
    ) -> Result<Vec<u8>, ThumbnailError> {
        let img = open_source(source)?;
        let bounds = bounds.unwrap_or_else(|| {
            let (width, height) = img.dimensions();
            ThumbnailBounds::half_of(width, height)
        });
        let thumbnail = fit_within(img, bounds);
        self.encode_jpeg(&thumbnail, source)
    }

    fn encode_jpeg(
        &self,
        thumbnail: &DynamicImage,
        source: &Path,
    ) -> Result<Vec<u8>, ThumbnailError> {
        let rgb = thumbnail.to_rgb8();
        let mut bytes = Vec::with_capacity(THUMB_BUFFER_CAPACITY);
        let mut encoder = JpegEncoder::new_with_quality(&mut bytes, self.jpeg_quality);
        encoder
            .encode(
                rgb.as_raw(),
                rgb.width(),
                rgb.height(),
                image::ExtendedColorType::Rgb8,
            )
            .map_err(|source_err| ThumbnailError::Encode {
                path: source.to_path_buf(),
                source: source_err,
            })?;
        Ok(bytes)
    }
}

/// Reads only the image header to report its native resolution.
pub fn native_dimensions(source: &Path) -> Result<(u32, u32), ThumbnailError> {
    sniffed_reader(source)?
        .into_dimensions()
        .map_err(|err| map_decode_error(source, err))
}

fn ensure_exists(source: &Path) -> Result<(), ThumbnailError> {
    if source.is_file() {
        Ok(())
    } else {
        Err(ThumbnailError::NotFound(source.to_path_buf()))
    }
}

fn open_source(source: &Path) -> Result<DynamicImage, ThumbnailError> {
    sniffed_reader(source)?
        .decode()
        .map_err(|err| map_decode_error(source, err))
}

/// Format comes from the leading bytes; the extension is only a fallback.
fn sniffed_reader(source: &Path) -> Result<ImageReader<BufReader<File>>, ThumbnailError> {
    ensure_exists(source)?;
    ImageReader::open(source)
        .and_then(ImageReader::with_guessed_format)
        .map_err(|err| map_decode_error(source, ImageError::IoError(err)))
}

fn map_decode_error(source: &Path, err: ImageError) -> ThumbnailError {
    match err {
        ImageError::IoError(ref io) if io.kind() == std::io::ErrorKind::NotFound => {
            ThumbnailError::NotFound(source.to_path_buf())
        }
        other => ThumbnailError::Decode {
            path: source.to_path_buf(),
            source: other,
        },
    }
}

fn fit_within(img: DynamicImage, bounds: ThumbnailBounds) -> DynamicImage {
    let (width, height) = img.dimensions();
    if bounds.contains(width, height) {
        return img;
    }
    img.resize(bounds.max_width, bounds.max_height, THUMB_FILTER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage, Rgba, RgbaImage};

    fn write_rgb(dir: &Path, name: &str, width: u32, height: u32) -> std::path::PathBuf {
        let path = dir.join(name);
        RgbImage::from_pixel(width, height, Rgb([200, 40, 40]))
            .save(&path)
            .expect("failed to write test image");
        path
    }

    fn decoded(bytes: &[u8]) -> DynamicImage {
        assert_eq!(image::guess_format(bytes).unwrap(), ImageFormat::Jpeg);
        image::load_from_memory(bytes).expect("thumbnail should decode")
    }

    #[test]
    fn test_small_image_is_never_upscaled() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_rgb(dir.path(), "small.png", 100, 100);

        let bytes = ThumbnailGenerator::default()
            .generate(&path, Some(ThumbnailBounds::new(300, 300)))
            .unwrap();
        let thumb = decoded(&bytes);
        assert!(thumb.width() <= 100 && thumb.height() <= 100);
    }

    #[test]
    fn test_default_bounds_are_half_native_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_rgb(dir.path(), "wide.png", 400, 200);

        let bytes = ThumbnailGenerator::default().generate(&path, None).unwrap();
        assert_eq!(decoded(&bytes).dimensions(), (200, 100));
    }

    #[test]
    fn test_explicit_bounds_preserve_aspect_ratio() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_rgb(dir.path(), "tall.bmp", 100, 400);

        let bytes = ThumbnailGenerator::new(75)
            .generate(&path, Some(ThumbnailBounds::new(50, 50)))
            .unwrap();
        let (width, height) = decoded(&bytes).dimensions();
        assert!(height <= 50);
        assert!(width <= 13 && width >= 12);
    }

    #[test]
    fn test_alpha_is_flattened_before_encoding() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alpha.png");
        RgbaImage::from_pixel(64, 64, Rgba([10, 20, 30, 0]))
            .save(&path)
            .unwrap();

        let bytes = ThumbnailGenerator::default().generate(&path, None).unwrap();
        let thumb = decoded(&bytes);
        assert!(!thumb.color().has_alpha());
        assert_eq!(thumb.dimensions(), (32, 32));
    }

    #[test]
    fn test_one_pixel_image_keeps_a_valid_box() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_rgb(dir.path(), "dot.png", 1, 1);

        let bytes = ThumbnailGenerator::default().generate(&path, None).unwrap();
        assert_eq!(decoded(&bytes).dimensions(), (1, 1));
    }

    #[test]
    fn test_missing_source_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = ThumbnailGenerator::default()
            .generate(&dir.path().join("gone.png"), None)
            .unwrap_err();
        assert!(matches!(err, ThumbnailError::NotFound(_)));
        assert!(matches!(
            native_dimensions(&dir.path().join("gone.png")),
            Err(ThumbnailError::NotFound(_))
        ));
    }

    #[test]
    fn test_corrupt_source_is_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.png");
        std::fs::write(&path, b"definitely not an image").unwrap();

        let err = ThumbnailGenerator::default().generate(&path, None).unwrap_err();
        assert!(matches!(err, ThumbnailError::Decode { .. }));
    }

    #[test]
    fn test_format_is_detected_from_content_not_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("actually_jpeg.png");
        RgbImage::from_pixel(40, 20, Rgb([0, 120, 200]))
            .save_with_format(&path, ImageFormat::Jpeg)
            .unwrap();

        assert_eq!(native_dimensions(&path).unwrap(), (40, 20));
        let bytes = ThumbnailGenerator::default().generate(&path, None).unwrap();
        assert_eq!(decoded(&bytes).dimensions(), (20, 10));
    }

    #[test]
    fn test_zero_bounds_from_json_are_clamped() {
        let bounds: ThumbnailBounds =
            serde_json::from_str(r#"{"max_width": 0, "max_height": 5}"#).unwrap();
        assert_eq!(bounds, ThumbnailBounds::new(1, 5));
        assert_eq!((bounds.max_width, bounds.max_height), (1, 5));
    }

    #[test]
    fn test_native_dimensions_reads_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_rgb(dir.path(), "dims.bmp", 30, 20);
        assert_eq!(native_dimensions(&path).unwrap(), (30, 20));
    }
}
