//! Image processing
//!
//! Decoding and encoding go through the `image` crate, except lossy WEBP which
//! uses libwebp directly. EXIF orientation is applied on load so every output
//! is upright. Lossy encoders always receive an opaque RGB buffer; alpha is
//! flattened onto white first.

use async_trait::async_trait;
use font8x8::{UnicodeFonts, BASIC_FONTS, LATIN_FONTS};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
use image::imageops::FilterType;
use image::metadata::Orientation;
use image::{DynamicImage, ImageFormat, ImageReader, Limits, Rgba, RgbaImage, RgbImage};
use serde_json::{json, Map, Value};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use tracing::{debug, info};

use crate::error::{PipelineError, Result};
use crate::handler::{output_name, run_blocking, HandlerOutput, ProcessingJob, ToolHandler};
use crate::registry::{ImageOperation, Operation, ToolCategory, ToolDescriptor};

const WATERMARK_MARGIN: u32 = 10;

/// Largest side any resize may produce, bound given or not.
pub const MAX_OUTPUT_SIDE: u32 = 20_000;
/// 100 megapixels
pub const MAX_OUTPUT_PIXELS: u64 = 100_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageOutputFormat {
    Jpeg,
    Png,
    Webp,
    Bmp,
    Gif,
    Tiff,
}

impl ImageOutputFormat {
    pub fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => Ok(Self::Jpeg),
            "png" => Ok(Self::Png),
            "webp" => Ok(Self::Webp),
            "bmp" => Ok(Self::Bmp),
            "gif" => Ok(Self::Gif),
            "tiff" | "tif" => Ok(Self::Tiff),
            other => Err(PipelineError::invalid(format!("Unsupported image format '{}'", other))),
        }
    }

    /// Format to keep when the caller did not ask for one.
    pub fn from_source(format: Option<ImageFormat>) -> Self {
        match format {
            Some(ImageFormat::Jpeg) => Self::Jpeg,
            Some(ImageFormat::WebP) => Self::Webp,
            Some(ImageFormat::Bmp) => Self::Bmp,
            Some(ImageFormat::Gif) => Self::Gif,
            Some(ImageFormat::Tiff) => Self::Tiff,
            _ => Self::Png,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
            Self::Webp => "webp",
            Self::Bmp => "bmp",
            Self::Gif => "gif",
            Self::Tiff => "tiff",
        }
    }

    fn is_lossy(&self) -> bool {
        matches!(self, Self::Jpeg | Self::Webp)
    }
}

/// Aspect-preserving fit inside an optional bounding box.
///
/// Never exceeds either bound, and never grows the image unless
/// `allow_upscale` is set. A missing bound means [`MAX_OUTPUT_SIDE`].
pub fn fit_dimensions(
    width: u32,
    height: u32,
    max_width: Option<u32>,
    max_height: Option<u32>,
    allow_upscale: bool,
) -> (u32, u32) {
    let bound_w = max_width.unwrap_or(MAX_OUTPUT_SIDE).clamp(1, MAX_OUTPUT_SIDE);
    let bound_h = max_height.unwrap_or(MAX_OUTPUT_SIDE).clamp(1, MAX_OUTPUT_SIDE);

    let mut scale = (bound_w as f64 / width as f64).min(bound_h as f64 / height as f64);
    if !allow_upscale {
        scale = scale.min(1.0);
    }

    let w = ((width as f64 * scale).round() as u32).clamp(1, bound_w);
    let h = ((height as f64 * scale).round() as u32).clamp(1, bound_h);
    (w, h)
}

/// Rejects output sizes that would not fit the allocation budget.
pub fn check_output_size(width: u32, height: u32) -> Result<()> {
    let pixels = width as u64 * height as u64;
    if width > MAX_OUTPUT_SIDE || height > MAX_OUTPUT_SIDE || pixels > MAX_OUTPUT_PIXELS {
        return Err(PipelineError::invalid(format!(
            "Output of {}x{} is too large (at most {} px per side and {} pixels)",
            width, height, MAX_OUTPUT_SIDE, MAX_OUTPUT_PIXELS
        )));
    }
    Ok(())
}

/// Clamp a crop box to the image. The result always has a non-zero area.
pub fn clamp_crop(img_w: u32, img_h: u32, x: u32, y: u32, w: u32, h: u32) -> (u32, u32, u32, u32) {
    let x = x.min(img_w.saturating_sub(1));
    let y = y.min(img_h.saturating_sub(1));
    let w = w.clamp(1, img_w - x);
    let h = h.clamp(1, img_h - y);
    (x, y, w, h)
}

pub struct ImageHandler {
    limits: Limits,
}

impl Default for ImageHandler {
    fn default() -> Self {
        let mut limits = Limits::default();
        limits.max_image_width = Some(30_000);
        limits.max_image_height = Some(30_000);
        limits.max_alloc = Some(1024 * 1024 * 1024);
        Self { limits }
    }
}

impl ImageHandler {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Decoded image plus the container format it came from.
struct Loaded {
    image: DynamicImage,
    format: Option<ImageFormat>,
    original_size: u64,
}

fn exif_orientation(path: &Path) -> Option<u8> {
    let file = File::open(path).ok()?;
    let mut reader = BufReader::new(file);
    let exif = exif::Reader::new().read_from_container(&mut reader).ok()?;
    let field = exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY)?;
    field.value.get_uint(0).and_then(|v| u8::try_from(v).ok())
}

fn load(path: &Path, limits: &Limits) -> Result<Loaded> {
    let original_size = std::fs::metadata(path)?.len();
    let mut reader = ImageReader::open(path)?
        .with_guessed_format()
        .map_err(|e| PipelineError::processing(format!("cannot sniff image {}: {}", path.display(), e)))?;
    reader.limits(limits.clone());
    let format = reader.format();

    let mut image = reader
        .decode()
        .map_err(|e| PipelineError::processing(format!("cannot decode image {}: {}", path.display(), e)))?;

    if let Some(orientation) = exif_orientation(path).and_then(Orientation::from_exif) {
        debug!(path = %path.display(), ?orientation, "applying EXIF orientation");
        image.apply_orientation(orientation);
    }

    Ok(Loaded {
        image,
        format,
        original_size,
    })
}

/// Opaque RGB copy with transparency composited over white.
fn flatten_alpha(img: &DynamicImage) -> RgbImage {
    if !img.color().has_alpha() {
        return img.to_rgb8();
    }
    let rgba = img.to_rgba8();
    let mut rgb = RgbImage::new(rgba.width(), rgba.height());
    for (dst, src) in rgb.pixels_mut().zip(rgba.pixels()) {
        let alpha = src[3] as u32;
        for c in 0..3 {
            dst[c] = ((src[c] as u32 * alpha + 255 * (255 - alpha) + 127) / 255) as u8;
        }
    }
    rgb
}

fn encoding_error(e: impl std::fmt::Display) -> PipelineError {
    PipelineError::processing(format!("image encoding failed: {}", e))
}

fn encode(img: &DynamicImage, format: ImageOutputFormat, quality: u8, path: &Path) -> Result<u64> {
    let quality = quality.clamp(1, 100);
    let mut writer = BufWriter::new(File::create(path)?);

    match format {
        ImageOutputFormat::Jpeg => {
            let rgb = flatten_alpha(img);
            JpegEncoder::new_with_quality(&mut writer, quality)
                .encode_image(&rgb)
                .map_err(encoding_error)?;
        }
        ImageOutputFormat::Webp => {
            let rgb = flatten_alpha(img);
            let encoded = webp::Encoder::from_rgb(rgb.as_raw(), rgb.width(), rgb.height()).encode(quality as f32);
            writer.write_all(&encoded)?;
        }
        ImageOutputFormat::Png => {
            let encoder = PngEncoder::new_with_quality(&mut writer, CompressionType::Best, PngFilter::Adaptive);
            let normalized = if img.color().has_alpha() {
                DynamicImage::ImageRgba8(img.to_rgba8())
            } else {
                DynamicImage::ImageRgb8(img.to_rgb8())
            };
            normalized.write_with_encoder(encoder).map_err(encoding_error)?;
        }
        ImageOutputFormat::Bmp | ImageOutputFormat::Gif | ImageOutputFormat::Tiff => {
            let target = match format {
                ImageOutputFormat::Bmp => ImageFormat::Bmp,
                ImageOutputFormat::Gif => ImageFormat::Gif,
                _ => ImageFormat::Tiff,
            };
            let normalized = if img.color().has_alpha() || format == ImageOutputFormat::Gif {
                DynamicImage::ImageRgba8(img.to_rgba8())
            } else {
                DynamicImage::ImageRgb8(img.to_rgb8())
            };
            normalized.write_to(&mut writer, target).map_err(encoding_error)?;
        }
    }

    writer.flush()?;
    drop(writer);
    Ok(std::fs::metadata(path)?.len())
}

fn optional_u32(job: &ProcessingJob, key: &str) -> Option<u32> {
    job.u64_opt(key).map(|v| v.min(u32::MAX as u64) as u32)
}

fn compress(job: &ProcessingJob, limits: &Limits) -> Result<HandlerOutput> {
    let input = job.input()?;
    let Loaded {
        mut image,
        format,
        original_size,
    } = load(&input.path, limits)?;

    let quality = job.u64_or("quality", 85) as u8;
    let target = match job.str_opt("format") {
        Some(f) => ImageOutputFormat::parse(f)?,
        None => match ImageOutputFormat::from_source(format) {
            f @ (ImageOutputFormat::Jpeg | ImageOutputFormat::Webp | ImageOutputFormat::Png) => f,
            _ => ImageOutputFormat::Jpeg,
        },
    };

    if let Some(max) = optional_u32(job, "max_dimension") {
        let (w, h) = fit_dimensions(image.width(), image.height(), Some(max), Some(max), false);
        if (w, h) != (image.width(), image.height()) {
            image = image.resize_exact(w, h, FilterType::Lanczos3);
        }
    }

    let name = output_name("compressed_", &input.original_filename, target.extension());
    let out = job.output_path(&name);
    let size = encode(&image, target, quality, &out)?;

    info!(
        request_id = %job.request_id,
        original_size,
        compressed_size = size,
        lossy = target.is_lossy(),
        "🖼️ Image compressed"
    );
    Ok(HandlerOutput::file(out, name).with_result(json!({
        "original_size": original_size,
        "compressed_size": size,
        "width": image.width(),
        "height": image.height(),
    })))
}

fn resize(job: &ProcessingJob, limits: &Limits) -> Result<HandlerOutput> {
    let input = job.input()?;
    let Loaded { image, format, .. } = load(&input.path, limits)?;
    let width = optional_u32(job, "width");
    let height = optional_u32(job, "height");

    let (w, h) = match (job.str_or("mode", "fit"), width, height) {
        ("exact", Some(w), Some(h)) => (w, h),
        ("exact", _, _) => return Err(PipelineError::invalid("Exact resize needs both width and height")),
        _ => fit_dimensions(image.width(), image.height(), width, height, job.bool_or("allow_upscale", false)),
    };
    check_output_size(w, h)?;

    let resized = if (w, h) == (image.width(), image.height()) {
        image
    } else {
        image.resize_exact(w, h, FilterType::Lanczos3)
    };

    let target = ImageOutputFormat::from_source(format);
    let name = output_name("resized_", &input.original_filename, target.extension());
    let out = job.output_path(&name);
    encode(&resized, target, 90, &out)?;
    Ok(HandlerOutput::file(out, name).with_result(json!({ "width": w, "height": h })))
}

fn convert(job: &ProcessingJob, limits: &Limits) -> Result<HandlerOutput> {
    let input = job.input()?;
    let Loaded { image, .. } = load(&input.path, limits)?;
    let target = ImageOutputFormat::parse(job.require_str("format")?)?;
    let name = output_name("converted_", &input.original_filename, target.extension());
    let out = job.output_path(&name);
    encode(&image, target, job.u64_or("quality", 90) as u8, &out)?;
    Ok(HandlerOutput::file(out, name))
}

fn crop(job: &ProcessingJob, limits: &Limits) -> Result<HandlerOutput> {
    let input = job.input()?;
    let Loaded { image, format, .. } = load(&input.path, limits)?;
    let (x, y, w, h) = clamp_crop(
        image.width(),
        image.height(),
        optional_u32(job, "x").unwrap_or(0),
        optional_u32(job, "y").unwrap_or(0),
        optional_u32(job, "width").unwrap_or(u32::MAX),
        optional_u32(job, "height").unwrap_or(u32::MAX),
    );
    let cropped = image.crop_imm(x, y, w, h);

    let target = ImageOutputFormat::from_source(format);
    let name = output_name("cropped_", &input.original_filename, target.extension());
    let out = job.output_path(&name);
    encode(&cropped, target, 90, &out)?;
    Ok(HandlerOutput::file(out, name).with_result(json!({ "x": x, "y": y, "width": w, "height": h })))
}

fn rotate(job: &ProcessingJob, limits: &Limits) -> Result<HandlerOutput> {
    let input = job.input()?;
    let Loaded { image, format, .. } = load(&input.path, limits)?;

    let rotated = match job.u64_or("angle", 90) {
        0 => image,
        90 => image.rotate90(),
        180 => image.rotate180(),
        270 => image.rotate270(),
        other => {
            return Err(PipelineError::invalid(format!(
                "Rotation must be a quarter turn (0, 90, 180, 270), got {}",
                other
            )))
        }
    };
    let flipped = match job.str_or("flip", "none") {
        "horizontal" => rotated.fliph(),
        "vertical" => rotated.flipv(),
        _ => rotated,
    };

    let target = ImageOutputFormat::from_source(format);
    let name = output_name("rotated_", &input.original_filename, target.extension());
    let out = job.output_path(&name);
    encode(&flipped, target, 90, &out)?;
    Ok(HandlerOutput::file(out, name))
}

fn glyph(c: char) -> [u8; 8] {
    BASIC_FONTS
        .get(c)
        .or_else(|| LATIN_FONTS.get(c))
        .or_else(|| BASIC_FONTS.get('?'))
        .unwrap_or([0; 8])
}

fn blend(pixel: &mut Rgba<u8>, color: [u8; 3], alpha: f32) {
    for c in 0..3 {
        let dst = pixel[c] as f32;
        pixel[c] = (dst + (color[c] as f32 - dst) * alpha).round() as u8;
    }
    pixel[3] = pixel[3].max((alpha * 255.0) as u8);
}

fn draw_text(canvas: &mut RgbaImage, text: &str, left: i64, top: i64, scale: u32, color: [u8; 3], alpha: f32) {
    let (cw, ch) = (canvas.width() as i64, canvas.height() as i64);
    for (index, c) in text.chars().enumerate() {
        let bitmap = glyph(c);
        let origin_x = left + (index as i64) * 8 * scale as i64;
        for (row, bits) in bitmap.iter().enumerate() {
            for col in 0..8 {
                if bits & (1 << col) == 0 {
                    continue;
                }
                for dy in 0..scale as i64 {
                    for dx in 0..scale as i64 {
                        let px = origin_x + col as i64 * scale as i64 + dx;
                        let py = top + row as i64 * scale as i64 + dy;
                        if px >= 0 && py >= 0 && px < cw && py < ch {
                            blend(canvas.get_pixel_mut(px as u32, py as u32), color, alpha);
                        }
                    }
                }
            }
        }
    }
}

/// Top-left corner of a `text_w` x `text_h` block at `position`.
pub fn watermark_origin(position: &str, img_w: u32, img_h: u32, text_w: u32, text_h: u32) -> (i64, i64) {
    let m = WATERMARK_MARGIN as i64;
    let (iw, ih, tw, th) = (img_w as i64, img_h as i64, text_w as i64, text_h as i64);
    match position {
        "top-left" => (m, m),
        "top-right" => (iw - tw - m, m),
        "bottom-left" => (m, ih - th - m),
        "center" => ((iw - tw) / 2, (ih - th) / 2),
        _ => (iw - tw - m, ih - th - m),
    }
}

fn watermark(job: &ProcessingJob, limits: &Limits) -> Result<HandlerOutput> {
    let input = job.input()?;
    let Loaded { image, format, .. } = load(&input.path, limits)?;
    let text = job.require_str("text")?;
    let opacity = job.f64_or("opacity", 0.5).clamp(0.0, 1.0) as f32;
    let position = job.str_or("position", "bottom-right");

    let mut canvas = image.to_rgba8();
    let (w, h) = canvas.dimensions();
    let chars = text.chars().count().max(1) as u32;

    let mut scale = optional_u32(job, "scale").unwrap_or_else(|| (w.min(h) / 160).max(1));
    while scale > 1 && chars * 8 * scale + 2 * WATERMARK_MARGIN > w {
        scale -= 1;
    }

    let (text_w, text_h) = (chars * 8 * scale, 8 * scale);
    let (x, y) = watermark_origin(position, w, h, text_w, text_h);
    let shadow = (scale / 4).max(1) as i64;

    draw_text(&mut canvas, text, x + shadow, y + shadow, scale, [0, 0, 0], opacity * 0.6);
    draw_text(&mut canvas, text, x, y, scale, [255, 255, 255], opacity);

    let stamped = DynamicImage::ImageRgba8(canvas);
    let target = ImageOutputFormat::from_source(format);
    let name = output_name("watermarked_", &input.original_filename, target.extension());
    let out = job.output_path(&name);
    encode(&stamped, target, 92, &out)?;
    Ok(HandlerOutput::file(out, name))
}

#[async_trait]
impl ToolHandler for ImageHandler {
    fn category(&self) -> ToolCategory {
        ToolCategory::Image
    }

    fn validate(&self, tool: &ToolDescriptor, options: &Map<String, Value>) -> Result<()> {
        if tool.operation == Operation::Image(ImageOperation::Resize) {
            let has = |key: &str| options.get(key).is_some_and(|v| !v.is_null());
            if !has("width") && !has("height") {
                return Err(PipelineError::invalid("Resize needs a width, a height, or both"));
            }
        }
        Ok(())
    }

    async fn process(&self, job: &ProcessingJob) -> Result<HandlerOutput> {
        let Operation::Image(op) = job.operation() else {
            return Err(PipelineError::processing(format!("{} is not an image tool", job.tool.id)));
        };

        let job = job.clone();
        let limits = self.limits.clone();
        run_blocking(move || match op {
            ImageOperation::Compress => compress(&job, &limits),
            ImageOperation::Resize => resize(&job, &limits),
            ImageOperation::Convert => convert(&job, &limits),
            ImageOperation::Crop => crop(&job, &limits),
            ImageOperation::Rotate => rotate(&job, &limits),
            ImageOperation::Watermark => watermark(&job, &limits),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fit_never_exceeds_bounds() {
        assert_eq!(fit_dimensions(4000, 3000, Some(800), Some(800), false), (800, 600));
        assert_eq!(fit_dimensions(3000, 4000, Some(800), None, false), (800, 1067));
        assert_eq!(fit_dimensions(1001, 333, Some(100), Some(100), false), (100, 33));

        for (w, h, bw, bh) in [(1920, 1080, 333, 777), (17, 4000, 50, 50), (640, 480, 641, 10)] {
            let (fw, fh) = fit_dimensions(w, h, Some(bw), Some(bh), false);
            assert!(fw <= bw && fh <= bh);
            let expected_h = fw as f64 * h as f64 / w as f64;
            assert!((fh as f64 - expected_h).abs() <= 1.0);
        }
    }

    #[test]
    fn test_fit_does_not_upscale_unless_asked() {
        assert_eq!(fit_dimensions(200, 100, Some(1000), Some(1000), false), (200, 100));
        assert_eq!(fit_dimensions(200, 100, Some(1000), Some(1000), true), (1000, 500));
    }

    #[test]
    fn test_fit_caps_the_unbounded_side() {
        let (w, h) = fit_dimensions(1, 2000, Some(20_000), None, true);
        assert_eq!((w, h), (10, 20_000));
        assert!(check_output_size(w, h).is_ok());

        let (w, h) = fit_dimensions(2000, 1, None, Some(20_000), true);
        assert_eq!((w, h), (20_000, 10));

        // no bound at all still stays within a side
        let (w, h) = fit_dimensions(25_000, 100, None, None, false);
        assert!(w <= MAX_OUTPUT_SIDE && h >= 1);
    }

    #[test]
    fn test_output_pixel_budget() {
        assert!(check_output_size(10_000, 10_000).is_ok());
        let err = check_output_size(20_000, 20_000).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidInput(_)));
        assert!(check_output_size(20_001, 1).is_err());
    }

    #[test]
    fn test_clamp_crop() {
        assert_eq!(clamp_crop(100, 50, 10, 10, 20, 20), (10, 10, 20, 20));
        assert_eq!(clamp_crop(100, 50, 90, 40, 500, 500), (90, 40, 10, 10));
        assert_eq!(clamp_crop(100, 50, 1000, 1000, 5, 5), (99, 49, 1, 1));
    }

    #[test]
    fn test_flatten_alpha_over_white() {
        let mut rgba = RgbaImage::new(2, 1);
        rgba.put_pixel(0, 0, Rgba([0, 0, 0, 0]));
        rgba.put_pixel(1, 0, Rgba([0, 0, 0, 255]));
        let rgb = flatten_alpha(&DynamicImage::ImageRgba8(rgba));
        assert_eq!(rgb.get_pixel(0, 0).0, [255, 255, 255]);
        assert_eq!(rgb.get_pixel(1, 0).0, [0, 0, 0]);
    }

    #[test]
    fn test_watermark_origin_positions() {
        assert_eq!(watermark_origin("top-left", 200, 100, 50, 8), (10, 10));
        assert_eq!(watermark_origin("bottom-right", 200, 100, 50, 8), (140, 82));
        assert_eq!(watermark_origin("center", 200, 100, 50, 8), (75, 46));
    }

    #[test]
    fn test_draw_text_changes_pixels() {
        let mut canvas = RgbaImage::from_pixel(64, 16, Rgba([0, 0, 0, 255]));
        draw_text(&mut canvas, "Hi", 0, 0, 1, [255, 255, 255], 1.0);
        assert!(canvas.pixels().any(|p| p[0] == 255));
    }

    #[test]
    fn test_parse_formats() {
        assert_eq!(ImageOutputFormat::parse("JPG").unwrap(), ImageOutputFormat::Jpeg);
        assert!(ImageOutputFormat::parse("heic").is_err());
        assert_eq!(ImageOutputFormat::from_source(Some(ImageFormat::Ico)), ImageOutputFormat::Png);
    }
}
