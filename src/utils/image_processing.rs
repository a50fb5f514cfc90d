use image::{DynamicImage, ImageResult};

/// Single-channel 8-bit raster, row-major
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrayImage8 {
    /// Width in pixels (DICOM Columns)
    pub width: u32,
    /// Height in pixels (DICOM Rows)
    pub height: u32,
    /// One sample per pixel, `width * height` bytes
    pub samples: Vec<u8>,
}

/// Decode an encoded raster (JPEG, PNG, BMP, ...) with the format guessed from its content.
pub fn decode_image(buffer: &[u8]) -> ImageResult<DynamicImage> {
    image::load_from_memory(buffer)
}

/// Flatten a decoded image to 8-bit grayscale
///
/// - grayscale input (with or without alpha) keeps its luma channel
/// - color input becomes the unweighted mean of R, G and B, truncated
/// - wider samples (16-bit, float) are reduced to 8 bits first
/// - alpha is dropped, it is not a color channel
pub fn flatten_to_gray8(image: DynamicImage) -> GrayImage8 {
    let (width, height) = (image.width(), image.height());

    let samples = if image.color().has_color() {
        image
            .into_rgb8()
            .pixels()
            .map(|pixel| channel_mean(&pixel.0))
            .collect()
    } else {
        image.into_luma8().into_raw()
    };

    GrayImage8 {
        width,
        height,
        samples,
    }
}

/// Unweighted integer mean of a pixel's channels, truncated towards zero.
pub fn channel_mean(channels: &[u8]) -> u8 {
    if channels.is_empty() {
        return 0;
    }
    let sum: u32 = channels.iter().map(|&c| u32::from(c)).sum();
    (sum / channels.len() as u32) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, ImageBuffer, Luma, LumaA, Rgb, RgbImage, Rgba};

    #[test]
    fn test_channel_mean() {
        assert_eq!(channel_mean(&[0, 0, 0]), 0);
        assert_eq!(channel_mean(&[255, 255, 255]), 255);
        // 100 / 3 = 33.33 -> 33
        assert_eq!(channel_mean(&[100, 0, 0]), 33);
        // 2 / 3 truncates to 0
        assert_eq!(channel_mean(&[1, 1, 0]), 0);
        assert_eq!(channel_mean(&[]), 0);
    }

    #[test]
    fn test_flatten_rgb() {
        let img = RgbImage::from_fn(3, 2, |x, y| Rgb([(x * 10) as u8, (y * 20) as u8, 30]));
        let gray = flatten_to_gray8(DynamicImage::ImageRgb8(img));
        assert_eq!((gray.width, gray.height), (3, 2));
        assert_eq!(gray.samples.len(), 6);
        // pixel (x=2, y=1): (20 + 20 + 30) / 3 = 23
        assert_eq!(gray.samples[3 + 2], 23);
    }

    #[test]
    fn test_flatten_is_channel_order_invariant() {
        let rgb = RgbImage::from_fn(7, 5, |x, y| {
            Rgb([(x * 31) as u8, (y * 47) as u8, (x * y) as u8])
        });
        let bgr = RgbImage::from_fn(7, 5, |x, y| {
            let p = rgb.get_pixel(x, y).0;
            Rgb([p[2], p[0], p[1]])
        });
        let a = flatten_to_gray8(DynamicImage::ImageRgb8(rgb));
        let b = flatten_to_gray8(DynamicImage::ImageRgb8(bgr));
        assert_eq!(a, b);
    }

    #[test]
    fn test_flatten_grayscale_passthrough() {
        let img = GrayImage::from_fn(4, 4, |x, y| Luma([(x + 4 * y) as u8]));
        let expected = img.clone().into_raw();
        let gray = flatten_to_gray8(DynamicImage::ImageLuma8(img));
        assert_eq!(gray.samples, expected);
    }

    #[test]
    fn test_flatten_drops_alpha() {
        let rgba = ImageBuffer::from_fn(2, 2, |_, _| Rgba([90u8, 60, 30, 255]));
        let gray = flatten_to_gray8(DynamicImage::ImageRgba8(rgba));
        assert_eq!(gray.samples, vec![60; 4]);

        let luma_alpha = ImageBuffer::from_fn(2, 1, |_, _| LumaA([17u8, 0]));
        let gray = flatten_to_gray8(DynamicImage::ImageLumaA8(luma_alpha));
        assert_eq!(gray.samples, vec![17, 17]);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_image(&[]).is_err());
        assert!(decode_image(b"definitely not an image").is_err());
    }
}
