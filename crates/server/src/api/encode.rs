//! Transport encoding: PNG bytes, then standard base64.

use base64::{engine::general_purpose::STANDARD, Engine};
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, GrayImage, ImageEncoder, ImageResult, RgbImage};

fn png_bytes(raw: &[u8], width: u32, height: u32, color: ExtendedColorType) -> ImageResult<Vec<u8>> {
    let mut bytes = Vec::new();
    PngEncoder::new(&mut bytes).write_image(raw, width, height, color)?;
    Ok(bytes)
}

pub fn rgb_png_base64(image: &RgbImage) -> ImageResult<String> {
    let bytes = png_bytes(image.as_raw(), image.width(), image.height(), ExtendedColorType::Rgb8)?;
    Ok(STANDARD.encode(bytes))
}

pub fn luma_png_base64(image: &GrayImage) -> ImageResult<String> {
    let bytes = png_bytes(image.as_raw(), image.width(), image.height(), ExtendedColorType::L8)?;
    Ok(STANDARD.encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G'];

    #[test]
    fn rgb_roundtrips_through_png() {
        let image = RgbImage::from_fn(5, 3, |x, y| image::Rgb([x as u8 * 40, y as u8 * 80, 7]));
        let encoded = rgb_png_base64(&image).unwrap();
        let bytes = STANDARD.decode(encoded).unwrap();
        assert!(bytes.starts_with(PNG_MAGIC));
        let decoded = image::load_from_memory(&bytes).unwrap().to_rgb8();
        assert_eq!(decoded, image);
    }

    #[test]
    fn gray_encodes_as_png() {
        let image = GrayImage::from_pixel(4, 4, image::Luma([255]));
        let bytes = STANDARD.decode(luma_png_base64(&image).unwrap()).unwrap();
        assert!(bytes.starts_with(PNG_MAGIC));
        assert_eq!(image::load_from_memory(&bytes).unwrap().to_luma8(), image);
    }
}
