use std::io::Cursor;

use base64::prelude::*;
use image::{DynamicImage, ImageDecoder, ImageReader};

use crate::error::ImageLoadError;

/// Decodes raw image bytes, normalizing orientation from any embedded EXIF
/// rotation metadata so downstream consumers always see upright pixels.
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage, image::ImageError> {
    let reader = ImageReader::new(Cursor::new(bytes)).with_guessed_format()?;
    let mut decoder = reader.into_decoder()?;
    let orientation = decoder.orientation()?;
    let mut img = DynamicImage::from_decoder(decoder)?;
    img.apply_orientation(orientation);
    Ok(img)
}

/// Converts a decoded image into a base64-encoded PNG string.
pub fn image_to_base64_png(img: &DynamicImage) -> Result<String, image::ImageError> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)?;
    Ok(BASE64_STANDARD.encode(&bytes))
}

/// Decodes a base64 payload into an image.
pub fn image_from_base64(data: &str) -> Result<DynamicImage, ImageLoadError> {
    let bytes = BASE64_STANDARD.decode(data.trim())?;
    Ok(decode_image(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    fn sample_image() -> DynamicImage {
        let buffer = ImageBuffer::from_fn(4, 2, |x, y| Rgb([x as u8 * 10, y as u8 * 20, 200u8]));
        DynamicImage::ImageRgb8(buffer)
    }

    #[test]
    fn png_base64_round_trip_is_lossless() {
        let img = sample_image();
        let encoded = image_to_base64_png(&img).unwrap();
        let decoded = image_from_base64(&encoded).unwrap();
        assert_eq!(img.to_rgb8().as_raw(), decoded.to_rgb8().as_raw());
    }

    // Splices a minimal EXIF APP1 segment (little-endian TIFF, single
    // orientation entry) right after the JPEG SOI marker.
    fn with_exif_orientation(jpeg: &[u8], orientation: u16) -> Vec<u8> {
        let mut exif = Vec::new();
        exif.extend_from_slice(b"Exif\0\0");
        exif.extend_from_slice(b"II*\0");
        exif.extend_from_slice(&8u32.to_le_bytes()); // offset of IFD0
        exif.extend_from_slice(&1u16.to_le_bytes()); // one entry
        exif.extend_from_slice(&0x0112u16.to_le_bytes()); // orientation tag
        exif.extend_from_slice(&3u16.to_le_bytes()); // type SHORT
        exif.extend_from_slice(&1u32.to_le_bytes()); // count
        exif.extend_from_slice(&orientation.to_le_bytes());
        exif.extend_from_slice(&0u16.to_le_bytes()); // value padding
        exif.extend_from_slice(&0u32.to_le_bytes()); // no next IFD

        let mut out = Vec::new();
        out.extend_from_slice(&jpeg[..2]); // SOI
        out.extend_from_slice(&[0xFF, 0xE1]);
        out.extend_from_slice(&(exif.len() as u16 + 2).to_be_bytes());
        out.extend_from_slice(&exif);
        out.extend_from_slice(&jpeg[2..]);
        out
    }

    #[test]
    fn exif_orientation_is_normalized_on_decode() {
        let mut jpeg = Vec::new();
        sample_image()
            .write_to(&mut Cursor::new(&mut jpeg), image::ImageFormat::Jpeg)
            .unwrap();

        // Sanity: without the tag the 4x2 image decodes as stored.
        let plain = decode_image(&jpeg).unwrap();
        assert_eq!((plain.width(), plain.height()), (4, 2));

        // Orientation 6 = rotate 90 degrees clockwise to display upright.
        let tagged = with_exif_orientation(&jpeg, 6);
        let upright = decode_image(&tagged).unwrap();
        assert_eq!((upright.width(), upright.height()), (2, 4));
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        assert!(decode_image(b"definitely not an image").is_err());
    }

    #[test]
    fn invalid_base64_is_rejected_before_decoding() {
        let err = image_from_base64("!!! not base64 !!!").unwrap_err();
        assert!(matches!(err, ImageLoadError::Base64(_)));
    }
}
