//! Local crop and rotate, always re-encoded as PNG

use std::io::Cursor;

use async_trait::async_trait;
use bytes::Bytes;
use image::{DynamicImage, ImageFormat};

use super::{Transform, TransformInput, TransformOutput};
use crate::derivation::{CropRect, Operation, OperationParameters};
use crate::errors::{TransformError, TransformResult};

pub struct CropTransform;

pub struct RotateTransform;

fn decode(bytes: &[u8]) -> TransformResult<DynamicImage> {
    image::load_from_memory(bytes).map_err(|err| TransformError::UnsupportedFormat(err.to_string()))
}

fn encode_png(image: &DynamicImage) -> TransformResult<TransformOutput> {
    let mut buffer = Cursor::new(Vec::new());
    image
        .write_to(&mut buffer, ImageFormat::Png)
        .map_err(|err| TransformError::InvalidInput(format!("failed to encode PNG: {}", err)))?;
    Ok(TransformOutput::Binary {
        bytes: Bytes::from(buffer.into_inner()),
        content_type: "image/png".to_string(),
    })
}

pub fn crop(bytes: &[u8], rect: &CropRect) -> TransformResult<TransformOutput> {
    let image = decode(bytes)?;
    let fits_x = rect.x.checked_add(rect.width).map_or(false, |right| right <= image.width());
    let fits_y = rect.y.checked_add(rect.height).map_or(false, |bottom| bottom <= image.height());
    if !fits_x || !fits_y {
        return Err(TransformError::InvalidInput(format!(
            "crop {}x{}+{}+{} exceeds image bounds {}x{}",
            rect.width,
            rect.height,
            rect.x,
            rect.y,
            image.width(),
            image.height()
        )));
    }
    encode_png(&image.crop_imm(rect.x, rect.y, rect.width, rect.height))
}

pub fn rotate(bytes: &[u8], degrees: i32) -> TransformResult<TransformOutput> {
    let image = decode(bytes)?;
    let rotated = match degrees.rem_euclid(360) {
        0 => image,
        90 => image.rotate90(),
        180 => image.rotate180(),
        270 => image.rotate270(),
        other => {
            return Err(TransformError::InvalidInput(format!(
                "unsupported rotation of {} degrees",
                other
            )))
        }
    };
    encode_png(&rotated)
}

async fn run_blocking<F>(job: F) -> TransformResult<TransformOutput>
where
    F: FnOnce() -> TransformResult<TransformOutput> + Send + 'static,
{
    tokio::task::spawn_blocking(job)
        .await
        .map_err(|err| TransformError::service("image", format!("worker panicked: {}", err)))?
}

#[async_trait]
impl Transform for CropTransform {
    fn operation(&self) -> Operation {
        Operation::Crop
    }

    async fn apply(
        &self,
        input: TransformInput,
        parameters: &OperationParameters,
    ) -> TransformResult<TransformOutput> {
        let OperationParameters::Crop(rect) = parameters else {
            return Err(TransformError::InvalidInput("expected crop parameters".to_string()));
        };
        let bytes = input.bytes()?.clone();
        let rect = rect.clone();
        run_blocking(move || crop(&bytes, &rect)).await
    }
}

#[async_trait]
impl Transform for RotateTransform {
    fn operation(&self) -> Operation {
        Operation::Rotate
    }

    async fn apply(
        &self,
        input: TransformInput,
        parameters: &OperationParameters,
    ) -> TransformResult<TransformOutput> {
        let OperationParameters::Rotate(rotation) = parameters else {
            return Err(TransformError::InvalidInput("expected rotate parameters".to_string()));
        };
        let bytes = input.bytes()?.clone();
        let degrees = rotation.degrees;
        run_blocking(move || rotate(&bytes, degrees)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgba};

    fn png(width: u32, height: u32) -> Vec<u8> {
        let image = DynamicImage::ImageRgba8(ImageBuffer::from_pixel(width, height, Rgba([200, 10, 10, 255])));
        let mut buffer = Cursor::new(Vec::new());
        image.write_to(&mut buffer, ImageFormat::Png).unwrap();
        buffer.into_inner()
    }

    fn dimensions(output: &TransformOutput) -> (u32, u32) {
        match output {
            TransformOutput::Binary { bytes, content_type } => {
                assert_eq!(content_type, "image/png");
                let image = image::load_from_memory(bytes).unwrap();
                (image.width(), image.height())
            }
            other => panic!("expected binary output, got {:?}", other),
        }
    }

    #[test]
    fn test_crop_dimensions() {
        let rect = CropRect { x: 2, y: 1, width: 5, height: 3 };
        assert_eq!(dimensions(&crop(&png(10, 8), &rect).unwrap()), (5, 3));
    }

    #[test]
    fn test_crop_out_of_bounds() {
        let rect = CropRect { x: 8, y: 0, width: 5, height: 3 };
        let err = crop(&png(10, 8), &rect).unwrap_err();
        assert!(matches!(err, TransformError::InvalidInput(_)));
    }

    #[test]
    fn test_rotate_swaps_dimensions() {
        assert_eq!(dimensions(&rotate(&png(6, 4), 90).unwrap()), (4, 6));
        assert_eq!(dimensions(&rotate(&png(6, 4), 180).unwrap()), (6, 4));
        assert_eq!(dimensions(&rotate(&png(6, 4), 270).unwrap()), (4, 6));
    }

    #[test]
    fn test_garbage_input_is_unsupported() {
        let err = rotate(b"not an image", 90).unwrap_err();
        assert!(matches!(err, TransformError::UnsupportedFormat(_)));
    }

    #[tokio::test]
    async fn test_crop_transform_requires_bytes() {
        let input = TransformInput {
            asset_id: uuid::Uuid::nil(),
            owner_id: 1,
            content_type: "image/png".to_string(),
            bytes: None,
            url: None,
        };
        let parameters = OperationParameters::Crop(CropRect { x: 0, y: 0, width: 1, height: 1 });
        assert!(CropTransform.apply(input, &parameters).await.is_err());
    }
}
