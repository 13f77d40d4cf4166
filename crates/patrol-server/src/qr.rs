//! QR codes for printing checkpoint tags.

use image::{DynamicImage, ImageFormat, Luma};
use qrcode::render::svg;
use qrcode::QrCode;
use serde::Deserialize;
use std::io::Cursor;

/// Smallest edge of the rendered code, in pixels.
const MIN_EDGE: u32 = 256;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QrFormat {
    #[default]
    Png,
    Svg,
}

impl QrFormat {
    pub const fn content_type(self) -> &'static str {
        match self {
            Self::Png => "image/png",
            Self::Svg => "image/svg+xml",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QrError {
    #[error("payload does not fit in a QR code: {0}")]
    Encode(#[from] qrcode::types::QrError),

    #[error("png encoding failed: {0}")]
    Image(#[from] image::ImageError),
}

/// Render `payload` (a checkpoint's scan token) in the requested format.
pub fn render(payload: &str, format: QrFormat) -> Result<Vec<u8>, QrError> {
    let code = QrCode::new(payload.as_bytes())?;
    match format {
        QrFormat::Png => {
            let pixels = code
                .render::<Luma<u8>>()
                .min_dimensions(MIN_EDGE, MIN_EDGE)
                .build();
            let mut buf = Cursor::new(Vec::new());
            DynamicImage::ImageLuma8(pixels).write_to(&mut buf, ImageFormat::Png)?;
            Ok(buf.into_inner())
        }
        QrFormat::Svg => Ok(code
            .render::<svg::Color<'_>>()
            .min_dimensions(MIN_EDGE, MIN_EDGE)
            .build()
            .into_bytes()),
    }
}
