//! Rendition processor - derives the square size ladder from an original.
//!
//! Decoding, resizing and JPEG encoding are CPU bound; `derive_async` runs
//! them on the blocking thread pool so the consumer loop stays responsive.

use crate::models::photo::SizeLabel;
use bytes::Bytes;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageOutputFormat};
use std::io::Cursor;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum RenditionError {
    #[error("failed to decode image: {0}")]
    Decode(#[source] image::ImageError),
    #[error("failed to encode {size} rendition: {source}")]
    Encode {
        size: SizeLabel,
        #[source]
        source: image::ImageError,
    },
    #[error("rendition task panicked: {0}")]
    Panicked(String),
}

/// Configuration for rendition generation
#[derive(Clone, Debug)]
pub struct RenditionConfig {
    /// JPEG quality (1-100)
    pub jpeg_quality: u8,
}

impl Default for RenditionConfig {
    fn default() -> Self {
        Self { jpeg_quality: 85 }
    }
}

/// One encoded rendition.
#[derive(Debug)]
pub struct Rendition {
    pub size: SizeLabel,
    /// JPEG bytes, `size.pixels()` square.
    pub data: Bytes,
}

/// Everything derived from one original.
#[derive(Debug)]
pub struct DerivedRenditions {
    pub width: u32,
    pub height: u32,
    /// In ladder order, largest first.
    pub renditions: Vec<Rendition>,
}

pub struct RenditionProcessor {
    config: RenditionConfig,
}

impl RenditionProcessor {
    pub fn new(config: RenditionConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self::new(RenditionConfig::default())
    }

    /// Decode `original` and render every ladder size it is large enough
    /// for (blocking).
    pub fn derive(&self, original: &[u8]) -> Result<DerivedRenditions, RenditionError> {
        let img = image::load_from_memory(original).map_err(RenditionError::Decode)?;
        let (width, height) = img.dimensions();
        let sizes = SizeLabel::eligible(width, height);
        debug!(width, height, ?sizes, "deriving renditions");

        let renditions = sizes
            .into_iter()
            .map(|size| {
                Ok(Rendition {
                    size,
                    data: self.render(&img, size)?,
                })
            })
            .collect::<Result<Vec<_>, RenditionError>>()?;

        Ok(DerivedRenditions {
            width,
            height,
            renditions,
        })
    }

    /// `derive` on the blocking thread pool.
    pub async fn derive_async(
        self: Arc<Self>,
        original: Bytes,
    ) -> Result<DerivedRenditions, RenditionError> {
        tokio::task::spawn_blocking(move || self.derive(&original))
            .await
            .map_err(|e| RenditionError::Panicked(e.to_string()))?
    }

    /// Cover-crop to a `size` square and encode as JPEG.
    fn render(&self, img: &DynamicImage, size: SizeLabel) -> Result<Bytes, RenditionError> {
        let edge = size.pixels();
        // JPEG has no alpha channel.
        let resized = DynamicImage::ImageRgb8(
            img.resize_to_fill(edge, edge, FilterType::Lanczos3)
                .to_rgb8(),
        );

        let mut buf = Vec::new();
        resized
            .write_to(
                &mut Cursor::new(&mut buf),
                ImageOutputFormat::Jpeg(self.config.jpeg_quality),
            )
            .map_err(|source| RenditionError::Encode { size, source })?;
        Ok(Bytes::from(buf))
    }
}
