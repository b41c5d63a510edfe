//! Photo metadata, the rendition size ladder, and the object naming scheme
//! shared by the upload path, the resize worker, and retrieval.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, types::Json};
use std::{collections::BTreeMap, fmt};
use thiserror::Error;
use uuid::Uuid;

/// Prefix under which stored objects are served.
pub const MEDIA_PREFIX: &str = "/media/images";

/// Label used for the original in URL maps.
pub const ORIGINAL_LABEL: &str = "orig";

/// Image formats accepted on upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageType {
    Jpeg,
    Png,
}

impl ImageType {
    /// Map a MIME type to a supported image type. Parameters such as
    /// `; charset=` are ignored.
    pub fn from_mime(mime: &str) -> Option<Self> {
        let essence = mime.split(';').next().unwrap_or("").trim();
        if essence.eq_ignore_ascii_case("image/jpeg") {
            Some(Self::Jpeg)
        } else if essence.eq_ignore_ascii_case("image/png") {
            Some(Self::Png)
        } else {
            None
        }
    }

    pub fn mime(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
        }
    }
}

/// One rung of the rendition ladder. Variants are declared largest first so
/// ordered collections iterate in ladder order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SizeLabel {
    #[serde(rename = "1024")]
    S1024,
    #[serde(rename = "640")]
    S640,
    #[serde(rename = "256")]
    S256,
    #[serde(rename = "128")]
    S128,
}

impl SizeLabel {
    /// The fixed, descending ladder of square target sizes.
    pub const LADDER: [SizeLabel; 4] = [Self::S1024, Self::S640, Self::S256, Self::S128];

    /// Edge length of the square rendition in pixels.
    pub fn pixels(self) -> u32 {
        match self {
            Self::S1024 => 1024,
            Self::S640 => 640,
            Self::S256 => 256,
            Self::S128 => 128,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::S1024 => "1024",
            Self::S640 => "640",
            Self::S256 => "256",
            Self::S128 => "128",
        }
    }

    /// Whether an original of `width`×`height` can produce this size
    /// without upscaling.
    pub fn fits(self, width: u32, height: u32) -> bool {
        width >= self.pixels() && height >= self.pixels()
    }

    /// Ladder sizes an original of `width`×`height` is eligible for.
    pub fn eligible(width: u32, height: u32) -> Vec<SizeLabel> {
        Self::LADDER
            .into_iter()
            .filter(|size| size.fits(width, height))
            .collect()
    }
}

impl fmt::Display for SizeLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mapping from size label to the identifier of the rendition object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RenditionMap(BTreeMap<SizeLabel, Uuid>);

impl RenditionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, size: SizeLabel, object_id: Uuid) {
        self.0.insert(size, object_id);
    }

    pub fn get(&self, size: SizeLabel) -> Option<Uuid> {
        self.0.get(&size).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn labels(&self) -> impl Iterator<Item = SizeLabel> + '_ {
        self.0.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SizeLabel, Uuid)> + '_ {
        self.0.iter().map(|(size, id)| (*size, *id))
    }

    /// Returns the first size that an original of `width`×`height` could not
    /// have produced.
    pub fn check_within(&self, width: u32, height: u32) -> Result<(), SizeLabel> {
        match self.labels().find(|size| !size.fits(width, height)) {
            Some(size) => Err(size),
            None => Ok(()),
        }
    }
}

/// Filename of the stored original.
pub fn original_filename(id: Uuid, image_type: ImageType) -> String {
    format!("{}-{}.{}", id, ORIGINAL_LABEL, image_type.extension())
}

/// Filename of a rendition. Renditions are always JPEG.
pub fn rendition_filename(id: Uuid, size: SizeLabel) -> String {
    format!("{}-{}.jpg", id, size)
}

pub fn media_url(filename: &str) -> String {
    format!("{}/{}", MEDIA_PREFIX, filename)
}

const MAX_BUSINESS_ID_LEN: usize = 128;
const MAX_CAPTION_LEN: usize = 2048;

/// Why an upload's fields were rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PhotoValidationError {
    #[error("businessid is required")]
    MissingBusinessId,
    #[error("businessid must be at most 128 characters")]
    BusinessIdTooLong,
    #[error("caption must be at most 2048 characters")]
    CaptionTooLong,
}

/// Validated fields of an upload, before the original is stored.
#[derive(Debug, Clone)]
pub struct NewPhoto {
    pub business_id: String,
    pub caption: Option<String>,
    pub image_type: ImageType,
}

impl NewPhoto {
    /// Trim and check the form fields. A blank caption counts as absent.
    pub fn new(
        business_id: Option<String>,
        caption: Option<String>,
        image_type: ImageType,
    ) -> Result<Self, PhotoValidationError> {
        let business_id = business_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .ok_or(PhotoValidationError::MissingBusinessId)?;
        if business_id.chars().count() > MAX_BUSINESS_ID_LEN {
            return Err(PhotoValidationError::BusinessIdTooLong);
        }

        let caption = caption
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());
        if caption
            .as_ref()
            .is_some_and(|c| c.chars().count() > MAX_CAPTION_LEN)
        {
            return Err(PhotoValidationError::CaptionTooLong);
        }

        Ok(Self {
            business_id,
            caption,
            image_type,
        })
    }
}

/// A row of the `photos` table.
#[derive(Clone, FromRow, Debug)]
pub struct Photo {
    /// Same identifier as the original's stored object.
    pub id: Uuid,

    /// Owning business.
    pub business_id: String,

    pub caption: Option<String>,

    /// MIME type of the original.
    pub content_type: String,

    /// Rendition map; `None` until the resize worker has run.
    pub sizes: Option<Json<RenditionMap>>,

    /// Set by the worker together with `sizes`.
    pub processed_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
}

impl Photo {
    pub fn image_type(&self) -> Option<ImageType> {
        ImageType::from_mime(&self.content_type)
    }

    pub fn renditions(&self) -> RenditionMap {
        self.sizes
            .as_ref()
            .map(|Json(map)| map.clone())
            .unwrap_or_default()
    }

    pub fn is_processed(&self) -> bool {
        self.processed_at.is_some()
    }

    /// One URL per available size, plus the original under `"orig"`.
    pub fn urls(&self) -> BTreeMap<String, String> {
        let mut urls = BTreeMap::new();
        if let Some(image_type) = self.image_type() {
            urls.insert(
                ORIGINAL_LABEL.to_string(),
                media_url(&original_filename(self.id, image_type)),
            );
        }
        for size in self.renditions().labels() {
            urls.insert(
                size.to_string(),
                media_url(&rendition_filename(self.id, size)),
            );
        }
        urls
    }
}
