//! Request/response contracts of the three generation stages.
//!
//! Field names follow the generators' JSON wire format, so the same types are
//! serialized by the HTTP adapters and stored as task results.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// A stage call that did not produce a usable result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct StageFailure {
    pub message: String,
}

impl StageFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for StageFailure {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{err:#}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoryRequest {
    pub summary: String,
    pub num_scenes: u32,
    #[serde(rename = "user_id")]
    pub owner_id: Uuid,
    pub book_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoryScene {
    pub number: u32,
    pub narrative: String,
    pub scene_description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MainCharacter {
    pub description: String,
    #[serde(default)]
    pub tokens: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoryResult {
    pub scenes: Vec<StoryScene>,
    pub main_character: MainCharacter,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRequest {
    pub subject_prompt: String,
    pub subject_tokens: Vec<String>,
    pub scenes: Vec<StoryScene>,
    pub style_prompt: String,
    #[serde(rename = "user_id")]
    pub owner_id: Uuid,
    pub book_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedImage {
    pub scene_number: u32,
    pub image_url: String,
    #[serde(alias = "s3_key")]
    pub image_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageResult {
    pub images: Vec<GeneratedImage>,
}

impl ImageResult {
    /// Asset key of the first image, used as the book cover.
    #[must_use]
    pub fn cover_key(&self) -> Option<&str> {
        self.images.first().map(|image| image.image_key.as_str())
    }
}

/// Story scene annotated with its illustration, as sent to PDF assembly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IllustratedScene {
    pub number: u32,
    pub narrative: String,
    pub scene_description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(
        rename = "image_s3_key",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub image_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PdfRequest {
    pub title: String,
    #[serde(rename = "main_character_desc")]
    pub main_character_description: String,
    pub scenes: Vec<IllustratedScene>,
    pub template_type: String,
    #[serde(rename = "user_id")]
    pub owner_id: Uuid,
    pub book_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PdfResult {
    #[serde(alias = "s3_key")]
    pub pdf_asset_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdf_url: Option<String>,
}

#[async_trait]
pub trait StoryPort: Send + Sync {
    async fn generate_story(&self, request: &StoryRequest) -> Result<StoryResult, StageFailure>;
}

#[async_trait]
pub trait ImagePort: Send + Sync {
    async fn generate_images(&self, request: &ImageRequest) -> Result<ImageResult, StageFailure>;
}

#[async_trait]
pub trait PdfPort: Send + Sync {
    async fn generate_pdf(&self, request: &PdfRequest) -> Result<PdfResult, StageFailure>;
}

/// Annotates each scene with the image generated for the same scene number.
///
/// Scenes without a matching image, or all scenes when no image stage ran,
/// pass through unannotated. The first image wins if a number repeats.
#[must_use]
pub fn merge_scene_images(
    scenes: &[StoryScene],
    images: Option<&ImageResult>,
) -> Vec<IllustratedScene> {
    scenes
        .iter()
        .map(|scene| {
            let image = images.and_then(|result| {
                result
                    .images
                    .iter()
                    .find(|image| image.scene_number == scene.number)
            });
            IllustratedScene {
                number: scene.number,
                narrative: scene.narrative.clone(),
                scene_description: scene.scene_description.clone(),
                image_url: image.map(|image| image.image_url.clone()),
                image_key: image.map(|image| image.image_key.clone()),
            }
        })
        .collect()
}
