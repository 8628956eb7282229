pub mod headers;
mod http;
pub mod image;
pub mod pdf;
pub mod story;

pub use http::StageHttpConfig;
pub use image::ImageClient;
pub use pdf::PdfClient;
pub use story::StoryClient;
