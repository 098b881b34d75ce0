//! Reference collaborators for running against a local folder tree.

pub mod catalog;
pub mod fetch;
pub mod normalize;
pub mod output;
pub mod raster;

pub use catalog::LocalDirectoryCatalog;
pub use fetch::LocalFetcher;
pub use normalize::TextSanitizer;
pub use output::FileSystemOutput;
pub use raster::ImageRasterizer;

/// Page-image extensions the local collaborators understand.
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "tif", "tiff"];

pub(crate) fn has_image_extension(path: &std::path::Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}
