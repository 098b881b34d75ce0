use std::path::{Path, PathBuf};

use super::has_image_extension;
use crate::pipeline::collaborators::{
    FetchedDocument, PageImage, PageSource, RasterizeError, Rasterizer,
};

/// Decodes single-page image documents into 8-bit grayscale rasters.
pub struct ImageRasterizer;

impl Rasterizer for ImageRasterizer {
    fn to_pages(&self, document: &FetchedDocument) -> Result<Box<dyn PageSource>, RasterizeError> {
        if !has_image_extension(&document.path) {
            return Err(RasterizeError::Unsupported(document.path.display().to_string()));
        }
        // Header check only; pixels are decoded when the page is rendered.
        image::image_dimensions(&document.path).map_err(|e| RasterizeError::Decode {
            page: 0,
            reason: e.to_string(),
        })?;
        Ok(Box::new(ImagePages {
            path: document.path.clone(),
        }))
    }
}

struct ImagePages {
    path: PathBuf,
}

impl PageSource for ImagePages {
    fn page_count(&self) -> usize {
        1
    }

    fn render(&self, index: usize) -> Result<PageImage, RasterizeError> {
        if index != 0 {
            return Err(RasterizeError::Decode {
                page: index,
                reason: "image documents have a single page".into(),
            });
        }
        decode_gray(&self.path, index)
    }
}

fn decode_gray(path: &Path, index: usize) -> Result<PageImage, RasterizeError> {
    let img = image::open(path).map_err(|e| RasterizeError::Decode {
        page: index,
        reason: e.to_string(),
    })?;
    let gray = img.to_luma8();
    let (width, height) = gray.dimensions();
    Ok(PageImage {
        index,
        width,
        height,
        pixels: gray.into_raw(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_png(path: &Path, width: u32, height: u32) {
        let img = image::GrayImage::from_fn(width, height, |x, _| image::Luma([(x * 40) as u8]));
        img.save(path).unwrap();
    }

    #[test]
    fn png_becomes_one_grayscale_page() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.png");
        write_png(&path, 5, 3);

        let doc = FetchedDocument { path, byte_len: 0 };
        let pages = ImageRasterizer.to_pages(&doc).unwrap();
        assert_eq!(pages.page_count(), 1);
        let page = pages.render(0).unwrap();
        assert_eq!((page.width, page.height), (5, 3));
        assert_eq!(page.pixels.len(), 15);
        assert_eq!(page.pixels[1], 40);
        assert!(pages.render(1).is_err());
    }

    #[test]
    fn unsupported_extension_rejected() {
        let doc = FetchedDocument {
            path: PathBuf::from("/tmp/report.pdf"),
            byte_len: 10,
        };
        assert!(matches!(ImageRasterizer.to_pages(&doc), Err(RasterizeError::Unsupported(_))));
    }

    #[test]
    fn corrupt_image_is_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.png");
        std::fs::write(&path, b"not a png").unwrap();
        let doc = FetchedDocument { path, byte_len: 9 };
        assert!(matches!(ImageRasterizer.to_pages(&doc), Err(RasterizeError::Decode { .. })));
    }
}
