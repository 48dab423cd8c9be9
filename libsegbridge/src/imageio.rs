//! Reading images into matrices and writing masks back to disk

use std::fs;
use std::io;
use std::path::Path;

use image::{DynamicImage, GenericImageView, GrayImage, ImageBuffer, Luma, RgbImage, RgbaImage};

use crate::depth::Depth;
use crate::error::{BridgeError, Result};
use crate::matrix::NativeMatrix;

/// Read an image file into a rows x cols matrix with interleaved channels
pub fn read_matrix(path: &Path) -> Result<NativeMatrix> {
    let image = image::open(path)?;
    let (width, height) = image.dimensions();
    let dims = [height as usize, width as usize];
    let matrix = match image {
        DynamicImage::ImageLuma8(img) => NativeMatrix::from_slice(&dims, 1, img.as_raw())?,
        DynamicImage::ImageRgb8(img) => NativeMatrix::from_slice(&dims, 3, img.as_raw())?,
        DynamicImage::ImageRgba8(img) => NativeMatrix::from_slice(&dims, 4, img.as_raw())?,
        DynamicImage::ImageLuma16(img) => NativeMatrix::from_slice(&dims, 1, img.as_raw())?,
        DynamicImage::ImageRgb16(img) => NativeMatrix::from_slice(&dims, 3, img.as_raw())?,
        DynamicImage::ImageRgba16(img) => NativeMatrix::from_slice(&dims, 4, img.as_raw())?,
        with_alpha @ (DynamicImage::ImageLumaA8(_) | DynamicImage::ImageLumaA16(_)) => {
            NativeMatrix::from_slice(&dims, 4, with_alpha.to_rgba8().as_raw())?
        }
        other => NativeMatrix::from_slice(&dims, 3, other.to_rgb8().as_raw())?,
    };
    log::debug!(
        "Read {} as {} matrix {}x{}",
        path.display(),
        matrix.mat_type(),
        height,
        width
    );
    Ok(matrix)
}

fn dimensions(matrix: &NativeMatrix) -> Result<(u32, u32)> {
    if matrix.rank() > 2 || matrix.is_empty() {
        return Err(BridgeError::InvalidMatrix(format!(
            "cannot store a matrix of shape {:?} as an image",
            matrix.dims()
        )));
    }
    let width = u32::try_from(matrix.cols())
        .map_err(|_| BridgeError::InvalidMatrix("image too wide".to_string()))?;
    let height = u32::try_from(matrix.rows())
        .map_err(|_| BridgeError::InvalidMatrix("image too tall".to_string()))?;
    Ok((width, height))
}

fn buffer_error() -> BridgeError {
    BridgeError::InvalidMatrix("pixel buffer does not match the image size".to_string())
}

/// Write an 8-bit (1, 3 or 4 channels) or 16-bit single-channel matrix as an image.
/// The format follows the file extension.
pub fn write_matrix(path: &Path, matrix: &NativeMatrix) -> Result<()> {
    let (width, height) = dimensions(matrix)?;
    let mat_type = matrix.mat_type();
    let image = match (mat_type.depth(), mat_type.channels()) {
        (Depth::U8, 1) => DynamicImage::ImageLuma8(
            GrayImage::from_raw(width, height, matrix.to_vec::<u8>()?).ok_or_else(buffer_error)?,
        ),
        (Depth::U8, 3) => DynamicImage::ImageRgb8(
            RgbImage::from_raw(width, height, matrix.to_vec::<u8>()?).ok_or_else(buffer_error)?,
        ),
        (Depth::U8, 4) => DynamicImage::ImageRgba8(
            RgbaImage::from_raw(width, height, matrix.to_vec::<u8>()?).ok_or_else(buffer_error)?,
        ),
        (Depth::U16, 1) => DynamicImage::ImageLuma16(
            ImageBuffer::<Luma<u16>, Vec<u16>>::from_raw(width, height, matrix.to_vec::<u16>()?)
                .ok_or_else(buffer_error)?,
        ),
        _ => {
            return Err(BridgeError::InvalidMatrix(format!(
                "no image format for {mat_type} matrices"
            )))
        }
    };
    image.save(path)?;
    log::debug!("Wrote {} matrix to {}", mat_type, path.display());
    Ok(())
}

/// Make sure `dir` exists. When creating it fails, its parent is created
/// first and creation is tried once more.
pub fn ensure_dir(dir: &Path) -> Result<()> {
    if dir.is_dir() {
        return Ok(());
    }
    match fs::create_dir(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => {
            let Some(parent) = dir.parent().filter(|p| !p.as_os_str().is_empty()) else {
                return Err(e.into());
            };
            log::warn!(
                "Creating {} failed ({e}), creating {} first",
                dir.display(),
                parent.display()
            );
            match fs::create_dir(parent) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }
            fs::create_dir(dir)?;
            Ok(())
        }
    }
}
