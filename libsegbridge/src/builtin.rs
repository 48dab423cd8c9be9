//! Built-in segmentation collaborator: foreground/background split of the
//! luminance at its Otsu threshold.

use image::{DynamicImage, GrayImage, RgbImage, RgbaImage};
use imageproc::contrast::{otsu_level, threshold};

use crate::depth::ElementType;
use crate::foreign::{ForeignArray, ForeignObject};
use crate::runtime::{ErrorKind, ForeignClass, ForeignInstance, Module, RaisedError, Runtime};

pub const MODULE_NAME: &str = "segbridge_builtin";
pub const CLASS_NAME: &str = "OtsuSegmenter";
pub const METHOD_NAME: &str = "segment";

/// The built-in module, ready to register
pub fn module() -> Module {
    Module::new(MODULE_NAME).with_class(OtsuSegmenterClass)
}

pub fn register(runtime: &Runtime) {
    runtime.register_module(module());
}

struct OtsuSegmenterClass;

impl ForeignClass for OtsuSegmenterClass {
    fn name(&self) -> &str {
        CLASS_NAME
    }

    fn instantiate(
        &self,
        _runtime: &Runtime,
        args: &[ForeignObject],
    ) -> Result<Box<dyn ForeignInstance>, RaisedError> {
        if !args.is_empty() {
            return Err(RaisedError::new(
                ErrorKind::TypeError,
                format!("{CLASS_NAME}() takes no arguments ({} given)", args.len()),
            ));
        }
        Ok(Box::new(OtsuSegmenter { frames: 0 }))
    }
}

struct OtsuSegmenter {
    frames: u64,
}

impl ForeignInstance for OtsuSegmenter {
    fn has_method(&self, name: &str) -> bool {
        name == METHOD_NAME
    }

    fn call_method(
        &mut self,
        runtime: &Runtime,
        _name: &str,
        args: &[ForeignObject],
    ) -> Result<ForeignObject, RaisedError> {
        let gray = match args {
            [ForeignObject::Str(path)] => image::open(path)
                .map_err(|e| RaisedError::new(ErrorKind::ValueError, format!("{path}: {e}")))?
                .to_luma8(),
            [ForeignObject::Array(array)] => gray_from_array(array)?,
            _ => {
                return Err(RaisedError::new(
                    ErrorKind::TypeError,
                    format!("{METHOD_NAME}() expects one image array or path"),
                ))
            }
        };

        let level = otsu_level(&gray);
        let mask = threshold(&gray, level);
        let (width, height) = mask.dimensions();
        self.frames += 1;
        log::debug!("Otsu mask #{} at level {level}", self.frames);

        ForeignArray::from_vec(runtime, &[height as usize, width as usize], mask.into_raw())
            .map(ForeignObject::Array)
            .map_err(|e| RaisedError::new(ErrorKind::MemoryError, e.to_string()))
    }
}

fn gray_from_array(array: &ForeignArray) -> Result<GrayImage, RaisedError> {
    if array.element_type() != ElementType::UInt8 {
        return Err(RaisedError::new(
            ErrorKind::TypeError,
            format!("expected a uint8 image, got {}", array.element_type()),
        ));
    }
    let (height, width, channels) = match *array.extents() {
        [height, width] => (height, width, 1),
        [height, width, channels] => (height, width, channels),
        ref other => {
            return Err(RaisedError::new(
                ErrorKind::ValueError,
                format!("expected an image of rank 2 or 3, got shape {other:?}"),
            ))
        }
    };
    let size_error = || RaisedError::new(ErrorKind::ValueError, "image dimensions out of range");
    let width = u32::try_from(width).map_err(|_| size_error())?;
    let height = u32::try_from(height).map_err(|_| size_error())?;

    let bytes = array.to_bytes();
    let gray = match channels {
        1 => GrayImage::from_raw(width, height, bytes),
        3 => RgbImage::from_raw(width, height, bytes).map(|rgb| DynamicImage::ImageRgb8(rgb).to_luma8()),
        4 => RgbaImage::from_raw(width, height, bytes)
            .map(|rgba| DynamicImage::ImageRgba8(rgba).to_luma8()),
        _ => None,
    };
    gray.ok_or_else(|| {
        RaisedError::new(
            ErrorKind::ValueError,
            format!("cannot read a {channels}-channel image"),
        )
    })
}
