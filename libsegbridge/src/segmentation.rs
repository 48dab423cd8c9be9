//! Segmentation driver: owns the collaborator instance living in the runtime
//! and turns its per-frame output into native mask matrices.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::converter::Converter;
use crate::depth::Depth;
use crate::error::{BridgeError, Result};
use crate::foreign::ForeignObject;
use crate::imageio;
use crate::matrix::NativeMatrix;
use crate::runtime::{Instance, RaisedError, Runtime};
use crate::settings::{InputMode, SegmentationSettings};

/// An image handed to the collaborator
#[derive(Debug, Clone, Copy)]
pub enum SegmentationInput<'a> {
    Image(&'a NativeMatrix),
    Path(&'a Path),
}

/// Long-lived handle on the segmentation collaborator
pub struct SemanticSegmenter {
    runtime: Arc<Runtime>,
    converter: Converter,
    instance: Option<Instance>,
    settings: SegmentationSettings,
}

impl SemanticSegmenter {
    /// Start the runtime and instantiate the collaborator named in `settings`.
    ///
    /// Any failure here is a [`BridgeError::Initialization`]: without the
    /// collaborator nothing downstream can run.
    pub fn initialize(runtime: Arc<Runtime>, settings: SegmentationSettings) -> Result<Self> {
        settings.validate()?;
        log::info!(
            "Importing segmentation collaborator {}.{}",
            settings.module_name,
            settings.class_name
        );

        let instance = {
            let _gil = runtime.gil().ensure();
            let fatal = |error: RaisedError| {
                runtime.clear_error();
                BridgeError::Initialization(error.to_string())
            };

            runtime.initialize(&settings.search_paths()).map_err(fatal)?;
            let module = runtime.import_module(&settings.module_name).map_err(fatal)?;
            log::info!("Module {} imported", settings.module_name);
            let class = runtime
                .get_class(&module, &settings.class_name)
                .map_err(fatal)?;
            let instance = runtime.instantiate(class.as_ref(), &[]).map_err(fatal)?;
            log::info!("Instance of {} created", settings.class_name);

            if !instance.has_method(&settings.method_name) {
                return Err(BridgeError::Initialization(format!(
                    "class {} has no method {}",
                    settings.class_name, settings.method_name
                )));
            }
            instance
        };

        let converter = Converter::new(Arc::clone(&runtime)).with_allow_nd(settings.allow_nd);
        let mut segmenter = Self {
            runtime,
            converter,
            instance: Some(instance),
            settings,
        };

        if let Some(image) = segmenter.settings.warmup_image.clone() {
            log::info!("Loading model parameters with {}", image.display());
            segmenter
                .segment_path(&image)
                .map_err(|e| BridgeError::Initialization(format!("warm-up call failed: {e}")))?;
        }
        Ok(segmenter)
    }

    pub const fn settings(&self) -> &SegmentationSettings {
        &self.settings
    }

    pub const fn converter(&self) -> &Converter {
        &self.converter
    }

    pub const fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    fn target(&self) -> String {
        format!("{}.{}", self.settings.class_name, self.settings.method_name)
    }

    /// Segment one frame. Failed calls are retried as the frame error policy
    /// allows; the error of the last call is returned.
    pub fn segment(&mut self, input: SegmentationInput<'_>) -> Result<NativeMatrix> {
        let calls = self.settings.frame_error_policy.max_calls();
        let mut attempt = 1;
        loop {
            match self.invoke(input) {
                Ok(mask) => return Ok(mask),
                Err(error) if error.is_recoverable() && attempt < calls => {
                    log::warn!("Segmentation attempt {attempt}/{calls} failed: {error}");
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Segment the image stored at `path`, handing it over the way the
    /// settings' input mode asks for
    pub fn segment_path(&mut self, path: &Path) -> Result<NativeMatrix> {
        match self.settings.input_mode {
            InputMode::Path => self.segment(SegmentationInput::Path(path)),
            InputMode::Array => {
                let image = imageio::read_matrix(path)?;
                self.segment(SegmentationInput::Image(&image))
            }
        }
    }

    /// Segment the image at `path` and write the mask to `out_dir/file_name`
    pub fn segment_to_file(
        &mut self,
        path: &Path,
        out_dir: &Path,
        file_name: &str,
    ) -> Result<NativeMatrix> {
        let mask = self.segment_path(path)?;
        imageio::ensure_dir(out_dir)?;
        imageio::write_matrix(&out_dir.join(file_name), &mask)?;
        Ok(mask)
    }

    fn invoke(&mut self, input: SegmentationInput<'_>) -> Result<NativeMatrix> {
        let target = self.target();
        let instance = self.instance.as_mut().ok_or_else(|| {
            BridgeError::Initialization("segmenter has been shut down".to_string())
        })?;

        let gil = self.runtime.gil().ensure();
        let argument = match input {
            SegmentationInput::Image(image) => self.converter.to_foreign(image).map_err(|error| {
                self.runtime.clear_error();
                error
            })?,
            SegmentationInput::Path(path) => ForeignObject::Str(path.to_string_lossy().into_owned()),
        };

        let result = self
            .runtime
            .call_method(instance, &self.settings.method_name, &[argument])
            .map_err(|error| {
                self.runtime.clear_error();
                BridgeError::Invocation {
                    target: target.clone(),
                    message: error.to_string(),
                }
            })?;

        let mask = self.converter.to_matrix(&result).map_err(|error| {
            self.runtime.clear_error();
            BridgeError::Invocation {
                target,
                message: format!("returned value is not a mask: {error}"),
            }
        })?;
        drop(result);

        let converted = {
            let _unlocked = self.runtime.gil().allow_threads()?;
            mask.convert_to(Depth::U8)
        };
        drop(mask);
        drop(gil);
        converted
    }

    /// Drop the collaborator instance and finalize the runtime
    pub fn shutdown(mut self) -> Result<()> {
        self.release_instance();
        self.runtime.finalize()
    }

    fn release_instance(&mut self) {
        if let Some(instance) = self.instance.take() {
            let _gil = self.runtime.gil().ensure();
            drop(instance);
            log::info!("Segmentation collaborator released");
        }
    }
}

impl Drop for SemanticSegmenter {
    fn drop(&mut self) {
        self.release_instance();
    }
}

impl fmt::Debug for SemanticSegmenter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SemanticSegmenter")
            .field("target", &self.target())
            .field("instance", &self.instance.as_ref().map(Instance::class_name))
            .field("input_mode", &self.settings.input_mode)
            .field("frame_error_policy", &self.settings.frame_error_policy)
            .field("converter", &self.converter)
            .finish()
    }
}
