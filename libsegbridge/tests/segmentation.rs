use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use image::GrayImage;
use segbridge::builtin::{self, CLASS_NAME, METHOD_NAME, MODULE_NAME};
use segbridge::imageio;
use segbridge::matrix::Ownership;
use segbridge::runtime::{ErrorKind, ForeignClass, ForeignInstance, Module, RaisedError};
use segbridge::settings::{FrameErrorPolicy, InputMode};
use segbridge::{
    BridgeError, Depth, ForeignArray, ForeignObject, MatType, NativeMatrix, Runtime,
    SegmentationInput, SegmentationSettings, SemanticSegmenter,
};
use tempfile::TempDir;

fn builtin_runtime() -> Arc<Runtime> {
    let _ = env_logger::builder().is_test(true).try_init();
    let runtime = Runtime::new();
    builtin::register(&runtime);
    runtime
}

fn builtin_settings() -> SegmentationSettings {
    SegmentationSettings::new(MODULE_NAME, CLASS_NAME, METHOD_NAME)
}

fn split_image() -> NativeMatrix {
    let pixels: Vec<u8> = (0..16).map(|i| if i % 4 < 2 { 10 } else { 240 }).collect();
    NativeMatrix::from_slice(&[4, 4], 1, &pixels).unwrap()
}

/// Collaborator whose method returns a canned object and counts its calls
struct ScriptedClass {
    reply: fn(&Runtime) -> Result<ForeignObject, RaisedError>,
    calls: Arc<AtomicUsize>,
}

struct ScriptedInstance {
    reply: fn(&Runtime) -> Result<ForeignObject, RaisedError>,
    calls: Arc<AtomicUsize>,
}

impl ForeignClass for ScriptedClass {
    fn name(&self) -> &str {
        "Scripted"
    }

    fn instantiate(
        &self,
        _runtime: &Runtime,
        _args: &[ForeignObject],
    ) -> Result<Box<dyn ForeignInstance>, RaisedError> {
        Ok(Box::new(ScriptedInstance {
            reply: self.reply,
            calls: Arc::clone(&self.calls),
        }))
    }
}

impl ForeignInstance for ScriptedInstance {
    fn has_method(&self, name: &str) -> bool {
        name == "run"
    }

    fn call_method(
        &mut self,
        runtime: &Runtime,
        _name: &str,
        _args: &[ForeignObject],
    ) -> Result<ForeignObject, RaisedError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.reply)(runtime)
    }
}

fn scripted(
    reply: fn(&Runtime) -> Result<ForeignObject, RaisedError>,
    policy: FrameErrorPolicy,
) -> (Arc<Runtime>, SemanticSegmenter, Arc<AtomicUsize>) {
    let runtime = Runtime::new();
    let calls = Arc::new(AtomicUsize::new(0));
    runtime.register_module(Module::new("scripted").with_class(ScriptedClass {
        reply,
        calls: Arc::clone(&calls),
    }));
    let mut settings = SegmentationSettings::new("scripted", "Scripted", "run");
    settings.frame_error_policy = policy;
    let segmenter = SemanticSegmenter::initialize(Arc::clone(&runtime), settings).unwrap();
    (runtime, segmenter, calls)
}

#[test]
fn test_builtin_segments_an_image() {
    let runtime = builtin_runtime();
    let mut segmenter = SemanticSegmenter::initialize(Arc::clone(&runtime), builtin_settings()).unwrap();

    let image = split_image();
    let mask = segmenter.segment(SegmentationInput::Image(&image)).unwrap();

    assert_eq!(mask.dims(), &[4, 4]);
    assert_eq!(mask.mat_type(), MatType::single(Depth::U8));
    assert!(matches!(mask.ownership(), Some(Ownership::Native)));
    let dark = mask.get::<u8>(&[0, 0], 0).unwrap();
    let bright = mask.get::<u8>(&[0, 3], 0).unwrap();
    assert_eq!(dark, 0);
    assert_eq!(bright, 255);
    assert_eq!(mask.get::<u8>(&[3, 1], 0), Some(dark));
    assert_eq!(mask.get::<u8>(&[3, 2], 0), Some(bright));

    assert_eq!(runtime.live_holds(), 0);
    assert!(!runtime.error_occurred());
    assert!(!runtime.gil().is_held());
}

#[test]
fn test_builtin_accepts_colour_images() {
    let runtime = builtin_runtime();
    let mut segmenter = SemanticSegmenter::initialize(runtime, builtin_settings()).unwrap();

    let pixels: Vec<u8> = (0..6 * 5)
        .flat_map(|i| if i % 5 < 2 { [0, 0, 0] } else { [250, 250, 250] })
        .collect();
    let image = NativeMatrix::from_slice(&[6, 5], 3, &pixels).unwrap();
    let mask = segmenter.segment(SegmentationInput::Image(&image)).unwrap();

    assert_eq!(mask.dims(), &[6, 5]);
    assert_eq!(mask.channels(), 1);
    assert_ne!(mask.get::<u8>(&[0, 0], 0), mask.get::<u8>(&[0, 4], 0));
}

#[test]
fn test_builtin_rejects_float_images() {
    let runtime = builtin_runtime();
    let mut segmenter = SemanticSegmenter::initialize(Arc::clone(&runtime), builtin_settings()).unwrap();

    let image = NativeMatrix::from_slice(&[2, 2], 1, &[0.0_f32, 1.0, 0.5, 0.25]).unwrap();
    let error = segmenter.segment(SegmentationInput::Image(&image)).unwrap_err();

    assert!(matches!(error, BridgeError::Invocation { .. }));
    assert!(error.is_recoverable());
    assert!(error.to_string().contains("OtsuSegmenter.segment"));
    assert!(!runtime.error_occurred());
}

#[test]
fn test_missing_module_is_fatal() {
    let runtime = builtin_runtime();
    let settings = SegmentationSettings::new("no_such_module", CLASS_NAME, METHOD_NAME);
    let error = SemanticSegmenter::initialize(Arc::clone(&runtime), settings).unwrap_err();

    assert!(matches!(error, BridgeError::Initialization(_)));
    assert!(error.is_fatal());
    assert!(error.to_string().contains("no_such_module"));
    assert!(!runtime.error_occurred());
}

#[test]
fn test_missing_class_is_fatal() {
    let runtime = builtin_runtime();
    let settings = SegmentationSettings::new(MODULE_NAME, "NoSuchClass", METHOD_NAME);
    let error = SemanticSegmenter::initialize(runtime, settings).unwrap_err();
    assert!(matches!(error, BridgeError::Initialization(message) if message.contains("NoSuchClass")));
}

#[test]
fn test_missing_method_is_fatal() {
    let runtime = builtin_runtime();
    let settings = SegmentationSettings::new(MODULE_NAME, CLASS_NAME, "get_dyn_seg");
    let error = SemanticSegmenter::initialize(runtime, settings).unwrap_err();
    assert!(matches!(error, BridgeError::Initialization(message) if message.contains("get_dyn_seg")));
}

#[test]
fn test_invalid_settings_are_rejected_before_startup() {
    let runtime = builtin_runtime();
    let settings = SegmentationSettings::new(MODULE_NAME, "", METHOD_NAME);
    let error = SemanticSegmenter::initialize(Arc::clone(&runtime), settings).unwrap_err();
    assert!(matches!(error, BridgeError::Settings(_)));
    assert!(!runtime.is_initialized());
}

#[test]
fn test_failing_call_is_retried() {
    let (runtime, mut segmenter, calls) = scripted(
        |_| Err(RaisedError::new(ErrorKind::ValueError, "model exploded")),
        FrameErrorPolicy::Retry { attempts: 2 },
    );

    let image = split_image();
    let error = segmenter.segment(SegmentationInput::Image(&image)).unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    match error {
        BridgeError::Invocation { target, message } => {
            assert_eq!(target, "Scripted.run");
            assert_eq!(message, "ValueError: model exploded");
        }
        other => panic!("unexpected error {other}"),
    }
    assert!(!runtime.error_occurred());
}

#[test]
fn test_skip_policy_calls_once() {
    let (_runtime, mut segmenter, calls) = scripted(
        |_| Err(RaisedError::new(ErrorKind::RuntimeError, "no")),
        FrameErrorPolicy::Skip,
    );
    let image = split_image();
    assert!(segmenter.segment(SegmentationInput::Image(&image)).is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_non_array_result_is_reported() {
    let (runtime, mut segmenter, _calls) =
        scripted(|_| Ok(ForeignObject::Int(4)), FrameErrorPolicy::Skip);
    let image = split_image();
    let error = segmenter.segment(SegmentationInput::Image(&image)).unwrap_err();

    assert!(error.to_string().contains("not a mask"));
    assert!(!runtime.error_occurred());
}

#[test]
fn test_float_mask_is_saturated_to_bytes() {
    let (runtime, mut segmenter, _calls) = scripted(
        |runtime| {
            ForeignArray::from_vec(runtime, &[2, 2], vec![-3.0_f32, 0.4, 1.6, 900.0])
                .map(ForeignObject::Array)
                .map_err(|e| RaisedError::new(ErrorKind::MemoryError, e.to_string()))
        },
        FrameErrorPolicy::Skip,
    );
    let image = split_image();
    let mask = segmenter.segment(SegmentationInput::Image(&image)).unwrap();

    assert_eq!(mask.to_vec::<u8>().unwrap(), vec![0, 0, 2, 255]);
    assert_eq!(runtime.live_holds(), 0);
    assert_eq!(runtime.live_storage(), 0);
}

#[test]
fn test_path_input_and_mask_file() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("frame.png");
    GrayImage::from_fn(8, 6, |x, _| image::Luma([if x < 4 { 20 } else { 230 }]))
        .save(&input)
        .unwrap();

    let runtime = builtin_runtime();
    let mut settings = builtin_settings();
    settings.input_mode = InputMode::Path;
    let mut segmenter = SemanticSegmenter::initialize(runtime, settings).unwrap();

    let out_dir = dir.path().join("results").join("masks");
    let mask = segmenter
        .segment_to_file(&input, &out_dir, "frame_mask.png")
        .unwrap();
    assert_eq!(mask.dims(), &[6, 8]);

    let written = imageio::read_matrix(&out_dir.join("frame_mask.png")).unwrap();
    assert_eq!(written.dims(), &[6, 8]);
    assert_eq!(written.to_vec::<u8>().unwrap(), mask.to_vec::<u8>().unwrap());
}

#[test]
fn test_warmup_image_is_segmented_at_startup() {
    let dir = TempDir::new().unwrap();
    let warmup = dir.path().join("warmup.png");
    GrayImage::from_fn(4, 4, |x, y| image::Luma([u8::try_from((x + y) * 30).unwrap()]))
        .save(&warmup)
        .unwrap();

    let runtime = builtin_runtime();
    let mut settings = builtin_settings();
    settings.warmup_image = Some(warmup);
    assert!(SemanticSegmenter::initialize(Arc::clone(&runtime), settings).is_ok());

    let mut broken = builtin_settings();
    broken.warmup_image = Some(dir.path().join("missing.png"));
    let error = SemanticSegmenter::initialize(runtime, broken).unwrap_err();
    assert!(matches!(error, BridgeError::Initialization(_)));
}

#[test]
fn test_shutdown_finalizes_the_runtime() {
    let runtime = builtin_runtime();
    let mut segmenter = SemanticSegmenter::initialize(Arc::clone(&runtime), builtin_settings()).unwrap();
    let image = split_image();
    let mask = segmenter.segment(SegmentationInput::Image(&image)).unwrap();

    segmenter.shutdown().unwrap();
    assert!(!runtime.is_initialized());
    assert_eq!(mask.total(), 16);

    let error = SemanticSegmenter::initialize(runtime, builtin_settings()).unwrap_err();
    assert!(matches!(error, BridgeError::Initialization(_)));
}

#[test]
fn test_ensure_dir_creates_one_missing_parent() {
    let dir = TempDir::new().unwrap();
    let nested = dir.path().join("a").join("b");
    imageio::ensure_dir(&nested).unwrap();
    assert!(nested.is_dir());
    imageio::ensure_dir(&nested).unwrap();

    let too_deep = dir.path().join("x").join("y").join("z");
    assert!(imageio::ensure_dir(&too_deep).is_err());
}

#[test]
fn test_segmenter_debug_names_its_target() {
    let runtime = builtin_runtime();
    let segmenter = SemanticSegmenter::initialize(runtime, builtin_settings()).unwrap();
    let debug = format!("{segmenter:?}");
    assert!(debug.contains("OtsuSegmenter.segment"));
    assert!(debug.contains("Skip"));
}

#[test]
fn test_failed_argument_conversion_leaves_indicator_empty() {
    let runtime = builtin_runtime();
    let mut segmenter = SemanticSegmenter::initialize(Arc::clone(&runtime), builtin_settings()).unwrap();
    runtime.finalize().unwrap();

    let image = split_image();
    let error = segmenter.segment(SegmentationInput::Image(&image)).unwrap_err();
    assert!(matches!(error, BridgeError::InvalidArray(_)));
    assert!(error.is_recoverable());
    assert!(!runtime.error_occurred());
}

#[test]
fn test_search_path_is_split_into_runtime_entries() {
    let runtime = builtin_runtime();
    let dir = TempDir::new().unwrap();
    let first = dir.path().join("models");
    let second = dir.path().join("vendor");
    let joined = std::env::join_paths([&first, &second]).unwrap();

    let mut settings = builtin_settings();
    settings.search_path = Some(joined.to_string_lossy().into_owned());
    let _segmenter = SemanticSegmenter::initialize(Arc::clone(&runtime), settings).unwrap();

    assert_eq!(runtime.search_path(), vec![first, second]);
}
