use std::fs;
use std::path::PathBuf;

use segbridge::settings::{FrameErrorPolicy, InputMode};
use segbridge::*;
use tempfile::TempDir;

const LEGACY_YAML: &str = "%YAML:1.0
---
py_path: \"/opt/models\"
module_name: \"dynseg\"
class_name: \"DynSeg\"
get_dyn_seg: \"get_dyn_seg\"
";

#[test]
fn test_yaml_with_legacy_keys() {
    let settings = SegmentationSettings::from_yaml_str(LEGACY_YAML).unwrap();
    assert_eq!(settings.search_path.as_deref(), Some("/opt/models"));
    assert_eq!(settings.module_name, "dynseg");
    assert_eq!(settings.class_name, "DynSeg");
    assert_eq!(settings.method_name, "get_dyn_seg");
    assert_eq!(settings.input_mode, InputMode::Array);
    assert_eq!(settings.frame_error_policy, FrameErrorPolicy::Skip);
    assert!(settings.allow_nd);
    assert_eq!(settings.search_paths(), vec![PathBuf::from("/opt/models")]);
}

#[test]
fn test_yaml_with_all_fields() {
    let text = "
search_path: /a
module_name: seg
class_name: Seg
method_name: run
warmup_image: /data/first.png
input_mode: path
frame_error_policy:
  mode: retry
  attempts: 3
allow_nd: false
";
    let settings = SegmentationSettings::from_yaml_str(text).unwrap();
    assert_eq!(settings.input_mode, InputMode::Path);
    assert_eq!(settings.frame_error_policy, FrameErrorPolicy::Retry { attempts: 3 });
    assert_eq!(settings.frame_error_policy.max_calls(), 4);
    assert_eq!(settings.warmup_image, Some(PathBuf::from("/data/first.png")));
    assert!(!settings.allow_nd);
}

#[test]
fn test_toml_settings() {
    let text = r#"
module_name = "seg"
class_name = "Seg"
method_name = "run"

[frame_error_policy]
mode = "abort"
"#;
    let settings = SegmentationSettings::from_toml_str(text).unwrap();
    assert!(settings.frame_error_policy.aborts());
    assert_eq!(settings.frame_error_policy.max_calls(), 1);
    assert!(settings.search_paths().is_empty());
}

#[test]
fn test_missing_field_is_a_settings_error() {
    let error = SegmentationSettings::from_yaml_str("module_name: seg\n").unwrap_err();
    assert!(matches!(error, BridgeError::Settings(_)));
    assert!(error.is_fatal());
}

#[test]
fn test_validation() {
    assert!(SegmentationSettings::new("m", "C", "f").validate().is_ok());
    assert!(SegmentationSettings::new("m", " ", "f").validate().is_err());
    assert!(SegmentationSettings::new("", "C", "f").validate().is_err());

    let mut settings = SegmentationSettings::new("m", "C", "f");
    settings.frame_error_policy = FrameErrorPolicy::Retry { attempts: 0 };
    assert!(settings.validate().is_err());
}

#[test]
fn test_load_picks_format_from_extension() {
    let dir = TempDir::new().unwrap();

    let yaml = dir.path().join("settings.yaml");
    fs::write(&yaml, LEGACY_YAML).unwrap();
    assert_eq!(SegmentationSettings::load(&yaml).unwrap().class_name, "DynSeg");

    let toml = dir.path().join("settings.toml");
    fs::write(&toml, "module_name = \"a\"\nclass_name = \"B\"\nmethod_name = \"c\"\n").unwrap();
    assert_eq!(SegmentationSettings::load(&toml).unwrap().module_name, "a");

    let json = dir.path().join("settings.json");
    fs::write(&json, "{}").unwrap();
    assert!(matches!(
        SegmentationSettings::load(&json),
        Err(BridgeError::Settings(_))
    ));

    let invalid = dir.path().join("invalid.toml");
    fs::write(&invalid, "module_name = \"\"\nclass_name = \"B\"\nmethod_name = \"c\"\n").unwrap();
    assert!(SegmentationSettings::load(&invalid).is_err());

    assert!(matches!(
        SegmentationSettings::load(&dir.path().join("absent.yaml")),
        Err(BridgeError::IoError(_))
    ));
}
