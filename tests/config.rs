//! Engine configuration loaded from disk

use callgate::{ConfigError, Engine, EngineConfig, Fundamental, ModuleBuilder, ScriptState};
use std::io::Write;
use tempfile::NamedTempFile;

extern "C" fn one(a: i32) -> i32 {
    a
}

#[test]
fn test_load_from_file() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[calls]
trace_calls = true
warn_extra_arguments = false
pool_limit = 2
interface_cache_size = 8

[objects]
detect_stack_pointers = false

[closures]
propagate_errors = false
"#
    )
    .unwrap();

    let config = EngineConfig::from_file(file.path()).unwrap();
    assert!(config.calls.trace_calls);
    assert!(config.calls.warn_missing_arguments);
    assert!(!config.calls.warn_extra_arguments);
    assert_eq!(config.calls.pool_limit, 2);
    assert_eq!(config.calls.interface_cache_size, 8);
    assert!(!config.objects.detect_stack_pointers);
    assert!(!config.closures.propagate_errors);
}

#[test]
fn test_missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = EngineConfig::from_file(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::Io(_)));
}

#[test]
fn test_empty_file_gives_defaults() {
    let file = NamedTempFile::new().unwrap();
    let config = EngineConfig::from_file(file.path()).unwrap();
    assert_eq!(config, EngineConfig::default());
}

#[test]
fn test_loaded_config_drives_the_engine() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "[calls]\nwarn_extra_arguments = false").unwrap();
    let engine = Engine::new(EngineConfig::from_file(file.path()).unwrap());

    let mut b = ModuleBuilder::new("cfg");
    let int = b.fundamental("int", Fundamental::Int);
    b.native("one", one as usize, int, &[int.into()]);
    engine.register_module(b.build().unwrap()).unwrap();

    let state = ScriptState::new();
    engine.invoke(&state, "one", &[1.into(), 2.into()]).unwrap();
    assert_eq!(engine.stats().warnings, 0);
    engine.invoke(&state, "one", &[]).unwrap();
    assert_eq!(engine.stats().warnings, 1);
}
