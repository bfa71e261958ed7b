use rtcr::AppError;

#[test]
fn display_uses_lowercase_category_prefix() {
    let cases = [
        (AppError::Config("bad".into()), "config: bad"),
        (AppError::Kernel("rpc".into()), "kernel: rpc"),
        (AppError::NotFound("child 'x'".into()), "not found: child 'x'"),
        (
            AppError::MissingDependency("cap table".into()),
            "missing dependency: cap table",
        ),
        (
            AppError::ResourceExhausted("quota".into()),
            "resource exhausted: quota",
        ),
        (AppError::InvalidState("idle".into()), "invalid state: idle"),
        (AppError::Worker("stopped".into()), "worker: stopped"),
        (AppError::Ipc("socket".into()), "ipc: socket"),
        (AppError::Io("disk".into()), "io: disk"),
    ];
    for (err, expected) in cases {
        assert_eq!(err.to_string(), expected);
    }
}

#[test]
fn toml_errors_map_to_config() {
    let err = toml::from_str::<toml::Value>("= broken").unwrap_err();
    let app: AppError = err.into();
    assert!(matches!(app, AppError::Config(ref msg) if msg.starts_with("invalid config")));
}

#[test]
fn io_errors_map_to_io() {
    let err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
    let app: AppError = err.into();
    assert_eq!(app, AppError::Io("gone".into()));
}

#[test]
fn errors_are_cloneable_for_every_joiner() {
    let err = AppError::Worker("job failed".into());
    let copy = err.clone();
    assert_eq!(err, copy);
}
