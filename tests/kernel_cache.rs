use std::sync::Arc;

use progressive_path_tracer::{
    config::RendererConfig,
    render_system::{device::host::HostDevice, frame_scheduler::FrameScheduler},
    utils,
};

fn render_once(config: &RendererConfig) -> FrameScheduler<HostDevice> {
    let mut scheduler = FrameScheduler::new(Arc::new(HostDevice::new()), config).unwrap();
    scheduler.upload_scene(utils::cornell_box()).unwrap();
    scheduler.render().unwrap();
    scheduler.synchronize().unwrap();
    scheduler
}

#[test]
fn second_renderer_loads_the_cached_kernel() {
    let dir = tempfile::tempdir().unwrap();
    let json = format!(
        r#"{{
            "resolution": [4, 4],
            "kernel_cache_dir": {:?}
        }}"#,
        dir.path()
    );
    let config = RendererConfig::from_json_str(&json).unwrap();
    assert!(!config.disable_kernel_cache);

    let first = render_once(&config);
    let first = first.compiled_program().unwrap();
    assert!(!first.from_cache);
    assert!(dir.path().read_dir().unwrap().next().is_some());

    let second = render_once(&config);
    let second = second.compiled_program().unwrap();
    assert!(second.from_cache);
    assert_eq!(first.cache_key, second.cache_key);
}

#[test]
fn disabled_cache_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let config = RendererConfig {
        resolution: [4, 4],
        kernel_cache_dir: Some(dir.path().to_owned()),
        disable_kernel_cache: true,
        ..Default::default()
    };
    for _ in 0..2 {
        let scheduler = render_once(&config);
        assert!(!scheduler.compiled_program().unwrap().from_cache);
    }
    assert!(dir.path().read_dir().unwrap().next().is_none());
}
