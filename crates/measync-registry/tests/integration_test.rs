//! Integration tests for the source registry and poller.
//!
//! Snapshot files live in a temporary folder; live sources talk to a real
//! publisher on localhost.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

use measync_core::{DataModel, RegistryConfig};
use measync_live::Publisher;
use measync_protocol::Endpoint;
use measync_registry::{
    ChannelListener, Poller, RegistryEvent, SourceError, SourceId, SourceRegistry, SourceStatus,
};

fn keys(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|s| s.to_string()).collect()
}

/// A model whose graph keys are `names`.
fn model_with(names: &[&str]) -> DataModel {
    let mut model = DataModel::new().with_attr("sample_rate", 10.0);
    for (i, name) in names.iter().enumerate() {
        model.insert(*name, vec![i as f64, i as f64 + 0.5]).unwrap();
    }
    model
}

fn write_snapshot(dir: &Path, name: &str, keys: &[&str]) {
    measync_core::encode(&dir.join(name), &model_with(keys)).unwrap();
}

fn folder_config(dir: &Path) -> RegistryConfig {
    RegistryConfig {
        source_folder: dir.to_path_buf(),
        poll_interval_ms: 50,
        ..Default::default()
    }
}

fn drain(rx: &mut UnboundedReceiver<RegistryEvent>) -> Vec<RegistryEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn layout_changes(events: &[RegistryEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, RegistryEvent::LayoutChanged(_)))
        .count()
}

#[tokio::test]
async fn test_stale_source_is_retained() {
    let dir = tempfile::tempdir().unwrap();
    write_snapshot(dir.path(), "a.h5", &["temp"]);
    write_snapshot(dir.path(), "b.h5", &["temp", "pressure"]);

    let mut registry = SourceRegistry::init(folder_config(dir.path())).unwrap();
    assert_eq!(registry.len(), 2);

    let report = registry.tick().await;
    assert!(report.is_clean());
    assert_eq!(registry.layout(), &keys(&["temp", "pressure"]));

    std::fs::remove_file(dir.path().join("b.h5")).unwrap();
    let report = registry.tick().await;

    assert_eq!(report.errors.len(), 1);
    let (failed, err) = &report.errors[0];
    assert_eq!(failed, &SourceId::file(dir.path().join("b.h5")));
    assert!(matches!(err, SourceError::NotFound(_)));
    assert!(!report.layout_changed);
    assert_eq!(registry.layout(), &keys(&["temp", "pressure"]));

    let b = registry.source(failed).unwrap();
    assert_eq!(b.status(), SourceStatus::Stale);
    assert_eq!(b.graph_keys(), keys(&["temp", "pressure"]));
}

#[tokio::test]
async fn test_missing_source_evicted_after_ttl() {
    let dir = tempfile::tempdir().unwrap();
    write_snapshot(dir.path(), "a.h5", &["temp"]);
    write_snapshot(dir.path(), "b.h5", &["temp", "pressure"]);

    let config = RegistryConfig {
        evict_stale_after_ms: Some(0),
        ..folder_config(dir.path())
    };
    let mut registry = SourceRegistry::init(config).unwrap();
    registry.tick().await;

    std::fs::remove_file(dir.path().join("b.h5")).unwrap();
    let report = registry.tick().await;

    assert_eq!(report.evicted, vec![SourceId::file(dir.path().join("b.h5"))]);
    assert!(report.layout_changed);
    assert_eq!(registry.layout(), &keys(&["temp"]));
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn test_long_ttl_keeps_missing_source() {
    let dir = tempfile::tempdir().unwrap();
    write_snapshot(dir.path(), "a.h5", &["temp"]);

    let config = RegistryConfig {
        evict_stale_after_ms: Some(60_000),
        ..folder_config(dir.path())
    };
    let mut registry = SourceRegistry::init(config).unwrap();
    registry.tick().await;

    std::fs::remove_file(dir.path().join("a.h5")).unwrap();
    let report = registry.tick().await;
    assert!(report.evicted.is_empty());
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn test_partial_failure_isolation() {
    let dir = tempfile::tempdir().unwrap();
    write_snapshot(dir.path(), "a.h5", &["temp"]);
    write_snapshot(dir.path(), "b.h5", &["pressure"]);
    std::fs::write(dir.path().join("c.h5"), b"MSNP\x02\x00\xa1\x67").unwrap();

    let mut registry = SourceRegistry::init(folder_config(dir.path())).unwrap();
    let report = registry.tick().await;

    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].0, SourceId::file(dir.path().join("c.h5")));
    assert!(matches!(report.errors[0].1, SourceError::Corrupt { .. }));
    assert!(report.errors[0].1.is_transient());

    let a = registry.data(&SourceId::file(dir.path().join("a.h5"))).unwrap();
    let b = registry.data(&SourceId::file(dir.path().join("b.h5"))).unwrap();
    assert_eq!(*a, model_with(&["temp"]));
    assert_eq!(*b, model_with(&["pressure"]));
    assert_eq!(registry.layout(), &keys(&["temp", "pressure"]));

    // Once the writer finishes, the next tick picks it up.
    write_snapshot(dir.path(), "c.h5", &["humidity"]);
    let report = registry.tick().await;
    assert!(report.is_clean());
    assert!(registry.layout().contains("humidity"));
}

#[tokio::test]
async fn test_layout_change_detection() {
    let dir = tempfile::tempdir().unwrap();
    write_snapshot(dir.path(), "a.h5", &["temp", "pressure"]);

    let mut registry = SourceRegistry::init(folder_config(dir.path())).unwrap();
    let (listener, mut rx) = ChannelListener::new();
    registry.add_listener(Box::new(listener));

    registry.tick().await;
    assert_eq!(
        drain(&mut rx),
        vec![
            RegistryEvent::LayoutChanged(keys(&["temp", "pressure"])),
            RegistryEvent::DataRefreshed,
        ]
    );

    // A subset of the existing layout: refresh only.
    write_snapshot(dir.path(), "b.h5", &["temp"]);
    let report = registry.tick().await;
    assert_eq!(report.discovered, vec![SourceId::file(dir.path().join("b.h5"))]);
    assert_eq!(drain(&mut rx), vec![RegistryEvent::DataRefreshed]);

    // A new key: exactly one layout change.
    write_snapshot(dir.path(), "c.h5", &["humidity"]);
    registry.tick().await;
    let events = drain(&mut rx);
    assert_eq!(layout_changes(&events), 1);
    assert_eq!(
        events[0],
        RegistryEvent::LayoutChanged(keys(&["temp", "pressure", "humidity"]))
    );
    assert_eq!(events.last(), Some(&RegistryEvent::DataRefreshed));

    // Nothing changed on disk: refresh still fires.
    registry.tick().await;
    assert_eq!(drain(&mut rx), vec![RegistryEvent::DataRefreshed]);
}

#[tokio::test]
async fn test_watch_folder_disabled() {
    let dir = tempfile::tempdir().unwrap();
    write_snapshot(dir.path(), "a.h5", &["temp"]);

    let config = RegistryConfig {
        watch_folder: false,
        ..folder_config(dir.path())
    };
    let mut registry = SourceRegistry::init(config).unwrap();
    assert!(registry.is_empty());

    let report = registry.tick().await;
    assert!(report.discovered.is_empty());

    assert!(registry.add_source(SourceId::file(dir.path().join("a.h5"))));
    registry.tick().await;
    assert_eq!(registry.layout(), &keys(&["temp"]));
}

#[tokio::test]
async fn test_live_source_refresh() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    let publisher = Publisher::bind(&Endpoint::new("127.0.0.1", port), 10).await.unwrap();
    publisher.publish(&model_with(&["voltage", "current"])).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let config = RegistryConfig {
        watch_folder: false,
        live_poll_timeout_ms: 500,
        live_sources: vec![publisher.endpoint().to_string()],
        ..folder_config(dir.path())
    };
    let mut registry = SourceRegistry::init(config).unwrap();
    let id = SourceId::Live(publisher.endpoint().clone());

    let report = registry.tick().await;
    assert!(report.is_clean(), "{:?}", report);
    assert_eq!(registry.layout(), &keys(&["voltage", "current"]));
    assert_eq!(registry.source(&id).unwrap().status(), SourceStatus::Fresh);

    // No new message: still a success, data unchanged.
    let report = registry.tick().await;
    assert!(report.is_clean());
    assert_eq!(*registry.data(&id).unwrap(), model_with(&["voltage", "current"]));

    // Publisher gone: transport error, previous data kept.
    drop(publisher);
    let mut saw_transport_error = false;
    for _ in 0..10 {
        let report = registry.tick().await;
        if report
            .errors
            .iter()
            .any(|(_, e)| matches!(e, SourceError::Transport { .. }))
        {
            saw_transport_error = true;
            break;
        }
    }
    assert!(saw_transport_error);
    assert_eq!(registry.layout(), &keys(&["voltage", "current"]));
}

#[tokio::test]
async fn test_poller_serializes_commands() {
    let dir = tempfile::tempdir().unwrap();
    write_snapshot(dir.path(), "a.h5", &["temp"]);

    let config = RegistryConfig {
        watch_folder: false,
        ..folder_config(dir.path())
    };
    let mut registry = SourceRegistry::init(config.clone()).unwrap();
    let (listener, mut rx) = ChannelListener::new();
    registry.add_listener(Box::new(listener));

    let poller = Poller::spawn(registry);
    let id = SourceId::file(dir.path().join("a.h5"));
    assert!(poller.add_source(id.clone()).await.unwrap());
    assert!(!poller.add_source(id.clone()).await.unwrap());

    let report = poller.tick_now().await.unwrap();
    assert!(report.is_clean());

    let layout = timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Some(RegistryEvent::LayoutChanged(layout)) => return layout,
                Some(_) => continue,
                None => panic!("listener channel closed"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(layout, keys(&["temp"]));

    let updated = RegistryConfig {
        poll_interval_ms: 20,
        ..config.clone()
    };
    poller.update_config(updated).await.unwrap();

    let invalid = RegistryConfig {
        poll_interval_ms: 0,
        ..config
    };
    assert!(poller.update_config(invalid).await.is_err());

    assert!(poller.remove_source(id.clone()).await.unwrap());
    assert!(poller.is_running());

    let registry = poller.stop().await.unwrap();
    assert!(registry.is_empty());
    assert_eq!(registry.config().poll_interval_ms, 20);
    assert!(registry.ticks() >= 1);

    let events = drain(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, RegistryEvent::ConfigChanged(c) if c.poll_interval_ms == 20)));
}

#[tokio::test]
async fn test_poller_ticks_on_interval() {
    let dir = tempfile::tempdir().unwrap();
    let mut registry = SourceRegistry::init(folder_config(dir.path())).unwrap();
    let (listener, mut rx) = ChannelListener::new();
    registry.add_listener(Box::new(listener));

    let poller = Poller::spawn(registry);

    // A file dropped into the watch folder shows up without any command.
    write_snapshot(dir.path(), "late.h5", &["flow"]);
    let layout = timeout(Duration::from_secs(5), async {
        loop {
            if let Some(RegistryEvent::LayoutChanged(layout)) = rx.recv().await {
                return layout;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(layout, keys(&["flow"]));

    let registry = poller.stop().await.unwrap();
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn test_stop_interrupts_live_poll() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    let publisher = Publisher::bind(&Endpoint::new("127.0.0.1", port), 10).await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let config = RegistryConfig {
        watch_folder: false,
        live_poll_timeout_ms: 30_000,
        live_sources: vec![publisher.endpoint().to_string()],
        ..folder_config(dir.path())
    };
    let poller = Poller::spawn(SourceRegistry::init(config).unwrap());
    tokio::time::sleep(Duration::from_millis(100)).await;

    let registry = timeout(Duration::from_secs(2), poller.stop())
        .await
        .expect("stop waited for the live poll")
        .unwrap();
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn test_stop_returns_registry_with_queued_changes() {
    let dir = tempfile::tempdir().unwrap();
    let poller = Poller::spawn(SourceRegistry::new(folder_config(dir.path())));
    let id = SourceId::file(dir.path().join("x.h5"));
    assert!(poller.add_source(id).await.unwrap());
    let registry = poller.stop().await.unwrap();
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn test_busy_command_queue_does_not_stop_ticks() {
    let dir = tempfile::tempdir().unwrap();
    let config = RegistryConfig {
        poll_interval_ms: 20,
        ..folder_config(dir.path())
    };
    let poller = Poller::spawn(SourceRegistry::new(config));

    let deadline = tokio::time::Instant::now() + Duration::from_millis(400);
    let handle = &poller;
    let folder = dir.path();
    let pump = move |name: &'static str| {
        let poller = handle;
        let id = SourceId::file(folder.join(name));
        async move {
            while tokio::time::Instant::now() < deadline {
                poller.add_source(id.clone()).await.unwrap();
                poller.remove_source(id.clone()).await.unwrap();
            }
        }
    };
    tokio::join!(pump("a.h5"), pump("b.h5"), pump("c.h5"), pump("d.h5"));

    let registry = poller.stop().await.unwrap();
    assert!(registry.ticks() >= 5, "only {} ticks", registry.ticks());
    assert!(registry.is_empty());
}
