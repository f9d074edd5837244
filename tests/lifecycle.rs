//! Instance lifecycle tests. Tests that launch a real browser are
//! ignored by default; run them with `cargo test -- --ignored` on a
//! machine with Chrome installed.

use std::time::Duration;

use serde_json::json;
use streamops::{
    ConsoleEvent, Error, InstanceConfig, InstanceManager, InstanceRole, ManagerConfig,
};

fn manager() -> InstanceManager {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let config = ManagerConfig {
        profiles_dir: std::env::temp_dir().join("streamops-it-profiles"),
        ..ManagerConfig::default()
    };
    InstanceManager::new(config)
}

fn crowd_config(room_url: &str) -> InstanceConfig {
    serde_json::from_value(json!({
        "role": "crowd",
        "displayName": "it-crowd",
        "platformTag": "test",
        "roomUrl": room_url
    }))
    .unwrap()
}

fn control_config() -> InstanceConfig {
    serde_json::from_value(json!({
        "role": "controlPanel",
        "displayName": "it-control",
        "platformTag": "test",
        "controlPanelUrl": "https://example.com",
        "liveScreenUrl": "https://example.org"
    }))
    .unwrap()
}

#[tokio::test]
async fn resize_unknown_instance_fails() {
    let manager = manager();
    assert!(matches!(
        manager.host_resized("ghost", 1600, 1000).await,
        Err(Error::InstanceNotFound(_))
    ));
}

#[tokio::test]
#[ignore = "requires Chrome"]
async fn crowd_instance_full_lifecycle() {
    let manager = manager();
    let mut events = manager.subscribe();

    manager
        .create_instance("it-crowd-1", crowd_config("https://example.com"))
        .await
        .unwrap();

    let listed = manager.list().await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].role, InstanceRole::Crowd);
    assert_eq!(listed[0].tabs, 1);
    assert_eq!(listed[0].title, "[crowd] it-crowd - test");

    manager.close_instance("it-crowd-1").await.unwrap();

    // Cleanup rides the transport closing, so wait for the event
    let event = tokio::time::timeout(Duration::from_secs(15), events.recv())
        .await
        .expect("no closure event")
        .unwrap();
    assert!(
        matches!(event, ConsoleEvent::InstanceClosed { ref instance_id } if instance_id == "it-crowd-1")
    );

    // Nothing survives the instance: no registry entry, no routes
    assert!(manager.list().await.is_empty());
    assert!(matches!(
        manager.refresh_tab("it-crowd-1", 0).await,
        Err(Error::RouteNotFound { .. })
    ));
}

#[tokio::test]
#[ignore = "requires Chrome"]
async fn control_panel_carries_two_switchable_tabs() {
    let manager = manager();

    manager
        .create_instance("it-control-1", control_config())
        .await
        .unwrap();

    let listed = manager.list().await;
    assert_eq!(listed[0].tabs, 2);
    assert_eq!(listed[0].active_tab, 0);

    manager.switch_tab("it-control-1", 1).await.unwrap();
    assert_eq!(manager.list().await[0].active_tab, 1);

    // Switching back is instant: the background view never unloaded
    manager.switch_tab("it-control-1", 0).await.unwrap();
    manager.refresh_tab("it-control-1", 1).await.unwrap();

    assert!(matches!(
        manager.switch_tab("it-control-1", 5).await,
        Err(Error::TabOutOfRange { index: 5, .. })
    ));

    manager.close_instance("it-control-1").await.unwrap();
}

#[tokio::test]
#[ignore = "requires Chrome"]
async fn duplicate_create_focuses_instead_of_duplicating() {
    let manager = manager();
    let config = crowd_config("https://example.com");

    manager
        .create_instance("it-dup", config.clone())
        .await
        .unwrap();
    manager.create_instance("it-dup", config).await.unwrap();

    assert_eq!(manager.list().await.len(), 1);
    manager.close_instance("it-dup").await.unwrap();
}

#[tokio::test]
#[ignore = "requires Chrome"]
async fn crowd_without_room_url_starts_blank() {
    let manager = manager();
    let config: InstanceConfig = serde_json::from_value(json!({
        "role": "crowd",
        "displayName": "it-blank",
        "platformTag": "test"
    }))
    .unwrap();

    manager.create_instance("it-blank", config).await.unwrap();
    assert_eq!(manager.list().await[0].tabs, 1);
    manager.close_instance("it-blank").await.unwrap();
}
