//! Single-node registry semantics.
//!
//! These tests exercise the mutation API, the read path, and the local
//! liveness cleanup on one node, without any peers involved.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use namecast::{json, Meta, Name, Priority, Registry, RegistryConfig};
use tokio::time::sleep;

/// How long to wait for mailbox-driven cleanup (DOWN pumps etc.).
const SETTLE: Duration = Duration::from_millis(100);

async fn start_node(node: &str) -> Registry {
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 0);
    Registry::start(RegistryConfig::new(node).bind_addr(addr))
        .await
        .unwrap()
}

#[tokio::test]
async fn register_then_whereis() {
    let registry = start_node("a").await;
    let handle = registry.spawn_principal();

    assert!(registry
        .register_name("x", handle.principal())
        .await
        .unwrap());

    // whereis immediately after a successful local register sees the
    // binding.
    assert_eq!(
        registry.whereis_name("x"),
        Some(handle.principal().clone())
    );
    assert_eq!(registry.registered_names(), vec![Name::from("x")]);
    assert_eq!(registry.local_registered_names(), vec![Name::from("x")]);

    registry.stop().await;
}

#[tokio::test]
async fn whereis_missing_name_is_absent() {
    let registry = start_node("a").await;
    assert_eq!(registry.whereis_name("ghost"), None);
    registry.stop().await;
}

#[tokio::test]
async fn duplicate_register_is_rejected() {
    let registry = start_node("a").await;
    let first = registry.spawn_principal();
    let second = registry.spawn_principal();

    assert!(registry
        .register_name("x", first.principal())
        .await
        .unwrap());
    assert!(!registry
        .register_name("x", second.principal())
        .await
        .unwrap());

    // State unchanged by the rejected call.
    assert_eq!(registry.whereis_name("x"), Some(first.principal().clone()));

    registry.stop().await;
}

#[tokio::test]
async fn one_principal_may_hold_many_names() {
    let registry = start_node("a").await;
    let handle = registry.spawn_principal();

    assert!(registry
        .register_name("x", handle.principal())
        .await
        .unwrap());
    assert!(registry
        .register_name("y", handle.principal())
        .await
        .unwrap());

    let mut names = registry.registered_names();
    names.sort();
    assert_eq!(names, vec![Name::from("x"), Name::from("y")]);

    // Termination cleans up every name the principal held.
    handle.exit();
    sleep(SETTLE).await;
    assert!(registry.registered_names().is_empty());

    registry.stop().await;
}

#[tokio::test]
async fn unregister_restores_pre_state() {
    let registry = start_node("a").await;
    let handle = registry.spawn_principal();

    assert!(registry
        .register_name("x", handle.principal())
        .await
        .unwrap());
    registry.unregister_name("x").await.unwrap();

    assert_eq!(registry.whereis_name("x"), None);
    assert!(registry.registered_names().is_empty());
    // The principal itself is untouched by unregister.
    assert!(handle.is_alive());

    // A name can be reused after unregistration.
    assert!(registry
        .register_name("x", handle.principal())
        .await
        .unwrap());

    registry.stop().await;
}

#[tokio::test]
async fn unregister_missing_name_is_ok() {
    let registry = start_node("a").await;
    registry.unregister_name("ghost").await.unwrap();
    registry.unregister_name("ghost").await.unwrap();
    registry.stop().await;
}

#[tokio::test]
async fn set_meta_is_idempotent() {
    let registry = start_node("a").await;
    let handle = registry.spawn_principal();
    assert!(registry
        .register_name("x", handle.principal())
        .await
        .unwrap());

    let mut meta = Meta::new();
    meta.insert("k".to_string(), json!(1));

    registry.set_meta("x", meta.clone()).await.unwrap();
    registry.set_meta("x", meta.clone()).await.unwrap();

    assert_eq!(registry.meta_of("x"), Some(meta.clone()));
    let info = registry.local_registered_info();
    assert_eq!(info.len(), 1);
    assert_eq!(info[0].2, meta);

    registry.stop().await;
}

#[tokio::test]
async fn set_meta_on_missing_name_is_ok() {
    let registry = start_node("a").await;
    let mut meta = Meta::new();
    meta.insert("k".to_string(), json!(1));

    registry.set_meta("ghost", meta).await.unwrap();
    assert_eq!(registry.meta_of("ghost"), None);

    registry.stop().await;
}

#[tokio::test]
async fn send_delivers_to_local_principal() {
    let registry = start_node("a").await;
    let mut handle = registry.spawn_principal();
    assert!(registry
        .register_name("worker", handle.principal())
        .await
        .unwrap());

    registry.send("worker", json!({"job": 42}));
    assert_eq!(handle.recv().await, Some(json!({"job": 42})));

    registry.stop().await;
}

#[tokio::test]
async fn send_to_missing_name_is_silently_dropped() {
    let registry = start_node("a").await;
    registry.send("ghost", json!(1));
    registry.stop().await;
}

#[tokio::test]
async fn principal_exit_unregisters_its_names() {
    let registry = start_node("a").await;
    let handle = registry.spawn_principal();
    assert!(registry
        .register_name("x", handle.principal())
        .await
        .unwrap());

    handle.exit();
    sleep(SETTLE).await;

    assert_eq!(registry.whereis_name("x"), None);
    assert!(registry.local_registered_names().is_empty());

    registry.stop().await;
}

#[tokio::test]
async fn register_on_dead_principal_is_cleaned_up() {
    let registry = start_node("a").await;
    let handle = registry.spawn_principal();
    let principal = handle.principal().clone();
    handle.exit();

    // The registration succeeds, then the immediate DOWN of the dead
    // principal retires it.
    assert!(registry.register_name("x", &principal).await.unwrap());
    sleep(SETTLE).await;
    assert_eq!(registry.whereis_name("x"), None);

    registry.stop().await;
}

#[tokio::test]
async fn priority_knob_round_trips() {
    let registry = start_node("a").await;

    assert_eq!(registry.priority(), Priority::Normal);
    assert_eq!(registry.set_priority(Priority::Low), Priority::Normal);
    assert_eq!(registry.set_priority(Priority::High), Priority::Low);
    assert_eq!(registry.priority(), Priority::High);

    registry.stop().await;
}
