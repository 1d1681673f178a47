//! Integration tests for common beacon workflows.
//!
//! A small cluster of nodes shares one in-memory namespace, configured the
//! way a host application would configure it.

use beacon::beacon_config::{ConfigManager, FileFormat};
use beacon::*;
use std::io::Write;
use std::time::Duration;

async fn eventually<F: Fn() -> bool>(condition: F) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

fn settings_file(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

fn cluster_config() -> ConfigManager {
    let file = settings_file(
        r#"
        [beacon]
        connection = "etcd-1:2379,etcd-2:2379"
        retry_interval = 1
        route_suffix = "remoting"
        "#,
    );

    let config = ConfigManager::new();
    let format = FileFormat::from_path(file.path()).unwrap();
    config.load_file(file.path(), format).unwrap();
    config
}

// =============================================================================
// Cluster membership
// =============================================================================

#[tokio::test]
async fn test_three_node_cluster() {
    let namespace = InMemoryNamespace::new();
    let config = cluster_config();

    let nodes: Vec<Node> = ["host1:8080", "host2:8080", "host3:8080"]
        .into_iter()
        .map(|id| Node::new(namespace.clone(), config.clone(), id.into()))
        .collect();

    for node in &nodes {
        node.started().await.unwrap();
    }

    for node in &nodes {
        eventually(|| node.urls().len() == 3).await;
    }

    let mut urls = (*nodes[0].urls()).clone();
    urls.sort();
    assert_eq!(
        urls,
        vec![
            "http://host1:8080/remoting",
            "http://host2:8080/remoting",
            "http://host3:8080/remoting",
        ]
    );

    // One node leaves gracefully
    nodes[1].stopped().await;
    eventually(|| nodes[0].urls().len() == 2).await;
    eventually(|| nodes[2].urls().len() == 2).await;
    assert!(!nodes[0].urls().contains(&"http://host2:8080/remoting".to_string()));

    nodes[0].stopped().await;
    nodes[2].stopped().await;
    assert_eq!(namespace.session_count(), 0);
    assert!(namespace.records(ROOT_PATH).is_empty());
}

#[tokio::test]
async fn test_crashed_node_disappears_after_expiry() {
    let namespace = InMemoryNamespace::new();
    let config = cluster_config();

    let survivor = Node::new(namespace.clone(), config.clone(), "host1:8080".into());
    survivor.started().await.unwrap();

    let crashed = Node::builder(namespace.clone(), config)
        .advertise("host2:8080".into())
        .build();
    crashed.started().await.unwrap();
    eventually(|| survivor.urls().len() == 2).await;

    let path = crashed
        .advertiser()
        .unwrap()
        .record_path()
        .await
        .unwrap();
    let session = namespace.owner_of(&path).unwrap();
    drop(crashed);

    // Nothing changes until the service notices
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(survivor.urls().len(), 2);

    namespace.expire_session(session);
    eventually(|| survivor.urls().len() == 1).await;
    assert_eq!(*survivor.urls(), vec!["http://host1:8080/remoting"]);

    survivor.stopped().await;
}

// =============================================================================
// Degraded modes
// =============================================================================

#[tokio::test]
async fn test_unconfigured_node_serves_static_list() {
    let namespace = InMemoryNamespace::new();
    let config = ConfigManager::from_pairs([(
        "cluster.connection_url_list",
        "http://10.0.0.1:8080,http://10.0.0.2:8080",
    )]);

    let node = Node::new(namespace.clone(), config, "host1:8080".into());
    node.started().await.unwrap();

    assert_eq!(
        *node.urls(),
        vec![
            "http://10.0.0.1:8080/remoting",
            "http://10.0.0.2:8080/remoting",
        ]
    );
    assert!(node.watcher().unwrap().is_static());
    assert!(!node.advertiser().unwrap().is_active().await);
    assert_eq!(namespace.connect_attempts(), 0);

    node.stopped().await;
}

#[tokio::test]
async fn test_unreachable_service_fails_startup() {
    let namespace = InMemoryNamespace::new();
    namespace.set_available(false);

    let node = Node::new(namespace.clone(), cluster_config(), "host1:8080".into());
    let result = node.started().await;

    assert!(matches!(result, Err(DiscoveryError::ConnectionLoss(_))));
    // Default budget: the first attempt plus three retries
    assert_eq!(namespace.connect_attempts(), 4);
}

#[tokio::test]
async fn test_watcher_failure_withdraws_registration() {
    let namespace = InMemoryNamespace::new();
    let config = cluster_config();
    config.set("beacon.update_policy", "sometimes").unwrap();

    let node = Node::new(namespace.clone(), config, "host1:8080".into());
    let result = node.started().await;

    assert!(matches!(result, Err(DiscoveryError::InvalidConfiguration(_))));
    assert!(namespace.records(ROOT_PATH).is_empty());
}
