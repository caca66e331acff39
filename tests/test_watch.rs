//! Live watch rewrite tests
//!
//! A deployment submitted with watch=true installs key watches through the
//! coordination backend; updating the watched key re-renders the template,
//! rewrites the destination and re-runs the after fragments.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use deployd::cluster::{Cluster, Machine};
use deployd::coordination::CoordinationBackend;
use deployd::deployment::{DeploymentStatus, Repository};
use deployd::kv::{KvStore, MemoryKv, SetOptions};

fn cluster_config(root: &str) -> serde_json::Value {
    serde_json::json!({
        "backend-config": {
            "endpoints": ["in-memory"],
            "recovery-participant": false,
            "machine-prefix": format!("{}/machines", root),
            "deployment-prefix": format!("{}/deployments", root),
            "failover-timeout": "30s",
            "ttl": 30
        }
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_watched_key_change_rewrites_destination() {
    let kv = MemoryKv::new();
    kv.set("/cfg/key1", "v1", SetOptions::default())
        .await
        .unwrap();

    let config_dir = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let dest = out.path().join("rendered.conf");
    let marker = out.path().join("after-ran");

    std::fs::create_dir_all(config_dir.path().join("tpl")).unwrap();
    std::fs::write(
        config_dir.path().join("packages.json"),
        r#"[{
            "id": "watched", "name": "Watched",
            "templates": [{
                "src": "live",
                "dest": "{{dest}}",
                "watch": "/cfg/key1",
                "after": "touch {{marker}}"
            }]
        }]"#,
    )
    .unwrap();
    std::fs::write(
        config_dir.path().join("tpl").join("live.tpl"),
        "value={{gets \"/cfg/key1\"}}",
    )
    .unwrap();

    let (shutdown_tx, _) = broadcast::channel(4);
    let cluster = Arc::new(Cluster::new(Some(cluster_config("/watchtest"))));
    let machine = Machine {
        id: "watcher-node".to_string(),
        endpoint: "127.0.0.1:8480".to_string(),
        tags: vec![],
    };
    let (backend, _status_rx, _handles) = CoordinationBackend::init(
        kv.clone() as Arc<dyn KvStore>,
        cluster,
        machine,
        shutdown_tx.clone(),
    )
    .await
    .unwrap();

    let repo = Repository::init(
        config_dir.path(),
        None,
        Some(backend),
        Some(kv.clone() as Arc<dyn KvStore>),
        None,
    );

    let mut variables = HashMap::new();
    variables.insert("dest".to_string(), dest.to_str().unwrap().to_string());
    variables.insert("marker".to_string(), marker.to_str().unwrap().to_string());

    let pkg = repo.find_package("watched").unwrap();
    let submitted = repo.submit_deployment(pkg, variables, true);

    wait_complete(&repo, &submitted.id).await;
    assert_eq!(std::fs::read_to_string(&dest).unwrap(), "value=v1");
    assert!(marker.exists());

    // The watch handler re-renders and re-runs the after fragments
    std::fs::remove_file(&marker).unwrap();
    kv.set("/cfg/key1", "v2", SetOptions::default())
        .await
        .unwrap();

    wait_for(&dest, "value=v2").await;
    assert!(marker.exists());
}

async fn wait_complete(repo: &Arc<Repository>, id: &str) {
    for _ in 0..200 {
        if let Some(shared) = repo.find_deployment(id) {
            if shared.read().await.status == DeploymentStatus::Complete {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("deployment {} never completed", id);
}

async fn wait_for(path: &Path, contents: &str) {
    for _ in 0..200 {
        if let Ok(found) = std::fs::read_to_string(path) {
            if found == contents {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!(
        "{} never reached expected contents {:?}",
        path.display(),
        contents
    );
}
