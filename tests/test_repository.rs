//! Journal replay and redeploy tests

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use deployd::deployment::{Deployment, DeploymentStatus, Repository};
use deployd::journal::{FileJournal, JournalConfig};

fn write_fixture(dir: &Path, packages_json: &str, templates: &[(&str, &str)]) {
    std::fs::create_dir_all(dir.join("tpl")).unwrap();
    std::fs::write(dir.join("packages.json"), packages_json).unwrap();
    for (name, body) in templates {
        std::fs::write(dir.join("tpl").join(format!("{name}.tpl")), body).unwrap();
    }
}

fn journal_at(dir: &Path) -> Arc<FileJournal> {
    Arc::new(
        FileJournal::new(JournalConfig {
            filepath: dir.to_path_buf(),
            sync_on_write: true,
            ..Default::default()
        })
        .unwrap(),
    )
}

fn record(id: &str, package_id: &str, status: DeploymentStatus, dest: &Path) -> Deployment {
    let mut variables = HashMap::new();
    variables.insert("dest".to_string(), dest.to_str().unwrap().to_string());
    let mut deployment = Deployment::new(package_id.to_string(), variables, false, None);
    deployment.id = id.to_string();
    deployment.status = status;
    deployment.status_message = status.to_string();
    deployment
}

async fn wait_status(repo: &Arc<Repository>, id: &str, want: DeploymentStatus) {
    for _ in 0..200 {
        if let Some(shared) = repo.find_deployment(id) {
            if shared.read().await.status == want {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("deployment {} never reached {}", id, want);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_replay_restarts_incomplete_deployments() {
    let config = tempfile::tempdir().unwrap();
    let journal_dir = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let dest = out.path().join("out.txt");

    write_fixture(
        config.path(),
        r#"[{
            "id": "p1", "name": "P1",
            "templates": [{"src": "body", "dest": "{{dest}}"}]
        }]"#,
        &[("body", "replayed")],
    );

    // Simulate a previous process: two completed, one caught mid-flight
    let journal = journal_at(journal_dir.path());
    journal
        .write_entry(&record("d-1", "p1", DeploymentStatus::Complete, &dest))
        .unwrap();
    journal
        .write_entry(&record("d-2", "p1", DeploymentStatus::Complete, &dest))
        .unwrap();
    journal
        .write_entry(&record("d-3", "p1", DeploymentStatus::Working, &dest))
        .unwrap();

    let repo = Repository::init(config.path(), Some(journal), None, None, None);
    repo.load_journaled_deployments().await;

    // All three are present; the incomplete one re-runs with its own id
    let snapshot = repo.deployments_snapshot().await;
    assert_eq!(snapshot.len(), 3);
    assert_eq!(snapshot["d-1"].status, DeploymentStatus::Complete);
    assert_eq!(snapshot["d-2"].status, DeploymentStatus::Complete);

    wait_status(&repo, "d-3", DeploymentStatus::Complete).await;
    assert_eq!(std::fs::read_to_string(&dest).unwrap(), "replayed");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_replay_later_record_wins_for_same_id() {
    let config = tempfile::tempdir().unwrap();
    let journal_dir = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let dest = out.path().join("out.txt");

    write_fixture(
        config.path(),
        r#"[{
            "id": "p1", "name": "P1",
            "templates": [{"src": "body", "dest": "{{dest}}"}]
        }]"#,
        &[("body", "x")],
    );

    let journal = journal_at(journal_dir.path());
    journal
        .write_entry(&record("d-1", "p1", DeploymentStatus::Working, &dest))
        .unwrap();
    journal
        .write_entry(&record("d-1", "p1", DeploymentStatus::Complete, &dest))
        .unwrap();

    let repo = Repository::init(config.path(), Some(journal), None, None, None);
    repo.load_journaled_deployments().await;

    // Log order is the source of truth: no redeploy happens
    let snapshot = repo.deployments_snapshot().await;
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot["d-1"].status, DeploymentStatus::Complete);
    assert!(!dest.exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_replay_failed_deployments_retry_on_start() {
    let config = tempfile::tempdir().unwrap();
    let journal_dir = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let dest = out.path().join("out.txt");

    write_fixture(
        config.path(),
        r#"[{
            "id": "p1", "name": "P1",
            "templates": [{"src": "body", "dest": "{{dest}}"}]
        }]"#,
        &[("body", "recovered")],
    );

    let journal = journal_at(journal_dir.path());
    journal
        .write_entry(&record("d-f", "p1", DeploymentStatus::Failed, &dest))
        .unwrap();

    let repo = Repository::init(config.path(), Some(journal), None, None, None);
    repo.load_journaled_deployments().await;

    // The journal doubles as a recovery queue
    wait_status(&repo, "d-f", DeploymentStatus::Complete).await;
    assert_eq!(std::fs::read_to_string(&dest).unwrap(), "recovered");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_replay_skips_unknown_packages() {
    let config = tempfile::tempdir().unwrap();
    let journal_dir = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let dest = out.path().join("out.txt");

    write_fixture(config.path(), r#"[]"#, &[]);

    let journal = journal_at(journal_dir.path());
    journal
        .write_entry(&record("d-x", "gone", DeploymentStatus::Working, &dest))
        .unwrap();

    let repo = Repository::init(config.path(), Some(journal), None, None, None);
    repo.load_journaled_deployments().await;

    // The record is visible but nothing re-runs
    tokio::time::sleep(Duration::from_millis(200)).await;
    let snapshot = repo.deployments_snapshot().await;
    assert_eq!(snapshot["d-x"].status, DeploymentStatus::Working);
    assert!(!dest.exists());
}
