//! Deployment engine integration tests
//!
//! Drive real deployments through the repository: fragments run under
//! `sh -c`, rendered files land in a temp directory, terminal transitions
//! hit the journal.

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

fn repo_with_journal(config_dir: &Path, journal_dir: &Path) -> Arc<Repository> {
    let journal = FileJournal::new(JournalConfig {
        filepath: journal_dir.to_path_buf(),
        sync_on_write: true,
        ..Default::default()
    })
    .unwrap();
    Repository::init(config_dir, Some(Arc::new(journal)), None, None, None)
}

async fn wait_terminal(repo: &Arc<Repository>, id: &str) -> Deployment {
    for _ in 0..200 {
        if let Some(shared) = repo.find_deployment(id) {
            let snapshot = shared.read().await.clone();
            if snapshot.is_terminal() {
                return snapshot;
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("deployment {} did not reach a terminal state", id);
}

fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_happy_path_deploy_writes_rendered_file() {
    let config = tempfile::tempdir().unwrap();
    let journal_dir = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let dest = out.path().join("out.txt");

    write_fixture(
        config.path(),
        r#"[{
            "id": "p1", "name": "P1",
            "templates": [{"src": "greeting", "dest": "{{dest}}"}]
        }]"#,
        &[("greeting", "hello {{name}}")],
    );

    let repo = repo_with_journal(config.path(), journal_dir.path());
    let pkg = repo.find_package("p1").unwrap();
    let submitted = repo.submit_deployment(
        pkg,
        vars(&[("name", "world"), ("dest", dest.to_str().unwrap())]),
        false,
    );
    assert_eq!(submitted.status, DeploymentStatus::NotStarted);

    let done = wait_terminal(&repo, &submitted.id).await;
    assert_eq!(done.status, DeploymentStatus::Complete);
    assert_eq!(done.status_message, "Package Deployed");
    assert_eq!(std::fs::read_to_string(&dest).unwrap(), "hello world");
    // Engine-injected variables are visible in the terminal snapshot
    assert_eq!(done.variables.get("__packageId").unwrap(), "p1");

    // The journal saw the submission and the completion
    tokio::time::sleep(Duration::from_millis(200)).await;
    let journal = FileJournal::new(JournalConfig {
        filepath: journal_dir.path().to_path_buf(),
        ..Default::default()
    })
    .unwrap();
    let entries: Vec<Deployment> = journal.read_entries();
    assert!(entries.len() >= 2);
    let last = entries.last().unwrap();
    assert_eq!(last.id, submitted.id);
    assert_eq!(last.status, DeploymentStatus::Complete);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_strict_fragment_failure_leaves_file_unwritten() {
    let config = tempfile::tempdir().unwrap();
    let journal_dir = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let dest = out.path().join("never.txt");

    write_fixture(
        config.path(),
        r#"[{
            "id": "p2", "name": "P2", "strict": true,
            "template_before": ["/bin/false"],
            "templates": [{"src": "body", "dest": "{{dest}}"}]
        }]"#,
        &[("body", "should not exist")],
    );

    let repo = repo_with_journal(config.path(), journal_dir.path());
    let pkg = repo.find_package("p2").unwrap();
    let submitted = repo.submit_deployment(pkg, vars(&[("dest", dest.to_str().unwrap())]), false);

    let done = wait_terminal(&repo, &submitted.id).await;
    assert_eq!(done.status, DeploymentStatus::Failed);
    assert!(done.status_message.starts_with("Deployment"));
    assert!(!dest.exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_nonstrict_command_failure_is_ignored() {
    let config = tempfile::tempdir().unwrap();
    let journal_dir = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let dest = out.path().join("out.txt");

    write_fixture(
        config.path(),
        r#"[{
            "id": "p3", "name": "P3", "strict": false,
            "template_before": ["/bin/false"],
            "templates": [{"src": "body", "dest": "{{dest}}"}]
        }]"#,
        &[("body", "written anyway")],
    );

    let repo = repo_with_journal(config.path(), journal_dir.path());
    let pkg = repo.find_package("p3").unwrap();
    let submitted = repo.submit_deployment(pkg, vars(&[("dest", dest.to_str().unwrap())]), false);

    let done = wait_terminal(&repo, &submitted.id).await;
    assert_eq!(done.status, DeploymentStatus::Complete);
    assert_eq!(std::fs::read_to_string(&dest).unwrap(), "written anyway");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_check_skips_command() {
    let config = tempfile::tempdir().unwrap();
    let journal_dir = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let dest = out.path().join("out.txt");
    let marker = out.path().join("marker");

    write_fixture(
        config.path(),
        r#"[{
            "id": "p4", "name": "P4", "strict": true,
            "template_before": [{"cmd": "touch {{marker}}", "check": "/bin/false"}],
            "templates": [{"src": "body", "dest": "{{dest}}"}]
        }]"#,
        &[("body", "ok")],
    );

    let repo = repo_with_journal(config.path(), journal_dir.path());
    let pkg = repo.find_package("p4").unwrap();
    let submitted = repo.submit_deployment(
        pkg,
        vars(&[
            ("dest", dest.to_str().unwrap()),
            ("marker", marker.to_str().unwrap()),
        ]),
        false,
    );

    let done = wait_terminal(&repo, &submitted.id).await;
    // Skipped command counts as success
    assert_eq!(done.status, DeploymentStatus::Complete);
    assert!(!marker.exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_passed_check_makes_command_strict() {
    let config = tempfile::tempdir().unwrap();
    let journal_dir = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let dest = out.path().join("out.txt");

    // Package is not strict, but a command guarded by a passing check is
    write_fixture(
        config.path(),
        r#"[{
            "id": "p5", "name": "P5", "strict": false,
            "template_before": [{"cmd": "/bin/false", "check": "/bin/true"}],
            "templates": [{"src": "body", "dest": "{{dest}}"}]
        }]"#,
        &[("body", "never")],
    );

    let repo = repo_with_journal(config.path(), journal_dir.path());
    let pkg = repo.find_package("p5").unwrap();
    let submitted = repo.submit_deployment(pkg, vars(&[("dest", dest.to_str().unwrap())]), false);

    let done = wait_terminal(&repo, &submitted.id).await;
    assert_eq!(done.status, DeploymentStatus::Failed);
    assert!(!dest.exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_variable_fails_deployment() {
    let config = tempfile::tempdir().unwrap();
    let journal_dir = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let dest = out.path().join("out.txt");

    write_fixture(
        config.path(),
        r#"[{
            "id": "p6", "name": "P6",
            "templates": [{"src": "body", "dest": "{{dest}}"}]
        }]"#,
        &[("body", "hello {{name}}")],
    );

    let repo = repo_with_journal(config.path(), journal_dir.path());
    let pkg = repo.find_package("p6").unwrap();
    // "name" is never supplied
    let submitted = repo.submit_deployment(pkg, vars(&[("dest", dest.to_str().unwrap())]), false);

    let done = wait_terminal(&repo, &submitted.id).await;
    assert_eq!(done.status, DeploymentStatus::Failed);
    assert!(done.status_message.starts_with("Deployment"));
    assert!(!dest.exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_single_template_deployment() {
    let config = tempfile::tempdir().unwrap();
    let journal_dir = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    let first = out.path().join("first.txt");
    let second = out.path().join("second.txt");

    write_fixture(
        config.path(),
        r#"[{
            "id": "p7", "name": "P7",
            "templates": [
                {"src": "first", "dest": "{{first}}"},
                {"src": "second", "dest": "{{second}}"}
            ]
        }]"#,
        &[("first", "one"), ("second", "two")],
    );

    let repo = repo_with_journal(config.path(), journal_dir.path());
    let pkg = repo.find_package("p7").unwrap();
    let submitted = repo.submit_template_deployment(
        pkg,
        "second",
        vars(&[
            ("first", first.to_str().unwrap()),
            ("second", second.to_str().unwrap()),
        ]),
        false,
    );

    let done = wait_terminal(&repo, &submitted.id).await;
    assert_eq!(done.status, DeploymentStatus::Complete);
    assert_eq!(done.status_message, "Package Template Deployed");
    assert!(!first.exists());
    assert_eq!(std::fs::read_to_string(&second).unwrap(), "two");
}
