//! Package loader unit tests

use std::collections::HashMap;
use std::path::Path;

use deployd::pkg::load_packages;

fn write_fixture(dir: &Path, packages_json: &str, templates: &[(&str, &str)]) {
    std::fs::create_dir_all(dir.join("tpl")).unwrap();
    std::fs::write(dir.join("packages.json"), packages_json).unwrap();
    for (name, body) in templates {
        std::fs::write(dir.join("tpl").join(format!("{name}.tpl")), body).unwrap();
    }
}

#[test]
fn test_load_populates_template_table() {
    let dir = tempfile::tempdir().unwrap();
    write_fixture(
        dir.path(),
        r#"[{
            "id": "web",
            "name": "Web Server",
            "version": "1.0",
            "strict": true,
            "template_before": ["echo starting"],
            "template_after": [{"cmd": "echo done", "status": "Finishing {{__package}}"}],
            "templates": [{
                "src": "nginx.conf",
                "dest": "/tmp/{{name}}.conf",
                "description": "Main config",
                "watch": "cfg/nginx",
                "before": "echo pre",
                "after": ["echo post1", "echo post2"]
            }]
        }]"#,
        &[("nginx.conf", "server {{name}};\n")],
    );

    let packages = load_packages(dir.path(), None);
    assert_eq!(packages.len(), 1);
    let pkg = &packages[0];
    assert!(pkg.strict);
    assert_eq!(pkg.templates_before.len(), 1);
    assert_eq!(pkg.templates_after.len(), 1);

    // Every referenced expression is pre-compiled
    assert!(pkg.table.contains("nginx.conf_dest"));
    assert!(pkg.table.contains("nginx.conf.tpl"));
    assert!(pkg.table.contains("cfg/nginx"));
    assert!(pkg.table.contains("echo starting"));
    assert!(pkg.table.contains("echo done"));
    assert!(pkg.table.contains("Finishing {{__package}}"));
    assert!(pkg.table.contains("echo pre"));
    assert!(pkg.table.contains("echo post2"));

    let tpl = &pkg.templates[0];
    assert_eq!(tpl.watch, vec!["cfg/nginx".to_string()]);
    assert_eq!(tpl.before.len(), 1);
    assert_eq!(tpl.after.len(), 2);
    // Defaults: mode 0644, owner resolves to the effective uid
    assert_eq!(tpl.file_mode, 0o644);
    assert_eq!(tpl.uid, nix::unistd::geteuid().as_raw());
    assert_eq!(tpl.gid, nix::unistd::getegid().as_raw());
}

#[test]
fn test_bare_string_fragment_gets_generated_status() {
    let dir = tempfile::tempdir().unwrap();
    write_fixture(
        dir.path(),
        r#"[{
            "id": "p",
            "name": "P",
            "template_before": ["echo one", "echo two"],
            "templates": []
        }]"#,
        &[],
    );

    let packages = load_packages(dir.path(), None);
    assert_eq!(packages.len(), 1);
    let fragments = &packages[0].templates_before;
    assert_eq!(fragments[0].status, "Command: 1 of 2");
    assert_eq!(fragments[1].status, "Command: 2 of 2");
    assert!(fragments[0].check.is_none());
}

#[test]
fn test_missing_template_file_skips_only_that_package() {
    let dir = tempfile::tempdir().unwrap();
    write_fixture(
        dir.path(),
        r#"[
            {"id": "broken", "name": "Broken",
             "templates": [{"src": "missing", "dest": "/tmp/x"}]},
            {"id": "fine", "name": "Fine",
             "templates": [{"src": "ok", "dest": "/tmp/y"}]}
        ]"#,
        &[("ok", "contents\n")],
    );

    let packages = load_packages(dir.path(), None);
    assert_eq!(packages.len(), 1);
    assert_eq!(packages[0].id, "fine");
}

#[test]
fn test_duplicate_package_id_rejected() {
    let dir = tempfile::tempdir().unwrap();
    write_fixture(
        dir.path(),
        r#"[
            {"id": "dup", "name": "First", "version": "1", "templates": []},
            {"id": "dup", "name": "Second", "version": "2", "templates": []}
        ]"#,
        &[],
    );

    let packages = load_packages(dir.path(), None);
    assert_eq!(packages.len(), 1);
    assert_eq!(packages[0].name, "First");
}

#[test]
fn test_conf_d_definitions_load() {
    let dir = tempfile::tempdir().unwrap();
    write_fixture(
        dir.path(),
        r#"[{"id": "base", "name": "Base", "templates": []}]"#,
        &[],
    );
    std::fs::create_dir_all(dir.path().join("conf.d")).unwrap();
    std::fs::write(
        dir.path().join("conf.d").join("extra.json"),
        r#"[{"id": "extra", "name": "Extra", "templates": []}]"#,
    )
    .unwrap();

    let packages = load_packages(dir.path(), None);
    let ids: Vec<&str> = packages.iter().map(|p| p.id.as_str()).collect();
    assert_eq!(ids, vec!["base", "extra"]);
}

#[test]
fn test_strict_mode_render_requires_variables() {
    let dir = tempfile::tempdir().unwrap();
    write_fixture(
        dir.path(),
        r#"[{
            "id": "p", "name": "P",
            "templates": [{"src": "greeting", "dest": "/tmp/{{name}}"}]
        }]"#,
        &[("greeting", "hello {{name}}")],
    );

    let packages = load_packages(dir.path(), None);
    let pkg = &packages[0];

    let mut variables = HashMap::new();
    variables.insert("name".to_string(), "world".to_string());
    assert_eq!(
        pkg.table.render("greeting.tpl", &variables).unwrap(),
        "hello world"
    );

    let empty = HashMap::new();
    assert!(pkg.table.render("greeting.tpl", &empty).is_err());
    assert!(pkg.table.render("no-such-entry", &variables).is_err());
}
