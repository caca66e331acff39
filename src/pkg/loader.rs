//! Package definition loading
//!
//! Definitions come from `<configDir>/packages.json` plus any
//! `<configDir>/conf.d/*.json`. Every templated string a package references
//! is compiled into its table here; a package that fails to compile is
//! skipped without disturbing the rest of the load.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::unistd::{getegid, geteuid, Group, User};
use serde::Deserialize;
use tracing::{debug, info, trace, warn};

use super::fragment::{ExecutionFragment, FragmentDef};
use super::table::TemplateTable;
use super::template::{flatten, Template, TemplateDef};
use super::Package;
use crate::errors::AgentError;
use crate::kv::KvStore;
use crate::metrics::Metrics;

/// Wire shape of a package definition file: a list of package definitions.
#[derive(Debug, Deserialize)]
pub struct PackageDef {
    pub id: String,
    #[serde(default)]
    pub tag: String,
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub strict: bool,
    #[serde(default)]
    pub templates: Vec<TemplateDef>,
    #[serde(default, rename = "template_before")]
    pub templates_before: Vec<FragmentDef>,
    #[serde(default, rename = "template_after")]
    pub templates_after: Vec<FragmentDef>,
}

/// Load every package the configuration directory defines.
pub fn load_packages(config_dir: &Path, kv: Option<Arc<dyn KvStore>>) -> Vec<Arc<Package>> {
    let mut packages = Vec::new();
    let mut seen_ids = HashSet::new();

    let primary = config_dir.join("packages.json");
    trace!("Loading packages from {}", primary.display());
    if !load_packages_from_file(&primary, config_dir, kv.clone(), &mut seen_ids, &mut packages) {
        warn!("Could not load packages from packages.json");
    }

    let conf_d = config_dir.join("conf.d");
    if conf_d.is_dir() {
        trace!("Loading packages from {}", conf_d.display());
        let mut files: Vec<PathBuf> = std::fs::read_dir(&conf_d)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
                    .collect()
            })
            .unwrap_or_default();
        files.sort();
        for file in files {
            if !load_packages_from_file(&file, config_dir, kv.clone(), &mut seen_ids, &mut packages)
            {
                info!("Could not load packages from file: {}", file.display());
            }
        }
    }

    if packages.is_empty() {
        warn!("No package definitions were found");
    } else {
        info!("{} packages have been loaded", packages.len());
    }
    packages
}

fn load_packages_from_file(
    file: &Path,
    config_dir: &Path,
    kv: Option<Arc<dyn KvStore>>,
    seen_ids: &mut HashSet<String>,
    packages: &mut Vec<Arc<Package>>,
) -> bool {
    let data = match std::fs::read_to_string(file) {
        Ok(data) => data,
        Err(e) => {
            warn!("Failed to read file {}: {}", file.display(), e);
            return false;
        }
    };

    let defs: Vec<PackageDef> = match serde_json::from_str(&data) {
        Ok(defs) => defs,
        Err(e) => {
            warn!("Failed to parse json file {}: {}", file.display(), e);
            return false;
        }
    };

    trace!("Parsed {} packages from file {}", defs.len(), file.display());
    for def in defs {
        if !seen_ids.insert(def.id.clone()) {
            warn!(
                "Duplicate package id {} in {}, rejecting the later definition",
                def.id,
                file.display()
            );
            continue;
        }
        let id = def.id.clone();
        match build_package(def, config_dir, kv.clone()) {
            Ok(package) => packages.push(Arc::new(package)),
            Err(e) => {
                seen_ids.remove(&id);
                warn!("Skipping package {} from {}: {}", id, file.display(), e);
            }
        }
    }
    true
}

fn build_package(
    def: PackageDef,
    config_dir: &Path,
    kv: Option<Arc<dyn KvStore>>,
) -> Result<Package, AgentError> {
    let mut table = TemplateTable::new(kv);

    let templates_before = build_fragments(def.templates_before, &mut table)?;
    let templates_after = build_fragments(def.templates_after, &mut table)?;

    let mut templates = Vec::with_capacity(def.templates.len());
    for template_def in def.templates {
        templates.push(build_template(template_def, config_dir, &mut table)?);
    }

    Ok(Package {
        id: def.id,
        tag: def.tag,
        name: def.name,
        version: def.version,
        strict: def.strict,
        templates,
        templates_before,
        templates_after,
        table,
        metrics: Metrics::new(),
    })
}

fn build_template(
    def: TemplateDef,
    config_dir: &Path,
    table: &mut TemplateTable,
) -> Result<Template, AgentError> {
    trace!("Processing template: {}", def.src);

    table.add(&format!("{}_dest", def.src), &def.dest)?;

    let watch = flatten(def.watch);
    for expr in &watch {
        table.add(expr, expr)?;
    }

    // Template files can be absolute or live under <configDir>/tpl/
    let tpl_name = format!("{}.tpl", def.src);
    let tpl_path = if Path::new(&def.src).is_absolute() {
        PathBuf::from(&tpl_name)
    } else {
        config_dir.join("tpl").join(&tpl_name)
    };
    table.add_file(&tpl_name, &tpl_path)?;

    let before = build_fragments(flatten(def.before), table)?;
    let after = build_fragments(flatten(def.after), table)?;

    Ok(Template {
        file_mode: parse_mode(&def.mode),
        uid: resolve_uid(&def.owner),
        gid: resolve_gid(&def.group),
        src: def.src,
        dest: def.dest,
        description: def.description,
        owner: def.owner,
        group: def.group,
        mode: def.mode,
        watch,
        before,
        after,
        metrics: Metrics::new(),
    })
}

fn build_fragments(
    defs: Vec<FragmentDef>,
    table: &mut TemplateTable,
) -> Result<Vec<ExecutionFragment>, AgentError> {
    let count = defs.len();
    let mut fragments = Vec::with_capacity(count);
    for (idx, def) in defs.into_iter().enumerate() {
        let fragment = ExecutionFragment::from_def(def, idx + 1, count);
        table.add(&fragment.cmd, &fragment.cmd)?;
        if let Some(status) = &fragment.status_cmd {
            table.add(status, status)?;
        }
        if let Some(check) = &fragment.check {
            table.add(check, check)?;
        }
        if let Some(validate) = &fragment.validate {
            table.add(validate, validate)?;
        }
        fragments.push(fragment);
    }
    Ok(fragments)
}

fn parse_mode(mode: &str) -> u32 {
    if mode.is_empty() {
        return 0o644;
    }
    u32::from_str_radix(mode.trim_start_matches("0o"), 8).unwrap_or_else(|_| {
        warn!("Could not parse file mode {:?}, using 0644", mode);
        0o644
    })
}

fn resolve_uid(owner: &str) -> u32 {
    if owner.is_empty() {
        return geteuid().as_raw();
    }
    match User::from_name(owner) {
        Ok(Some(user)) => user.uid.as_raw(),
        _ => {
            debug!("Could not resolve owner {:?}, using effective uid", owner);
            geteuid().as_raw()
        }
    }
}

fn resolve_gid(group: &str) -> u32 {
    if group.is_empty() {
        return getegid().as_raw();
    }
    match Group::from_name(group) {
        Ok(Some(group)) => group.gid.as_raw(),
        _ => {
            debug!("Could not resolve group {:?}, using effective gid", group);
            getegid().as_raw()
        }
    }
}
