//! `delete component`: removes the resources and files odo created for a component

use std::{
    fs,
    io::{self, BufRead, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Serialize;
use tracing::{debug, info};

use odo_core::{
    files::STATE_DIRECTORY,
    labels::{self, Mode, Selector},
    Cancellation,
};
use odo_platform::{PlatformClient, ResourceRecord};
use odo_session::{get_orphan_files, GeneratedFiles, ProcessProbe};

use crate::DevError;

#[derive(Clone, Debug)]
pub struct DeleteOptions {
    pub component: String,
    /// Restricts deletion to resources created by one mode
    pub running_in: Option<Mode>,
    /// Workspace whose generated files and orphaned state are removed too
    pub files_of: Option<PathBuf>,
    pub force: bool,
    pub wait: bool,
    pub timeout: Duration,
}

/// Asks the user whether to go ahead
pub trait Prompt {
    fn confirm(&mut self, question: &str) -> io::Result<bool>;
}

pub struct StdinPrompt;

impl Prompt for StdinPrompt {
    fn confirm(&mut self, question: &str) -> io::Result<bool> {
        let mut stderr = io::stderr();
        write!(stderr, "{} [y/N] ", question)?;
        stderr.flush()?;
        let mut answer = String::new();
        io::stdin().lock().read_line(&mut answer)?;
        Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
    }
}

#[derive(Clone, PartialEq, Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct DeleteReport {
    pub resources: Vec<ResourceRecord>,
    pub files: Vec<PathBuf>,
    /// False when nothing matched or the user declined
    pub deleted: bool,
}

/// Lists what belongs to the component, writes it to `out`, confirms unless forced, then deletes it
#[tracing::instrument(level = "info", err, skip_all, fields(component = %options.component))]
pub async fn delete_component(
    platform: &dyn PlatformClient,
    options: &DeleteOptions,
    probe: &dyn ProcessProbe,
    prompt: &mut dyn Prompt,
    out: &mut dyn Write,
    cancel: &Cancellation,
) -> Result<DeleteReport, DevError> {
    let selector = Selector::component(&options.component, options.running_in);
    let resources = cancel
        .run_with_deadline(
            options.timeout,
            platform.list_resources_by_selector(&selector, platform.namespace()),
        )
        .await??;
    let files = match &options.files_of {
        Some(root) => files_to_remove(root, probe)?,
        None => Vec::new(),
    };
    debug!(code = "delete_candidates", resources = resources.len(), files = files.len());

    let mut report = DeleteReport {
        resources,
        files,
        deleted: false,
    };
    if report.resources.is_empty() && report.files.is_empty() {
        writeln!(out, "No resource found for component {:?}", options.component)?;
        return Ok(report);
    }

    if !report.resources.is_empty() {
        writeln!(
            out,
            "The following resources of component {:?} will be deleted from {}:",
            options.component,
            platform.kind()
        )?;
        out.write_all(resource_table(&report.resources).as_bytes())?;
    }
    if !report.files.is_empty() {
        writeln!(out, "The following files will be removed:")?;
        for file in &report.files {
            writeln!(out, "  {}", file.display())?;
        }
    }
    out.flush()?;

    if !options.force && !prompt.confirm(&format!("Delete component {:?}?", options.component))? {
        info!(code = "delete_declined");
        writeln!(out, "Aborting deletion of component {:?}", options.component)?;
        return Ok(report);
    }

    if !report.resources.is_empty() {
        let removed = cancel
            .run_with_deadline(options.timeout, platform.tear_down(&selector, options.wait))
            .await??;
        info!(code = "resources_deleted", count = removed.len(), wait = options.wait);
        report.resources = removed;
    }
    if let Some(root) = &options.files_of {
        report.files = remove_files(root, &report.files)?;
    }
    report.deleted = true;
    writeln!(out, "Component {:?} deleted", options.component)?;
    Ok(report)
}

fn files_to_remove(root: &Path, probe: &dyn ProcessProbe) -> Result<Vec<PathBuf>, DevError> {
    let state_dir = root.join(STATE_DIRECTORY);
    let mut files: Vec<PathBuf> = GeneratedFiles::new(root, &state_dir)
        .list()?
        .into_iter()
        .map(|relative| root.join(relative))
        .filter(|path| path.exists())
        .collect();
    files.extend(get_orphan_files(&state_dir, probe)?);
    Ok(files)
}

fn remove_files(root: &Path, listed: &[PathBuf]) -> Result<Vec<PathBuf>, DevError> {
    let state_dir = root.join(STATE_DIRECTORY);
    let mut removed = GeneratedFiles::new(root, &state_dir).remove_all()?;
    for path in listed.iter().filter(|path| path.starts_with(&state_dir)) {
        match fs::remove_file(path) {
            Ok(()) => removed.push(path.clone()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }
    removed.sort();
    debug!(code = "files_removed", count = removed.len());
    Ok(removed)
}

pub fn resource_table(resources: &[ResourceRecord]) -> String {
    let rows: Vec<[&str; 3]> = resources
        .iter()
        .map(|resource| {
            let mode = resource.labels.get(labels::MODE).map(String::as_str).unwrap_or("-");
            [resource.kind.as_str(), resource.name.as_str(), mode]
        })
        .collect();
    let header = ["KIND", "NAME", "MODE"];
    let mut widths = header.map(str::len);
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    let mut table = String::new();
    for row in std::iter::once(&header).chain(rows.iter()) {
        table.push(' ');
        for (index, (cell, width)) in row.iter().zip(widths).enumerate() {
            if index + 1 == row.len() {
                table.push_str(&format!(" {}", cell));
            } else {
                table.push_str(&format!(" {:<width$}", cell, width = width));
            }
        }
        table.push('\n');
    }
    table
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use odo_core::PlatformKind;
    use odo_platform::{KIND_CLAIM, KIND_POD};
    use odo_session::state_file_name;
    use odo_test_util::fake::{Call, FakePlatform};

    use super::*;

    struct Answer {
        yes: bool,
        asked: Vec<String>,
    }

    impl Prompt for Answer {
        fn confirm(&mut self, question: &str) -> io::Result<bool> {
            self.asked.push(question.to_owned());
            Ok(self.yes)
        }
    }

    struct DeadProbe;

    impl ProcessProbe for DeadProbe {
        fn is_alive(&self, _pid: u32) -> bool {
            false
        }
    }

    fn record(kind: &str, name: &str, component: &str, mode: Mode) -> ResourceRecord {
        ResourceRecord {
            kind: kind.to_owned(),
            api_version: "v1".to_owned(),
            resource: String::new(),
            name: name.to_owned(),
            namespace: None,
            labels: labels::ownership_labels(component, "app", mode),
            annotations: BTreeMap::new(),
            owner_refs: Vec::new(),
        }
    }

    fn platform() -> std::sync::Arc<FakePlatform> {
        let platform = FakePlatform::new(PlatformKind::Cluster);
        platform.insert_resource(record(KIND_POD, "web-app", "web", Mode::Dev));
        platform.insert_resource(record(KIND_CLAIM, "web-cache", "web", Mode::Dev));
        platform.insert_resource(record("Deployment", "web", "web", Mode::Deploy));
        platform.insert_resource(record("Deployment", "api", "api", Mode::Deploy));
        platform
    }

    fn options() -> DeleteOptions {
        DeleteOptions {
            component: "web".to_owned(),
            running_in: None,
            files_of: None,
            force: false,
            wait: false,
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn confirmed_delete_removes_only_the_component() {
        odo_test_util::prep();
        let platform = platform();
        let mut prompt = Answer {
            yes: true,
            asked: Vec::new(),
        };
        let mut out = Vec::new();

        let report = delete_component(&*platform, &options(), &DeadProbe, &mut prompt, &mut out, &Cancellation::new())
            .await
            .unwrap();

        assert!(report.deleted);
        assert_eq!(report.resources.len(), 3);
        assert_eq!(prompt.asked, vec!["Delete component \"web\"?".to_owned()]);
        let remaining: Vec<String> = platform.resources().into_iter().map(|resource| resource.name).collect();
        assert_eq!(remaining, vec!["api".to_owned()]);

        let out = String::from_utf8(out).unwrap();
        assert!(out.contains("KIND"));
        assert!(out.contains("web-cache"));
        assert!(!out.contains(" api "));
    }

    #[tokio::test]
    async fn volumes_deleted_after_workloads() {
        odo_test_util::prep();
        let platform = platform();
        let options = DeleteOptions {
            force: true,
            wait: true,
            ..options()
        };
        let mut prompt = Answer {
            yes: false,
            asked: Vec::new(),
        };
        delete_component(&*platform, &options, &DeadProbe, &mut prompt, &mut Vec::new(), &Cancellation::new())
            .await
            .unwrap();

        assert!(prompt.asked.is_empty());
        let deletes: Vec<Call> = platform
            .calls()
            .into_iter()
            .filter(|call| matches!(call, Call::Delete { .. }))
            .collect();
        assert_eq!(
            deletes,
            vec![
                Call::Delete {
                    resources: vec!["Deployment/web".to_owned(), "Pod/web-app".to_owned()],
                    wait: true
                },
                Call::Delete {
                    resources: vec!["PersistentVolumeClaim/web-cache".to_owned()],
                    wait: true
                },
            ]
        );
    }

    #[tokio::test]
    async fn declined_prompt_keeps_everything() {
        odo_test_util::prep();
        let platform = platform();
        let mut prompt = Answer {
            yes: false,
            asked: Vec::new(),
        };
        let report = delete_component(&*platform, &options(), &DeadProbe, &mut prompt, &mut Vec::new(), &Cancellation::new())
            .await
            .unwrap();
        assert!(!report.deleted);
        assert_eq!(platform.resources().len(), 4);
    }

    #[tokio::test]
    async fn running_in_selects_one_mode() {
        odo_test_util::prep();
        let platform = platform();
        let options = DeleteOptions {
            running_in: Some(Mode::Deploy),
            force: true,
            ..options()
        };
        let mut prompt = Answer {
            yes: true,
            asked: Vec::new(),
        };
        let report = delete_component(&*platform, &options, &DeadProbe, &mut prompt, &mut Vec::new(), &Cancellation::new())
            .await
            .unwrap();
        assert_eq!(report.resources.len(), 1);
        assert_eq!(report.resources[0].kind, "Deployment");
        assert_eq!(platform.resources().len(), 3);
    }

    #[tokio::test]
    async fn files_flag_removes_generated_and_orphaned_files() {
        odo_test_util::prep();
        let tmp = tempfile::tempdir().unwrap();
        let state_dir = tmp.path().join(STATE_DIRECTORY);
        fs::create_dir_all(&state_dir).unwrap();
        let generated = GeneratedFiles::new(tmp.path(), &state_dir);
        generated.ignore_state_dir(STATE_DIRECTORY).unwrap();
        let orphan = state_dir.join(state_file_name(77));
        fs::write(&orphan, r#"{"pid": 77, "platform": "cluster", "forwardedPorts": []}"#).unwrap();
        fs::write(tmp.path().join("devfile.yaml"), "schemaVersion: 2.2.0\n").unwrap();

        let platform = FakePlatform::new(PlatformKind::Cluster);
        let options = DeleteOptions {
            files_of: Some(tmp.path().to_owned()),
            force: true,
            ..options()
        };
        let mut prompt = Answer {
            yes: true,
            asked: Vec::new(),
        };
        let report = delete_component(&*platform, &options, &DeadProbe, &mut prompt, &mut Vec::new(), &Cancellation::new())
            .await
            .unwrap();

        assert!(report.deleted);
        assert_eq!(report.files, vec![tmp.path().join(".gitignore"), orphan.clone()]);
        assert!(!tmp.path().join(".gitignore").exists());
        assert!(!orphan.exists());
        assert!(tmp.path().join("devfile.yaml").exists());
    }

    #[test]
    fn table_columns_align() {
        let table = resource_table(&[
            record(KIND_POD, "web-app", "web", Mode::Dev),
            record("Deployment", "web", "web", Mode::Deploy),
        ]);
        assert_eq!(
            table,
            "  KIND       NAME    MODE\n  Pod        web-app dev\n  Deployment web     deploy\n"
        );
    }
}
