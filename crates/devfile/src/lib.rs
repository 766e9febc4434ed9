//! Workspace manifest (devfile) model
//!
//! Only the subset of the devfile 2.x schema the dev loop consumes is modelled. Unknown keys are ignored so newer
//! schema versions still load.

mod command;
mod component;
mod error;
mod substitute;
mod validate;

pub use crate::{
    command::{ApplyCommand, Command, CommandGroup, CommandKind, CompositeCommand, ExecCommand, GroupKind},
    component::{
        Component, ComponentKind, Container, Dockerfile, Endpoint, EnvVar, Exposure, Image, KubernetesResource,
        Volume, VolumeMount,
    },
    error::DevfileError,
    substitute::substitute_variables,
};

use std::{collections::BTreeMap, fs, path::Path};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const DEFAULT_PROJECTS_ROOT: &str = "/projects";

#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Devfile {
    pub schema_version: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default)]
    pub components: Vec<Component>,
    #[serde(default)]
    pub commands: Vec<Command>,
    #[serde(default)]
    pub events: Events,
}

#[derive(Clone, Default, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

#[derive(Clone, Default, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Events {
    #[serde(default)]
    pub pre_start: Vec<String>,
    #[serde(default)]
    pub post_start: Vec<String>,
    #[serde(default)]
    pub pre_stop: Vec<String>,
    #[serde(default)]
    pub post_stop: Vec<String>,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum EventKind {
    PreStart,
    PostStart,
    PreStop,
    PostStop,
}

impl Devfile {
    /// Parses a manifest, substituting `${VAR}` references from the manifest's `variables` block overridden by
    /// `overrides`, then validates it
    pub fn parse(source: &str, overrides: &BTreeMap<String, String>) -> Result<Devfile, DevfileError> {
        let mut document: serde_yaml::Value = serde_yaml::from_str(source).map_err(DevfileError::Parse)?;

        let mut variables = BTreeMap::new();
        if let Some(declared) = document.get("variables").and_then(|v| v.as_mapping()) {
            for (k, v) in declared {
                if let (Some(k), Some(v)) = (k.as_str(), v.as_str()) {
                    variables.insert(k.to_owned(), v.to_owned());
                }
            }
        }
        variables.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));

        let unresolved = substitute_variables(&mut document, &variables);
        for name in &unresolved {
            warn!(code = "unresolved_variable", variable = %name, "variable {:?} is referenced but not defined", name);
        }

        let devfile: Devfile = serde_yaml::from_value(document).map_err(DevfileError::Parse)?;
        devfile.validate()?;
        debug!(
            code = "devfile_parsed",
            name = %devfile.metadata.name,
            components = devfile.components.len(),
            commands = devfile.commands.len()
        );
        Ok(devfile)
    }

    #[tracing::instrument(level = "debug", err, skip(overrides))]
    pub fn load(path: &Path, overrides: &BTreeMap<String, String>) -> Result<Devfile, DevfileError> {
        let source = fs::read_to_string(path).map_err(|err| DevfileError::Read {
            path: path.to_owned(),
            source: err,
        })?;
        Devfile::parse(&source, overrides)
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn component(&self, name: &str) -> Option<&Component> {
        self.components.iter().find(|component| component.name == name)
    }

    pub fn command(&self, id: &str) -> Option<&Command> {
        self.commands.iter().find(|command| command.id == id)
    }

    pub fn container_components(&self) -> impl Iterator<Item = (&Component, &Container)> {
        self.components.iter().filter_map(|component| match &component.kind {
            ComponentKind::Container(container) => Some((component, container)),
            _ => None,
        })
    }

    pub fn image_components(&self) -> impl Iterator<Item = (&Component, &Image)> {
        self.components.iter().filter_map(|component| match &component.kind {
            ComponentKind::Image(image) => Some((component, image)),
            _ => None,
        })
    }

    pub fn volume_components(&self) -> impl Iterator<Item = (&Component, &Volume)> {
        self.components.iter().filter_map(|component| match &component.kind {
            ComponentKind::Volume(volume) => Some((component, volume)),
            _ => None,
        })
    }

    /// Endpoints declared by a container component
    pub fn endpoints_of(&self, container: &str) -> &[Endpoint] {
        match self.component(container).map(|component| &component.kind) {
            Some(ComponentKind::Container(container)) => &container.endpoints,
            _ => &[],
        }
    }

    pub fn events(&self, kind: EventKind) -> &[String] {
        match kind {
            EventKind::PreStart => &self.events.pre_start,
            EventKind::PostStart => &self.events.post_start,
            EventKind::PreStop => &self.events.pre_stop,
            EventKind::PostStop => &self.events.post_stop,
        }
    }

    pub fn commands_of_kind(&self, kind: GroupKind) -> impl Iterator<Item = &Command> {
        self.commands
            .iter()
            .filter(move |command| command.group().map(|group| group.kind) == Some(kind))
    }

    /// Resolves the command to run for a group kind
    ///
    /// A command requested by name wins. Otherwise the unique default of that kind is used, or the only command of
    /// that kind when there is exactly one.
    pub fn select_command(&self, kind: GroupKind, requested: Option<&str>) -> Result<&Command, DevfileError> {
        if let Some(id) = requested {
            let command = self.command(id).ok_or_else(|| DevfileError::CommandNotFound {
                kind,
                name: Some(id.to_owned()),
            })?;
            return match command.group() {
                Some(group) if group.kind != kind => Err(DevfileError::CommandKindMismatch {
                    id: id.to_owned(),
                    expected: kind,
                    actual: group.kind,
                }),
                _ => Ok(command),
            };
        }

        let candidates: Vec<&Command> = self.commands_of_kind(kind).collect();
        let defaults: Vec<&Command> = candidates
            .iter()
            .copied()
            .filter(|command| command.group().map(|group| group.is_default()).unwrap_or(false))
            .collect();
        match (defaults.as_slice(), candidates.as_slice()) {
            ([default], _) => Ok(default),
            ([], [only]) => Ok(only),
            ([], []) => Err(DevfileError::CommandNotFound { kind, name: None }),
            _ => Err(DevfileError::AmbiguousDefault(kind)),
        }
    }

    /// Checks the requirements specific to running a dev session
    pub fn require_dev_commands(&self) -> Result<(), DevfileError> {
        let has_run = self
            .commands
            .iter()
            .any(|command| matches!(command.group().map(|group| group.kind), Some(GroupKind::Run | GroupKind::Debug)));
        if !has_run {
            return Err(DevfileError::Invalid(vec![
                "at least one command of kind 'run' or 'debug' is required".to_owned()
            ]));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const NODE_DEVFILE: &str = r#"
schemaVersion: 2.2.0
metadata:
  name: ${NAME}
variables:
  NAME: nodejs
  PORT: "3000"
components:
  - name: runtime
    container:
      image: registry.access.redhat.com/ubi8/nodejs-16:latest
      memoryLimit: 1024Mi
      mountSources: true
      endpoints:
        - name: http-node
          targetPort: ${PORT}
        - name: debug
          targetPort: 5858
          exposure: none
      env:
        - name: DEBUG_PORT
          value: "5858"
  - name: prod-image
    image:
      imageName: nodejs-image:latest
      dockerfile:
        uri: ./Dockerfile
        buildContext: .
  - name: k8s-deploy
    kubernetes:
      inlined: |
        apiVersion: apps/v1
        kind: Deployment
        metadata:
          name: my-node
commands:
  - id: install
    exec:
      component: runtime
      commandLine: npm install
      workingDir: ${PROJECT_SOURCE}
      group:
        kind: build
        isDefault: true
  - id: run
    exec:
      component: runtime
      commandLine: npm start
      workingDir: ${PROJECT_SOURCE}
      group:
        kind: run
        isDefault: true
  - id: debug
    exec:
      component: runtime
      commandLine: npm run debug
      workingDir: ${PROJECT_SOURCE}
      group:
        kind: debug
  - id: build-image
    apply:
      component: prod-image
  - id: deploy-k8s
    apply:
      component: k8s-deploy
  - id: deploy
    composite:
      commands:
        - build-image
        - deploy-k8s
      group:
        kind: deploy
        isDefault: true
events:
  postStart:
    - install
"#;

    pub(crate) fn node_devfile() -> Devfile {
        Devfile::parse(NODE_DEVFILE, &BTreeMap::new()).unwrap()
    }

    #[test]
    fn parse_node_devfile() {
        let devfile = node_devfile();
        assert_eq!(devfile.name(), "nodejs");
        assert_eq!(devfile.container_components().count(), 1);
        let endpoints = devfile.endpoints_of("runtime");
        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints[0].target_port, 3000);
        assert!(endpoints[1].is_debug());
        assert_eq!(devfile.events(EventKind::PostStart), &["install".to_owned()]);
    }

    #[test]
    fn undefined_variables_are_left_in_place() {
        let devfile = node_devfile();
        let run = devfile.command("run").unwrap();
        match &run.kind {
            CommandKind::Exec(exec) => assert_eq!(exec.working_dir.as_deref(), Some("${PROJECT_SOURCE}")),
            other => panic!("unexpected command kind {:?}", other),
        }
    }

    #[test]
    fn overrides_replace_declared_variables() {
        let mut overrides = BTreeMap::new();
        overrides.insert("PORT".to_owned(), "8080".to_owned());
        let devfile = Devfile::parse(NODE_DEVFILE, &overrides).unwrap();
        assert_eq!(devfile.endpoints_of("runtime")[0].target_port, 8080);
    }

    #[test]
    fn requested_command_wins() {
        let devfile = node_devfile();
        let command = devfile.select_command(GroupKind::Debug, Some("debug")).unwrap();
        assert_eq!(command.id, "debug");
    }

    #[test]
    fn requested_command_of_other_kind_rejected() {
        let devfile = node_devfile();
        match devfile.select_command(GroupKind::Run, Some("install")) {
            Err(DevfileError::CommandKindMismatch { .. }) => {}
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn default_command_selected() {
        let mut devfile = node_devfile();
        let mut second_run = devfile.command("run").unwrap().clone();
        second_run.id = "run-alt".to_owned();
        second_run.group_mut().unwrap().is_default = Some(false);
        devfile.commands.push(second_run);

        assert_eq!(devfile.select_command(GroupKind::Run, None).unwrap().id, "run");

        devfile.commands.iter_mut().for_each(|command| {
            if let Some(group) = command.group_mut() {
                if group.kind == GroupKind::Run {
                    group.is_default = None;
                }
            }
        });
        match devfile.select_command(GroupKind::Run, None) {
            Err(DevfileError::AmbiguousDefault(GroupKind::Run)) => {}
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn single_command_of_kind_is_implicit_default() {
        let devfile = node_devfile();
        assert_eq!(devfile.select_command(GroupKind::Debug, None).unwrap().id, "debug");
    }

    #[test]
    fn missing_kind_reported() {
        let devfile = node_devfile();
        match devfile.select_command(GroupKind::Test, None) {
            Err(DevfileError::CommandNotFound { kind: GroupKind::Test, name: None }) => {}
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn load_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devfile.yaml");
        match Devfile::load(&path, &BTreeMap::new()) {
            Err(DevfileError::Read { path: reported, .. }) => assert_eq!(reported, path),
            other => panic!("unexpected result {:?}", other.map(|devfile| devfile.name().to_owned())),
        }

        fs::write(&path, NODE_DEVFILE).unwrap();
        let devfile = Devfile::load(&path, &BTreeMap::new()).unwrap();
        assert_eq!(devfile.name(), node_devfile().name());
    }
}
