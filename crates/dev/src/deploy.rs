//! `deploy`: runs the component's default deploy command once against the platform

use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use odo_core::{
    labels::{Mode, Selector},
    trace_call_result, Cancellation, SessionEnv,
};
use odo_devfile::{Devfile, GroupKind};
use odo_platform::{PlatformClient, ResourceRecord};

use crate::{
    events::Events,
    image::ImageBuilder,
    options::Timeouts,
    process::RemoteProcessController,
    runtime::{CommandRuntime, ExecContext},
    DevError,
};

/// Per-workspace settings file, relative to the state directory
pub const ENV_FILE: &str = "env/env.yaml";

#[derive(Clone, Default, Debug)]
pub struct DeployOptions {
    /// Deploy command to run instead of the default one
    pub command: Option<String>,
    pub variables: BTreeMap<String, String>,
    pub image_registry: Option<String>,
    pub timeouts: Timeouts,
}

/// What a deploy left on the platform
#[derive(Clone, PartialEq, Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct DeployReport {
    pub command: String,
    /// Tag pushed per devfile image name
    pub images: BTreeMap<String, String>,
    pub resources: Vec<ResourceRecord>,
}

#[derive(Deserialize, Default, Debug)]
#[serde(rename_all = "PascalCase")]
struct EnvFile {
    #[serde(default)]
    namespace: Option<String>,
}

#[tracing::instrument(level = "info", err, skip_all, fields(component = %env.component))]
pub async fn deploy(
    env: &SessionEnv,
    options: &DeployOptions,
    platform: Arc<dyn PlatformClient>,
    images: Arc<dyn ImageBuilder>,
    events: &Events,
    cancel: &Cancellation,
) -> Result<DeployReport, DevError> {
    let devfile = Devfile::load(&env.devfile_path, &options.variables)?;
    let command = devfile
        .select_command(GroupKind::Deploy, options.command.as_deref())?
        .id
        .clone();
    info!(code = "deploy_started", %command);
    events.progress(format!("Running deploy command {:?}", command));

    let processes = Arc::new(RemoteProcessController::new(
        platform.clone(),
        options.timeouts.process_grace,
        options.timeouts.platform,
    ));
    let runtime = CommandRuntime::new(
        env.clone(),
        platform.clone(),
        processes,
        images,
        events.clone(),
        options.timeouts.platform,
    )
    .with_image_registry(options.image_registry.clone());
    let ctx = ExecContext {
        pod: None,
        mode: Mode::Deploy,
        cancel,
    };
    runtime.execute_id(&devfile, &command, ctx).await?;

    let selector = Selector::component(&env.component, Some(Mode::Deploy));
    let resources = cancel
        .run_with_deadline(
            options.timeouts.platform,
            platform.list_resources_by_selector(&selector, platform.namespace()),
        )
        .await??;
    info!(code = "deploy_finished", %command, resources = resources.len());
    events.progress(format!(
        "Deployed {} resource(s) for component {:?}",
        resources.len(),
        env.component
    ));
    Ok(DeployReport {
        command,
        images: runtime.built_images(),
        resources,
    })
}

/// Namespace to deploy into: the flag, else the one named by `.odo/env/env.yaml`, else the context's
pub fn deploy_namespace(flag: Option<&str>, state_dir: &Path) -> Result<Option<String>, DevError> {
    if let Some(namespace) = flag {
        return Ok(Some(namespace.to_owned()));
    }
    let namespace = env_namespace(state_dir)?;
    if let Some(namespace) = &namespace {
        debug!(code = "env_file_namespace", %namespace);
    }
    Ok(namespace)
}

pub fn env_namespace(state_dir: &Path) -> Result<Option<String>, DevError> {
    let path = state_dir.join(ENV_FILE);
    let contents = match trace_call_result!(fs::read_to_string(&path), expect: [NotFound]) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    if contents.trim().is_empty() {
        return Ok(None);
    }
    let env: EnvFile = serde_yaml::from_str(&contents).map_err(|err| env_file_error(path, err.to_string()))?;
    Ok(env.namespace.filter(|namespace| !namespace.is_empty()))
}

fn env_file_error(path: PathBuf, message: String) -> DevError {
    DevError::EnvFile { path, message }
}

#[cfg(test)]
mod tests {
    use odo_core::{labels, PlatformKind};
    use odo_devfile::DevfileError;
    use odo_test_util::fake::{Call, FakePlatform};
    use parking_lot::Mutex;

    use super::*;
    use crate::{fixtures, image::ImageBuildRequest, CommandError};

    const DEPLOY_DEVFILE: &str = r#"
schemaVersion: 2.2.0
metadata:
  name: shop
components:
  - name: web
    container:
      image: node:18
  - name: prod-image
    image:
      imageName: shop
      autoBuild: false
      dockerfile:
        uri: Dockerfile
  - name: outer
    kubernetes:
      inlined: |
        apiVersion: apps/v1
        kind: Deployment
        metadata:
          name: shop
  - name: outer-svc
    kubernetes:
      inlined: |
        apiVersion: v1
        kind: Service
        metadata:
          name: shop
commands:
  - id: r
    exec:
      component: web
      commandLine: node app.js
      group:
        kind: run
  - id: build-image
    apply:
      component: prod-image
  - id: apply-deployment
    apply:
      component: outer
  - id: apply-service
    apply:
      component: outer-svc
  - id: deploy
    composite:
      commands: [build-image, apply-deployment, apply-service]
      group:
        kind: deploy
        isDefault: true
"#;

    #[derive(Default)]
    struct RecordingBuilder {
        tags: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl ImageBuilder for RecordingBuilder {
        async fn build(&self, request: &ImageBuildRequest) -> Result<(), CommandError> {
            self.tags.lock().push(request.tag.clone());
            Ok(())
        }
    }

    fn workspace(devfile: &str) -> tempfile::TempDir {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("devfile.yaml"), devfile).unwrap();
        fs::write(tmp.path().join("Dockerfile"), "FROM node:18\n").unwrap();
        tmp
    }

    #[tokio::test]
    async fn builds_then_applies_with_deploy_labels() {
        odo_test_util::prep();
        let tmp = workspace(DEPLOY_DEVFILE);
        let platform = FakePlatform::new(PlatformKind::Cluster);
        let builder = Arc::new(RecordingBuilder::default());
        let env = fixtures::session_env(tmp.path(), PlatformKind::Cluster);
        let options = DeployOptions {
            image_registry: Some("quay.io/me".to_owned()),
            ..DeployOptions::default()
        };

        let report = deploy(
            &env,
            &options,
            platform.clone(),
            builder.clone(),
            &Events::disabled(),
            &Cancellation::new(),
        )
        .await
        .unwrap();

        assert_eq!(report.command, "deploy");
        assert_eq!(*builder.tags.lock(), vec!["quay.io/me/shop".to_owned()]);
        assert_eq!(report.images.get("shop").map(String::as_str), Some("quay.io/me/shop"));
        let kinds: Vec<&str> = report.resources.iter().map(|resource| resource.kind.as_str()).collect();
        assert_eq!(kinds, vec!["Deployment", "Service"]);
        for resource in &report.resources {
            assert_eq!(resource.labels.get(labels::MODE).map(String::as_str), Some("deploy"));
        }
        let applied: Vec<Call> = platform
            .calls()
            .into_iter()
            .filter(|call| matches!(call, Call::Apply { .. }))
            .collect();
        assert_eq!(
            applied,
            vec![
                Call::Apply {
                    kind: "Deployment".to_owned(),
                    name: "shop".to_owned()
                },
                Call::Apply {
                    kind: "Service".to_owned(),
                    name: "shop".to_owned()
                },
            ]
        );
        assert!(platform.pods().is_empty());
    }

    #[tokio::test]
    async fn devfile_without_deploy_command() {
        odo_test_util::prep();
        let tmp = workspace(fixtures::HELLO_DEVFILE);
        let platform = FakePlatform::new(PlatformKind::Cluster);
        let env = fixtures::session_env(tmp.path(), PlatformKind::Cluster);

        let err = deploy(
            &env,
            &DeployOptions::default(),
            platform.clone(),
            Arc::new(RecordingBuilder::default()),
            &Events::disabled(),
            &Cancellation::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            DevError::Manifest(DevfileError::CommandNotFound {
                kind: GroupKind::Deploy,
                ..
            })
        ));
        assert!(platform.calls().is_empty());
    }

    #[test]
    fn namespace_sources() {
        let tmp = tempfile::tempdir().unwrap();
        let state_dir = tmp.path().join(".odo");
        assert_eq!(deploy_namespace(None, &state_dir).unwrap(), None);

        fs::create_dir_all(state_dir.join("env")).unwrap();
        fs::write(state_dir.join(ENV_FILE), "Namespace: staging\n").unwrap();
        assert_eq!(deploy_namespace(None, &state_dir).unwrap().as_deref(), Some("staging"));
        assert_eq!(deploy_namespace(Some("prod"), &state_dir).unwrap().as_deref(), Some("prod"));

        fs::write(state_dir.join(ENV_FILE), "Namespace: [unclosed\n").unwrap();
        assert!(matches!(env_namespace(&state_dir), Err(DevError::EnvFile { .. })));
    }
}
