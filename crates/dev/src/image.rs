//! Image components: Dockerfile resolution and the engine-backed build driver

use std::{
    env,
    path::{Path, PathBuf},
    process::Stdio,
};

use async_trait::async_trait;
use ring::digest::{digest, SHA256};
use tokio::process::Command;
use tracing::{debug, info};

use odo_core::PlatformKind;
use odo_devfile::{CommandKind, Component, Devfile, Image};
use odo_platform::PODMAN_CMD_VAR;

use crate::CommandError;

pub const DOCKER_CMD_VAR: &str = "DOCKER_CMD";

const DOCKERFILE_CACHE_DIR: &str = "odo-dockerfiles";

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ImageBuildRequest {
    pub component: String,
    pub tag: String,
    pub dockerfile: PathBuf,
    pub context: PathBuf,
    pub args: Vec<String>,
    pub push: bool,
}

#[async_trait]
pub trait ImageBuilder: Send + Sync {
    async fn build(&self, request: &ImageBuildRequest) -> Result<(), CommandError>;
}

/// Builds with the docker or podman CLI
pub struct EngineImageBuilder {
    program: PathBuf,
}

impl EngineImageBuilder {
    /// Podman sessions always build with podman. Cluster sessions prefer `$DOCKER_CMD`, then docker, then podman.
    pub fn for_platform(kind: PlatformKind) -> EngineImageBuilder {
        let podman = || {
            env::var_os(PODMAN_CMD_VAR)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("podman"))
        };
        let program = match kind {
            PlatformKind::Podman => podman(),
            PlatformKind::Cluster => match env::var_os(DOCKER_CMD_VAR) {
                Some(program) => PathBuf::from(program),
                None => which::which("docker").unwrap_or_else(|_| podman()),
            },
        };
        EngineImageBuilder { program }
    }

    async fn run(&self, image: &str, args: &[String]) -> Result<(), CommandError> {
        debug!(code = "image_cli", program = %self.program.display(), ?args);
        let output = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| CommandError::ImageBuild {
                image: image.to_owned(),
                message: format!("failed to run {}: {}", self.program.display(), err),
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let lines: Vec<&str> = stderr.trim_end().lines().collect();
            return Err(CommandError::ImageBuild {
                image: image.to_owned(),
                message: format!(
                    "{} {} exited with {}: {}",
                    self.program.display(),
                    args.first().map(String::as_str).unwrap_or_default(),
                    output.status,
                    lines[lines.len().saturating_sub(5)..].join("\n")
                ),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ImageBuilder for EngineImageBuilder {
    #[tracing::instrument(level = "info", err, skip(self, request), fields(tag = %request.tag))]
    async fn build(&self, request: &ImageBuildRequest) -> Result<(), CommandError> {
        let mut args = vec![
            "build".to_owned(),
            "-t".to_owned(),
            request.tag.clone(),
            "-f".to_owned(),
            request.dockerfile.display().to_string(),
        ];
        for arg in &request.args {
            args.push("--build-arg".to_owned());
            args.push(arg.clone());
        }
        args.push(request.context.display().to_string());
        self.run(&request.tag, &args).await?;
        info!(code = "image_built", tag = %request.tag);

        if request.push {
            self.run(&request.tag, &["push".to_owned(), request.tag.clone()]).await?;
            info!(code = "image_pushed", tag = %request.tag);
        }
        Ok(())
    }
}

/// Prefixes a relative image name (one without a registry or namespace) with the configured registry
pub fn image_tag(image_name: &str, registry: Option<&str>) -> String {
    match registry {
        Some(registry) if !image_name.contains('/') => {
            format!("{}/{}", registry.trim_end_matches('/'), image_name)
        }
        _ => image_name.to_owned(),
    }
}

/// Build context of an image component, relative to the devfile's directory
pub fn build_context(devfile_dir: &Path, image: &Image) -> PathBuf {
    match image.dockerfile.build_context.as_deref() {
        Some(context) if !context.is_empty() => devfile_dir.join(context),
        _ => devfile_dir.to_owned(),
    }
}

/// Image components built before the pod is deployed
///
/// `autoBuild: true` always qualifies. Without an explicit setting an image is built automatically unless an apply
/// command references it.
pub fn auto_build_images(devfile: &Devfile) -> Vec<(&Component, &Image)> {
    devfile
        .image_components()
        .filter(|(component, image)| match image.auto_build {
            Some(auto_build) => auto_build,
            None => !devfile.commands.iter().any(|command| match &command.kind {
                CommandKind::Apply(apply) => apply.component == component.name,
                _ => false,
            }),
        })
        .collect()
}

/// Local copies of remote Dockerfiles, keyed by the SHA-256 of their URI
#[derive(Clone, Debug)]
pub struct DockerfileCache {
    dir: PathBuf,
}

impl DockerfileCache {
    pub fn new(dir: PathBuf) -> DockerfileCache {
        DockerfileCache { dir }
    }

    pub fn cache_path(&self, uri: &str) -> PathBuf {
        self.dir.join(hex::encode(digest(&SHA256, uri.as_bytes())))
    }

    /// Resolves a Dockerfile URI to a local path, downloading remote files once
    pub async fn resolve(&self, uri: &str, devfile_dir: &Path) -> Result<PathBuf, CommandError> {
        if !(uri.starts_with("http://") || uri.starts_with("https://")) {
            return Ok(devfile_dir.join(uri));
        }

        let path = self.cache_path(uri);
        if tokio::fs::metadata(&path).await.is_ok() {
            debug!(code = "dockerfile_cached", uri, path = %path.display());
            return Ok(path);
        }

        let fetch_error = |message: String| CommandError::ImageBuild {
            image: uri.to_owned(),
            message: format!("failed to fetch Dockerfile: {}", message),
        };
        let response = reqwest::get(uri)
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| fetch_error(err.to_string()))?;
        let body = response.bytes().await.map_err(|err| fetch_error(err.to_string()))?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|err| fetch_error(err.to_string()))?;
        tokio::fs::write(&path, &body)
            .await
            .map_err(|err| fetch_error(err.to_string()))?;
        info!(code = "dockerfile_fetched", uri, bytes = body.len());
        Ok(path)
    }
}

impl Default for DockerfileCache {
    fn default() -> Self {
        DockerfileCache::new(env::temp_dir().join(DOCKERFILE_CACHE_DIR))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;

    const IMAGES_DEVFILE: &str = r#"
schemaVersion: 2.2.0
metadata:
  name: images
components:
  - name: web
    container:
      image: node:18
  - name: implicit
    image:
      imageName: implicit
      dockerfile:
        uri: Dockerfile
  - name: explicit-off
    image:
      imageName: off
      autoBuild: false
      dockerfile:
        uri: Dockerfile
  - name: applied
    image:
      imageName: applied
      dockerfile:
        uri: Dockerfile
        buildContext: ./app
  - name: forced
    image:
      imageName: forced
      autoBuild: true
      dockerfile:
        uri: Dockerfile
commands:
  - id: r
    exec:
      component: web
      commandLine: node app.js
      group:
        kind: run
  - id: build-applied
    apply:
      component: applied
  - id: build-forced
    apply:
      component: forced
"#;

    #[test]
    fn registry_prefix_only_for_relative_names() {
        assert_eq!(image_tag("app", Some("quay.io/me/")), "quay.io/me/app");
        assert_eq!(image_tag("docker.io/me/app", Some("quay.io/me")), "docker.io/me/app");
        assert_eq!(image_tag("app", None), "app");
    }

    #[test]
    fn auto_build_selection() {
        let devfile = fixtures::devfile(IMAGES_DEVFILE);
        let names: Vec<&str> = auto_build_images(&devfile)
            .into_iter()
            .map(|(component, _)| component.name.as_str())
            .collect();
        assert_eq!(names, vec!["implicit", "forced"]);
    }

    #[test]
    fn context_defaults_to_devfile_dir() {
        let devfile = fixtures::devfile(IMAGES_DEVFILE);
        let dir = Path::new("/work/project");
        let contexts: Vec<PathBuf> = devfile
            .image_components()
            .map(|(_, image)| build_context(dir, image))
            .collect();
        assert_eq!(contexts[0], dir);
        assert_eq!(contexts[2], dir.join("./app"));
    }

    #[tokio::test]
    async fn dockerfile_resolution() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = DockerfileCache::new(tmp.path().join("cache"));

        let local = cache.resolve("docker/Dockerfile", Path::new("/work")).await.unwrap();
        assert_eq!(local, Path::new("/work/docker/Dockerfile"));

        let uri = "https://example.invalid/Dockerfile";
        std::fs::create_dir_all(tmp.path().join("cache")).unwrap();
        std::fs::write(cache.cache_path(uri), "FROM scratch\n").unwrap();
        let cached = cache.resolve(uri, Path::new("/work")).await.unwrap();
        assert_eq!(std::fs::read_to_string(cached).unwrap(), "FROM scratch\n");
    }

    #[test]
    fn podman_sessions_build_with_podman_cmd() {
        env::set_var(PODMAN_CMD_VAR, "/opt/podman/bin/podman-remote");
        let builder = EngineImageBuilder::for_platform(PlatformKind::Podman);
        env::remove_var(PODMAN_CMD_VAR);
        assert_eq!(builder.program, Path::new("/opt/podman/bin/podman-remote"));
    }
}
