//! Devfiles and session values shared by the unit tests

use std::{collections::BTreeMap, path::Path};

use odo_core::{PlatformKind, SessionEnv};
use odo_devfile::Devfile;

pub const HELLO_DEVFILE: &str = r#"
schemaVersion: 2.2.0
metadata:
  name: hello
components:
  - name: web
    container:
      image: node:18
commands:
  - id: r
    exec:
      component: web
      commandLine: node app.js
      group:
        kind: run
        isDefault: true
"#;

pub const ENDPOINT_DEVFILE: &str = r#"
schemaVersion: 2.2.0
metadata:
  name: hello
components:
  - name: web
    container:
      image: node:18
      volumeMounts:
        - name: cache
          path: /cache
      endpoints:
        - name: http
          targetPort: 3000
  - name: cache
    volume:
      size: 2Gi
commands:
  - id: prepare
    exec:
      component: web
      commandLine: mkdir -p /projects/tmp
  - id: install
    exec:
      component: web
      commandLine: npm install
      workingDir: ${PROJECT_SOURCE}
      group:
        kind: build
        isDefault: true
  - id: r
    exec:
      component: web
      commandLine: node app.js
      workingDir: ${PROJECT_SOURCE}
      group:
        kind: run
        isDefault: true
  - id: greet
    exec:
      component: web
      commandLine: echo started
events:
  preStart:
    - prepare
  postStart:
    - greet
  preStop:
    - greet
"#;

pub const CYCLE_DEVFILE: &str = r#"
schemaVersion: 2.2.0
metadata:
  name: cycle
components:
  - name: web
    container:
      image: node:18
commands:
  - id: cA
    composite:
      commands: [cB, cC]
      group:
        kind: run
        isDefault: true
  - id: cB
    composite:
      commands: [cA]
  - id: cC
    exec:
      component: web
      commandLine: echo c
"#;

pub fn devfile(source: &str) -> Devfile {
    let mut variables = BTreeMap::new();
    // Left for the container shell to expand.
    variables.insert("PROJECT_SOURCE".to_owned(), "$PROJECT_SOURCE".to_owned());
    Devfile::parse(source, &variables).unwrap()
}

pub fn session_env(root: &Path, platform: PlatformKind) -> SessionEnv {
    SessionEnv {
        workspace_root: root.to_owned(),
        devfile_path: root.join("devfile.yaml"),
        pid: 4242,
        component: "web".to_owned(),
        app: "app".to_owned(),
        platform,
    }
}
