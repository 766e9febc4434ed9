use std::collections::{BTreeMap, BTreeSet};

use crate::{CommandKind, ComponentKind, Devfile, DevfileError};

const MINIMUM_SCHEMA: (u32, u32) = (2, 1);

impl Devfile {
    /// Checks the structural invariants of the manifest, reporting every violation at once
    pub fn validate(&self) -> Result<(), DevfileError> {
        let mut problems = Vec::new();

        match parse_schema_version(&self.schema_version) {
            Some(version) if version >= MINIMUM_SCHEMA => {}
            Some(_) => problems.push(format!(
                "schemaVersion {} is not supported, at least {}.{} is required",
                self.schema_version, MINIMUM_SCHEMA.0, MINIMUM_SCHEMA.1
            )),
            None => problems.push(format!("schemaVersion {:?} is malformed", self.schema_version)),
        }

        if self.metadata.name.is_empty() {
            problems.push("metadata.name must be set".to_owned());
        }

        let mut components = BTreeMap::new();
        for component in &self.components {
            if components.insert(component.name.as_str(), &component.kind).is_some() {
                problems.push(format!("duplicate component name {:?}", component.name));
            }
        }
        if self.container_components().next().is_none() {
            problems.push("at least one container component is required".to_owned());
        }

        for (component, container) in self.container_components() {
            for mount in &container.volume_mounts {
                match components.get(mount.name.as_str()) {
                    Some(ComponentKind::Volume(_)) => {}
                    _ => problems.push(format!(
                        "container {:?} mounts {:?} which is not a volume component",
                        component.name, mount.name
                    )),
                }
            }
            let mut ports = BTreeSet::new();
            for endpoint in &container.endpoints {
                if !ports.insert(endpoint.target_port) {
                    problems.push(format!(
                        "container {:?} declares port {} more than once",
                        component.name, endpoint.target_port
                    ));
                }
            }
        }

        let ids: BTreeSet<&str> = self.commands.iter().map(|command| command.id.as_str()).collect();
        if ids.len() != self.commands.len() {
            let mut seen = BTreeSet::new();
            for command in &self.commands {
                if !seen.insert(command.id.as_str()) {
                    problems.push(format!("duplicate command id {:?}", command.id));
                }
            }
        }

        for command in &self.commands {
            match &command.kind {
                CommandKind::Exec(exec) => match components.get(exec.component.as_str()) {
                    Some(ComponentKind::Container(_)) => {}
                    _ => problems.push(format!(
                        "exec command {:?} must reference a container component, found {:?}",
                        command.id, exec.component
                    )),
                },
                CommandKind::Apply(apply) => match components.get(apply.component.as_str()) {
                    Some(ComponentKind::Image(_) | ComponentKind::Kubernetes(_) | ComponentKind::Openshift(_)) => {}
                    _ => problems.push(format!(
                        "apply command {:?} must reference an image, kubernetes or openshift component, found {:?}",
                        command.id, apply.component
                    )),
                },
                CommandKind::Composite(composite) => {
                    for member in &composite.commands {
                        if !ids.contains(member.as_str()) {
                            problems.push(format!(
                                "composite command {:?} references unknown command {:?}",
                                command.id, member
                            ));
                        }
                    }
                }
            }
        }

        let mut defaults: BTreeMap<_, Vec<&str>> = BTreeMap::new();
        for command in &self.commands {
            if let Some(group) = command.group() {
                if group.is_default() {
                    defaults.entry(group.kind).or_default().push(&command.id);
                }
            }
        }
        for (kind, ids) in defaults {
            if ids.len() > 1 {
                problems.push(format!("more than one default {} command: {}", kind, ids.join(", ")));
            }
        }

        for (event, ids) in [
            ("preStart", &self.events.pre_start),
            ("postStart", &self.events.post_start),
            ("preStop", &self.events.pre_stop),
            ("postStop", &self.events.post_stop),
        ] {
            for id in ids {
                if self.command(id).is_none() {
                    problems.push(format!("{} event references unknown command {:?}", event, id));
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(DevfileError::Invalid(problems))
        }
    }
}

fn parse_schema_version(version: &str) -> Option<(u32, u32)> {
    let mut parts = version.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use crate::{tests::NODE_DEVFILE, Devfile, DevfileError};

    fn problems_for(source: &str) -> Vec<String> {
        match Devfile::parse(source, &BTreeMap::new()) {
            Err(DevfileError::Invalid(problems)) => problems,
            other => panic!("expected validation failure, got {:?}", other),
        }
    }

    #[test]
    fn exec_must_target_container() {
        let source = NODE_DEVFILE.replace(
            "component: runtime\n      commandLine: npm start",
            "component: prod-image\n      commandLine: npm start",
        );
        let problems = problems_for(&source);
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("\"run\""), "{}", problems[0]);
    }

    #[test]
    fn composite_members_must_resolve() {
        let source = NODE_DEVFILE.replace("- deploy-k8s", "- deploy-nowhere");
        let problems = problems_for(&source);
        assert!(problems.iter().any(|p| p.contains("deploy-nowhere")), "{:?}", problems);
    }

    #[test]
    fn two_defaults_rejected() {
        let source = NODE_DEVFILE.replace("kind: debug\n", "kind: debug\n        isDefault: true\n");
        Devfile::parse(&source, &BTreeMap::new()).unwrap();

        let source = NODE_DEVFILE.replace("kind: debug\n", "kind: run\n        isDefault: true\n");
        let problems = problems_for(&source);
        assert!(problems.iter().any(|p| p.contains("more than one default run")), "{:?}", problems);
    }

    #[test]
    fn old_schema_rejected() {
        let source = NODE_DEVFILE.replace("schemaVersion: 2.2.0", "schemaVersion: 2.0.0");
        let problems = problems_for(&source);
        assert!(problems[0].contains("not supported"));
    }

    #[test]
    fn container_required() {
        let source = r#"
schemaVersion: 2.1.0
metadata:
  name: empty
components:
  - name: data
    volume: {}
"#;
        let problems = problems_for(source);
        assert!(problems.iter().any(|p| p.contains("container component is required")));
    }
}
