use std::fmt;

use serde::{Deserialize, Serialize};

use crate::EnvVar;

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct Command {
    pub id: String,
    #[serde(flatten)]
    pub kind: CommandKind,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub enum CommandKind {
    Exec(ExecCommand),
    Composite(CompositeCommand),
    Apply(ApplyCommand),
}

#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ExecCommand {
    pub component: String,
    pub command_line: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env: Vec<EnvVar>,
    #[serde(default)]
    pub hot_reload_capable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<CommandGroup>,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CompositeCommand {
    pub commands: Vec<String>,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<CommandGroup>,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ApplyCommand {
    pub component: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<CommandGroup>,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CommandGroup {
    pub kind: GroupKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_default: Option<bool>,
}

impl CommandGroup {
    pub fn is_default(&self) -> bool {
        self.is_default.unwrap_or(false)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Debug)]
#[serde(rename_all = "lowercase")]
pub enum GroupKind {
    Build,
    Run,
    Test,
    Debug,
    Deploy,
}

impl GroupKind {
    pub const ALL: [GroupKind; 5] = [
        GroupKind::Build,
        GroupKind::Run,
        GroupKind::Test,
        GroupKind::Debug,
        GroupKind::Deploy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GroupKind::Build => "build",
            GroupKind::Run => "run",
            GroupKind::Test => "test",
            GroupKind::Debug => "debug",
            GroupKind::Deploy => "deploy",
        }
    }
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Command {
    pub fn group(&self) -> Option<&CommandGroup> {
        match &self.kind {
            CommandKind::Exec(exec) => exec.group.as_ref(),
            CommandKind::Composite(composite) => composite.group.as_ref(),
            CommandKind::Apply(apply) => apply.group.as_ref(),
        }
    }

    pub fn group_mut(&mut self) -> Option<&mut CommandGroup> {
        match &mut self.kind {
            CommandKind::Exec(exec) => exec.group.as_mut(),
            CommandKind::Composite(composite) => composite.group.as_mut(),
            CommandKind::Apply(apply) => apply.group.as_mut(),
        }
    }

    pub fn is_exec(&self) -> bool {
        matches!(self.kind, CommandKind::Exec(_))
    }
}
