//! Ownership labels carried by every resource the tool creates
//!
//! Enumeration and deletion are driven solely by these labels; resource names are never used to decide ownership.

use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

pub const MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const INSTANCE: &str = "app.kubernetes.io/instance";
pub const MODE: &str = "odo.dev/mode";
pub const APP: &str = "app";
/// Hash of the pod spec we generated, used to detect drift without comparing server-defaulted fields
pub const SPEC_HASH: &str = "odo.dev/spec-hash";

pub const TOOL_NAME: &str = "odo";

#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Debug)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Dev,
    Deploy,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Dev => "dev",
            Mode::Deploy => "deploy",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dev" => Ok(Mode::Dev),
            "deploy" => Ok(Mode::Deploy),
            other => Err(format!("unknown mode {:?}, expected one of: dev, deploy", other)),
        }
    }
}

pub fn ownership_labels(component: &str, app: &str, mode: Mode) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(MANAGED_BY.to_owned(), TOOL_NAME.to_owned());
    labels.insert(INSTANCE.to_owned(), component.to_owned());
    labels.insert(MODE.to_owned(), mode.as_str().to_owned());
    labels.insert(APP.to_owned(), app.to_owned());
    labels
}

/// A label selector restricted to equality terms
#[derive(Clone, PartialEq, Eq, Default, Debug)]
pub struct Selector {
    terms: BTreeMap<String, String>,
    any_manager: bool,
}

impl Selector {
    /// Selects resources managed by this tool
    pub fn managed() -> Selector {
        let mut selector = Selector::default();
        selector.terms.insert(MANAGED_BY.to_owned(), TOOL_NAME.to_owned());
        selector
    }

    /// Selects resources of a component, optionally restricted to one mode
    pub fn component(component: &str, mode: Option<Mode>) -> Selector {
        let mut selector = Selector::managed().with(INSTANCE, component);
        if let Some(mode) = mode {
            selector = selector.with(MODE, mode.as_str());
        }
        selector
    }

    pub fn with(mut self, key: &str, value: &str) -> Selector {
        self.terms.insert(key.to_owned(), value.to_owned());
        self
    }

    /// Drops the managed-by restriction so resources created by other managers are included
    pub fn any_manager(mut self) -> Selector {
        self.terms.remove(MANAGED_BY);
        self.any_manager = true;
        self
    }

    pub fn includes_other_managers(&self) -> bool {
        self.any_manager
    }

    pub fn terms(&self) -> impl Iterator<Item = (&str, &str)> {
        self.terms.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.terms.iter().all(|(k, v)| labels.get(k) == Some(v))
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, (k, v)) in self.terms.iter().enumerate() {
            if index > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}={}", k, v)?;
        }
        Ok(())
    }
}
