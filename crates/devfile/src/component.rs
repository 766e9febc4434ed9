use std::fmt;

use serde::{de, Deserialize, Deserializer, Serialize};

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct Component {
    pub name: String,
    #[serde(flatten)]
    pub kind: ComponentKind,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub enum ComponentKind {
    Container(Container),
    Image(Image),
    Kubernetes(KubernetesResource),
    Openshift(KubernetesResource),
    Volume(Volume),
}

impl ComponentKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            ComponentKind::Container(_) => "container",
            ComponentKind::Image(_) => "image",
            ComponentKind::Kubernetes(_) => "kubernetes",
            ComponentKind::Openshift(_) => "openshift",
            ComponentKind::Volume(_) => "volume",
        }
    }
}

#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(default)]
    pub env: Vec<EnvVar>,
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMount>,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_sources: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_mapping: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_request: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_limit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_request: Option<String>,
}

impl Container {
    pub fn mounts_sources(&self) -> bool {
        self.mount_sources.unwrap_or(true)
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct EnvVar {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct VolumeMount {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl VolumeMount {
    pub fn mount_path(&self) -> String {
        match &self.path {
            Some(path) => path.clone(),
            None => format!("/{}", self.name),
        }
    }
}

#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub name: String,
    #[serde(deserialize_with = "deserialize_port")]
    pub target_port: u16,
    #[serde(default)]
    pub exposure: Exposure,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl Endpoint {
    pub fn is_debug(&self) -> bool {
        self.name == "debug" || self.name.starts_with("debug-")
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Debug, Default)]
#[serde(rename_all = "lowercase")]
pub enum Exposure {
    #[default]
    Public,
    Internal,
    None,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    pub image_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_build: Option<bool>,
    pub dockerfile: Dockerfile,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Dockerfile {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_context: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub root_required: bool,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesResource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inlined: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy_by_default: Option<bool>,
}

#[derive(Clone, Default, Serialize, Deserialize, Debug)]
pub struct Volume {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral: Option<bool>,
}

// Substituted variables always produce strings, so ports may arrive either way.
fn deserialize_port<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    struct PortVisitor;

    impl<'de> de::Visitor<'de> for PortVisitor {
        type Value = u16;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            write!(f, "a port number")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<u16, E> {
            u16::try_from(v).map_err(|_| E::invalid_value(de::Unexpected::Unsigned(v), &self))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<u16, E> {
            u16::try_from(v).map_err(|_| E::invalid_value(de::Unexpected::Signed(v), &self))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<u16, E> {
            v.trim()
                .parse()
                .map_err(|_| E::invalid_value(de::Unexpected::Str(v), &self))
        }
    }

    deserializer.deserialize_any(PortVisitor)
}
