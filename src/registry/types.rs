use serde::{Deserialize, Serialize};

/// Declared capabilities of a client, read from the definition's optional
/// `hive.yaml`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientMetadata {
    pub roles: Vec<String>,
}

impl Default for ClientMetadata {
    fn default() -> Self {
        Self {
            roles: vec!["eth1".to_string()],
        }
    }
}

/// A buildable client, immutable after discovery. Served as JSON by the
/// `/clients` endpoint; the image handle is host-internal and not exposed.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientDefinition {
    pub name: String,
    pub version: String,
    #[serde(skip)]
    pub image: String,
    pub meta: ClientMetadata,
}

/// A buildable simulator program.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SimulatorDefinition {
    pub name: String,
    pub image: String,
}

/// On-disk shape of a client definition's `hive.yaml`.
#[derive(Debug, Deserialize, Default)]
pub struct ClientConfigFile {
    #[serde(default)]
    pub roles: Option<Vec<String>>,
}
