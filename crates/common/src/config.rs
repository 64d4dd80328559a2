//! JSON configuration loader.
//!
//! The configuration file is JSON with case-insensitive keys: the raw
//! document is parsed into a `serde_json::Value`, every object key is
//! folded to lowercase, and only then is the typed model deserialized.
//! Struct fields therefore use all-lowercase serde renames.
//!
//! Open-ended `params` blocks (`identifier`, `certModules`) are modelled
//! as tagged variants with one constructor per recognized `plugin` value;
//! an unknown plugin fails at load, not at first use.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::error::IamError;
use crate::Result;

const DEFAULT_CPU_INFO_PATH: &str = "/proc/cpuinfo";
const DEFAULT_MEM_INFO_PATH: &str = "/proc/meminfo";
const DEFAULT_NODE_ID_PATH: &str = "/etc/machine-id";
const DEFAULT_PROVISIONING_STATE_PATH: &str = "/var/edgeiam/.provisionstate";
const DEFAULT_NODE_RECONNECT_INTERVAL: Duration = Duration::from_secs(10);

/// Top-level configuration. Unrecognized keys are ignored.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(rename = "nodeinfo")]
    pub node_info: NodeInfoConfig,

    #[serde(rename = "iampublicserverurl")]
    pub iam_public_server_url: String,
    #[serde(rename = "iamprotectedserverurl")]
    pub iam_protected_server_url: String,

    /// Present on secondary nodes only.
    #[serde(rename = "mainiampublicserverurl", default)]
    pub main_iam_public_server_url: Option<String>,
    /// Present on secondary nodes only.
    #[serde(rename = "mainiamprotectedserverurl", default)]
    pub main_iam_protected_server_url: Option<String>,

    #[serde(rename = "cacert", default)]
    pub ca_cert: String,
    #[serde(rename = "certstorage", default)]
    pub cert_storage: String,

    #[serde(rename = "startprovisioningcmdargs", default)]
    pub start_provisioning_cmd_args: Vec<String>,
    #[serde(rename = "diskencryptioncmdargs", default)]
    pub disk_encryption_cmd_args: Vec<String>,
    #[serde(rename = "finishprovisioningcmdargs", default)]
    pub finish_provisioning_cmd_args: Vec<String>,
    #[serde(rename = "deprovisioncmdargs", default)]
    pub deprovision_cmd_args: Vec<String>,

    #[serde(
        rename = "nodereconnectinterval",
        default = "default_reconnect_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub node_reconnect_interval: Duration,

    #[serde(rename = "enablepermissionshandler", default)]
    pub enable_permissions_handler: bool,

    #[serde(rename = "identifier", default)]
    pub identifier: Option<IdentifierConfig>,

    #[serde(rename = "certmodules", default)]
    pub cert_modules: Vec<CertModuleConfig>,

    #[serde(rename = "database", default)]
    pub database: DatabaseConfig,
}

/// The `nodeInfo` block: static description of the local node.
#[derive(Clone, Debug, Deserialize)]
pub struct NodeInfoConfig {
    #[serde(rename = "cpuinfopath", default = "default_cpu_info_path")]
    pub cpu_info_path: String,
    #[serde(rename = "meminfopath", default = "default_mem_info_path")]
    pub mem_info_path: String,
    #[serde(rename = "nodeidpath", default = "default_node_id_path")]
    pub node_id_path: String,
    #[serde(rename = "provisioningstatepath", default = "default_provisioning_state_path")]
    pub provisioning_state_path: String,
    #[serde(rename = "nodename", default)]
    pub node_name: String,
    #[serde(rename = "nodetype", default)]
    pub node_type: String,
    #[serde(rename = "ostype", default)]
    pub os_type: String,
    #[serde(rename = "maxdmips", default)]
    pub max_dmips: u64,
    #[serde(rename = "attrs", default)]
    pub attrs: BTreeMap<String, String>,
    #[serde(rename = "partitions", default)]
    pub partitions: Vec<PartitionConfig>,
}

/// One declared storage partition.
#[derive(Clone, Debug, Deserialize)]
pub struct PartitionConfig {
    #[serde(rename = "name")]
    pub name: String,
    #[serde(rename = "types", default)]
    pub types: Vec<String>,
    #[serde(rename = "path")]
    pub path: String,
}

/// The `identifier` block with plugin-specific params.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "lowercase", tag = "plugin", content = "params")]
pub enum IdentifierConfig {
    /// Flat-file identity provider.
    #[serde(rename = "fileidentifier")]
    File(FileIdentifierParams),
}

/// Params of the `fileidentifier` plugin.
#[derive(Clone, Debug, Deserialize)]
pub struct FileIdentifierParams {
    #[serde(rename = "systemidpath")]
    pub system_id_path: String,
    #[serde(rename = "unitmodelpath")]
    pub unit_model_path: String,
    #[serde(rename = "subjectspath")]
    pub subjects_path: String,
}

/// One `certModules` entry.
#[derive(Clone, Debug, Deserialize)]
pub struct CertModuleConfig {
    #[serde(rename = "id")]
    pub id: String,
    #[serde(rename = "algorithm", default)]
    pub algorithm: String,
    #[serde(rename = "maxitems", default)]
    pub max_items: usize,
    #[serde(rename = "extendedkeyusage", default)]
    pub extended_key_usage: Vec<String>,
    #[serde(rename = "alternativenames", default)]
    pub alternative_names: Vec<String>,
    #[serde(rename = "disabled", default)]
    pub disabled: bool,
    #[serde(rename = "skipvalidation", default)]
    pub skip_validation: bool,
    #[serde(rename = "selfsigned", default)]
    pub self_signed: bool,
    #[serde(flatten)]
    pub plugin: CertModulePlugin,
}

/// Plugin selector of a cert module, with plugin-specific params.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "plugin", content = "params")]
pub enum CertModulePlugin {
    /// Key and certificate material kept in per-module directories under
    /// the database working directory.
    #[serde(rename = "file")]
    File(FileCertModuleParams),
}

/// Params of the `file` cert-module plugin.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct FileCertModuleParams {
    /// Optional subdirectory override; defaults to the module id.
    #[serde(rename = "storagedir", default)]
    pub storage_dir: Option<String>,
}

/// The `database` block.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct DatabaseConfig {
    #[serde(rename = "workingdir", default)]
    pub working_dir: String,
    #[serde(rename = "migration", default)]
    pub migration: MigrationConfig,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct MigrationConfig {
    #[serde(rename = "migrationpath", default)]
    pub migration_path: String,
    #[serde(rename = "mergedmigrationpath", default)]
    pub merged_migration_path: String,
}

fn default_cpu_info_path() -> String {
    DEFAULT_CPU_INFO_PATH.to_string()
}

fn default_mem_info_path() -> String {
    DEFAULT_MEM_INFO_PATH.to_string()
}

fn default_node_id_path() -> String {
    DEFAULT_NODE_ID_PATH.to_string()
}

fn default_provisioning_state_path() -> String {
    DEFAULT_PROVISIONING_STATE_PATH.to_string()
}

fn default_reconnect_interval() -> Duration {
    DEFAULT_NODE_RECONNECT_INTERVAL
}

/// Loads and validates a configuration file.
pub fn load_from_file(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path)
        .map_err(|e| IamError::not_found(format!("can't read config {}: {e}", path.display())))?;
    load_from_str(&raw)
}

/// Parses a configuration document from a JSON string.
pub fn load_from_str(raw: &str) -> Result<Config> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| IamError::invalid_argument(format!("config parse error: {e}")))?;
    let folded = fold_keys(value);
    serde_json::from_value(folded)
        .map_err(|e| IamError::invalid_argument(format!("config error: {e}")))
}

/// Recursively lowercases every object key.
fn fold_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), fold_keys(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(fold_keys).collect()),
        other => other,
    }
}

/// Parses a duration string of the form `"10s"`, `"5m"`, `"1h"`,
/// `"1m30s"` or a bare number of seconds.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(IamError::invalid_argument("empty duration"));
    }

    if let Ok(secs) = trimmed.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut digits = String::new();

    for ch in trimmed.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }

        let value: u64 = digits
            .parse()
            .map_err(|_| IamError::invalid_argument(format!("bad duration: {input}")))?;
        digits.clear();

        let unit = match ch {
            's' => Duration::from_secs(1),
            'm' => Duration::from_secs(60),
            'h' => Duration::from_secs(3600),
            _ => return Err(IamError::invalid_argument(format!("bad duration unit in: {input}"))),
        };
        total += unit * value as u32;
    }

    if !digits.is_empty() {
        return Err(IamError::invalid_argument(format!("trailing digits in duration: {input}")));
    }

    Ok(total)
}

fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_duration(&raw).map_err(serde::de::Error::custom)
}
