//! Editing of the YAML documents stored in ConfigMaps
//!
//! The homeserver (`homeserver.yaml`) and Heisenbridge (`heisenbridge.yaml`)
//! documents are freeform. Edits only touch the keys they own; everything
//! else is carried through in its original order.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use k8s_openapi::api::core::v1::ConfigMap;
use serde::Serialize;
use serde_yaml::{Mapping, Value};
use thiserror::Error;

use crate::crd::DatabaseConnectionInfo;

pub const HOMESERVER_KEY: &str = "homeserver.yaml";
pub const HEISENBRIDGE_KEY: &str = "heisenbridge.yaml";

/// Port Heisenbridge listens on for appservice traffic
pub const HEISENBRIDGE_PORT: i32 = 9898;

#[derive(Error, Debug)]
pub enum HomeserverConfigError {
    #[error("missing {0} in ConfigMap")]
    MissingDocument(&'static str),

    #[error("malformed {document}: {source}")]
    Malformed {
        document: &'static str,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("cannot render {document}: {source}")]
    Render {
        document: &'static str,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("{0} is not a YAML mapping")]
    NotAMapping(&'static str),

    #[error("missing {0} key in homeserver.yaml")]
    MissingKey(&'static str),

    #[error("{key} in homeserver.yaml is not a {expected}")]
    WrongType {
        key: &'static str,
        expected: &'static str,
    },

    #[error("error parsing the connection URL with value: {0}")]
    ConnectionUrl(String),

    #[error("database password in status is not valid base64: {0}")]
    PasswordEncoding(String),
}

type EditResult<T> = std::result::Result<T, HomeserverConfigError>;

/// A named mutation of one of the managed documents.
#[derive(Debug, Clone, Copy)]
pub enum DocumentEdit<'a> {
    /// Replace the homeserver `database` section
    Database(&'a DatabaseConnectionInfo),
    /// Register an appservice file in the homeserver document
    AppserviceRegistration(&'a str),
    /// Point the bridge registration at the bridge Service IP
    BridgeUrl(&'a str),
}

impl DocumentEdit<'_> {
    /// ConfigMap key holding the document this edit applies to.
    pub fn document_key(&self) -> &'static str {
        match self {
            DocumentEdit::Database(_) | DocumentEdit::AppserviceRegistration(_) => HOMESERVER_KEY,
            DocumentEdit::BridgeUrl(_) => HEISENBRIDGE_KEY,
        }
    }

    fn apply(&self, doc: &mut Mapping) -> EditResult<()> {
        match self {
            DocumentEdit::Database(info) => merge_database_section(doc, info),
            DocumentEdit::AppserviceRegistration(path) => {
                merge_appservice_registration(doc, path);
                Ok(())
            }
            DocumentEdit::BridgeUrl(ip) => {
                rewrite_bridge_url(doc, ip);
                Ok(())
            }
        }
    }
}

/// Apply `edit` to the matching document of `cm`.
///
/// Returns `true` when the document changed and the ConfigMap needs to be
/// written back.
pub fn apply_edit(cm: &mut ConfigMap, edit: DocumentEdit<'_>) -> EditResult<bool> {
    let key = edit.document_key();
    let data = cm.data.get_or_insert_with(BTreeMap::new);
    let original = load_document(data, key)?;

    let mut edited = original.clone();
    edit.apply(&mut edited)?;
    if edited == original {
        return Ok(false);
    }

    store_document(data, key, &edited)?;
    Ok(true)
}

/// Read `server_name` and `report_stats` from a homeserver ConfigMap.
pub fn parse_homeserver(data: &BTreeMap<String, String>) -> EditResult<(String, bool)> {
    let doc = load_document(data, HOMESERVER_KEY)?;

    let server_name = match doc.get("server_name") {
        None => return Err(HomeserverConfigError::MissingKey("server_name")),
        Some(Value::String(name)) => name.clone(),
        Some(_) => {
            return Err(HomeserverConfigError::WrongType {
                key: "server_name",
                expected: "string",
            })
        }
    };

    let report_stats = match doc.get("report_stats") {
        None => return Err(HomeserverConfigError::MissingKey("report_stats")),
        Some(Value::Bool(report)) => *report,
        Some(_) => {
            return Err(HomeserverConfigError::WrongType {
                key: "report_stats",
                expected: "boolean",
            })
        }
    };

    Ok((server_name, report_stats))
}

pub fn load_document(data: &BTreeMap<String, String>, key: &'static str) -> EditResult<Mapping> {
    let raw = data
        .get(key)
        .ok_or(HomeserverConfigError::MissingDocument(key))?;

    match serde_yaml::from_str::<Value>(raw) {
        Ok(Value::Mapping(doc)) => Ok(doc),
        Ok(Value::Null) => Ok(Mapping::new()),
        Ok(_) => Err(HomeserverConfigError::NotAMapping(key)),
        Err(source) => Err(HomeserverConfigError::Malformed {
            document: key,
            source,
        }),
    }
}

fn store_document(
    data: &mut BTreeMap<String, String>,
    key: &'static str,
    doc: &Mapping,
) -> EditResult<()> {
    let rendered = serde_yaml::to_string(doc).map_err(|source| HomeserverConfigError::Render {
        document: key,
        source,
    })?;
    data.insert(key.to_string(), rendered);
    Ok(())
}

#[derive(Serialize)]
struct PgsqlDatabase<'a> {
    name: &'static str,
    txn_limit: i64,
    args: PgsqlArgs<'a>,
}

#[derive(Serialize)]
struct PgsqlArgs<'a> {
    user: &'a str,
    password: String,
    database: &'a str,
    host: &'a str,
    port: i64,
    cp_min: i64,
    cp_max: i64,
}

/// Split `host:port` on the last colon.
pub fn split_connection_url(url: &str) -> EditResult<(&str, i64)> {
    let (host, port) = url
        .rsplit_once(':')
        .ok_or_else(|| HomeserverConfigError::ConnectionUrl(url.to_string()))?;
    let port = port
        .parse::<i64>()
        .map_err(|_| HomeserverConfigError::ConnectionUrl(url.to_string()))?;
    Ok((host, port))
}

/// Replace the top-level `database` key with a psycopg2 section built from
/// the connection info recorded in status.
pub fn merge_database_section(doc: &mut Mapping, info: &DatabaseConnectionInfo) -> EditResult<()> {
    let (host, port) = split_connection_url(&info.connection_url)?;
    let password = STANDARD
        .decode(&info.password)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .ok_or_else(|| HomeserverConfigError::PasswordEncoding(info.user.clone()))?;

    let section = PgsqlDatabase {
        name: "psycopg2",
        txn_limit: 0,
        args: PgsqlArgs {
            user: &info.user,
            password,
            database: &info.database_name,
            host,
            port,
            cp_min: 5,
            cp_max: 10,
        },
    };
    let section = serde_yaml::to_value(section).map_err(|source| HomeserverConfigError::Render {
        document: HOMESERVER_KEY,
        source,
    })?;

    doc.insert(Value::from("database"), section);
    Ok(())
}

/// Add `path` to `app_service_config_files`, creating the list if needed.
pub fn merge_appservice_registration(doc: &mut Mapping, path: &str) {
    let key = Value::from("app_service_config_files");
    let mut files: Vec<Value> = match doc.get(&key) {
        Some(Value::Sequence(existing)) => existing.clone(),
        _ => Vec::new(),
    };
    files.push(Value::from(path));

    let mut deduped: Vec<Value> = Vec::with_capacity(files.len());
    for file in files {
        if !deduped.contains(&file) {
            deduped.push(file);
        }
    }

    doc.insert(key, Value::Sequence(deduped));
}

/// Point the bridge registration `url` at `ip`.
pub fn rewrite_bridge_url(doc: &mut Mapping, ip: &str) {
    doc.insert(Value::from("url"), Value::from(bridge_url(ip)));
}

pub fn bridge_url(ip: &str) -> String {
    format!("http://{ip}:{HEISENBRIDGE_PORT}")
}
