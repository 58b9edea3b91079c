//! Connection-string and endpoint extraction from application configuration.
//!
//! Database connection strings are classified in order, first match wins:
//!
//! 1. `url=...;database=...`: document store
//! 2. `msldap://host/OU=...,CN=...`: directory service
//! 3. anything else: relational key/value connection string
//!
//! A string that fails to parse is never dropped: it is logged and kept as a
//! degraded [`DatabaseConnection`] holding only the raw text.

use anyhow::{anyhow, bail, Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, error, warn};

use crate::models::{DatabaseConnection, DatabaseProvider, EndpointConnection, Host};
use crate::xml::{parse_document, Element};

static CONNECTION_STRING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)connectionstring(" value)?\s?=\s?"([^"]*)"#).expect("valid regex")
});

const DATA_SOURCE_KEYS: &[&str] = &[
    "data source",
    "server",
    "address",
    "addr",
    "network address",
];
const CATALOG_KEYS: &[&str] = &["initial catalog", "database"];
const USER_KEYS: &[&str] = &["user id", "uid", "user"];

/// Every connection string declared in a configuration blob, in order.
pub fn extract_connection_strings(text: &str) -> Vec<String> {
    CONNECTION_STRING
        .captures_iter(text)
        .filter_map(|c| c.get(2).map(|m| m.as_str().to_string()))
        .collect()
}

/// Parse all connection strings in `text`. `origin` names the file for logs.
pub fn database_connections(text: &str, origin: &str) -> Vec<DatabaseConnection> {
    extract_connection_strings(text)
        .into_iter()
        .map(|raw| match parse_database_connection(&raw) {
            Ok(conn) => conn,
            Err(e) => {
                warn!(
                    connection_string = %raw,
                    config = origin,
                    "Failed to parse connection string"
                );
                error!(error = %e, "connection string parse error");
                DatabaseConnection::degraded(&raw)
            }
        })
        .collect()
}

pub fn parse_database_connection(raw: &str) -> Result<DatabaseConnection> {
    let lowered = raw.trim_start().to_lowercase();
    if lowered.starts_with("url") {
        parse_document_store(raw)
    } else if lowered.starts_with("msldap://") {
        parse_directory_service(raw)
    } else {
        parse_relational(raw)
    }
}

fn parse_document_store(raw: &str) -> Result<DatabaseConnection> {
    let mut url = None;
    let mut database = None;
    for token in raw.split(';').filter(|t| !t.trim().is_empty()) {
        let (key, value) = token.split_once('=').unwrap_or((token, ""));
        match key.trim().to_lowercase().as_str() {
            "url" => url = Some(value.trim().to_string()),
            "database" => database = Some(value.trim().to_string()),
            _ => {}
        }
    }
    let url = url
        .filter(|u| !u.is_empty())
        .ok_or_else(|| anyhow!("document store connection string has no url"))?;
    Ok(DatabaseConnection {
        provider: Some(DatabaseProvider::DocumentStore),
        connection_string: raw.to_string(),
        database,
        host: Some(Host::from_address(&url)),
        instance: Some(url),
        username: None,
        port: None,
    })
}

fn parse_directory_service(raw: &str) -> Result<DatabaseConnection> {
    let text = raw.trim_start();
    let scheme_len = "msldap://".len();
    let slash = text
        .rfind('/')
        .filter(|&i| i >= scheme_len)
        .ok_or_else(|| anyhow!("directory service connection string has no path"))?;
    // "msldap://host" becomes "http://host"
    let url = format!("http{}", &text["msldap".len()..slash]).to_lowercase();

    let mut ou = None;
    let mut cn = None;
    for part in text[slash + 1..].split(',').filter(|p| !p.is_empty()) {
        let (key, value) = part.split_once('=').unwrap_or((part, ""));
        match key.trim().to_lowercase().as_str() {
            "ou" => ou = Some(value.to_string()),
            "cn" => cn = Some(value.to_string()),
            _ => {}
        }
    }
    Ok(DatabaseConnection {
        provider: Some(DatabaseProvider::DirectoryService),
        connection_string: raw.to_string(),
        database: ou,
        instance: cn,
        host: Some(Host::from_address(&url)),
        username: None,
        port: None,
    })
}

fn parse_relational(raw: &str) -> Result<DatabaseConnection> {
    let pairs = parse_key_values(raw)?;
    let lookup = |keys: &[&str]| {
        pairs
            .iter()
            .rev()
            .find(|(k, _)| keys.contains(&k.as_str()))
            .map(|(_, v)| v.clone())
    };

    let data_source = lookup(DATA_SOURCE_KEYS)
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| anyhow!("connection string has no data source"))?;
    let target = resolve_data_source(&data_source)?;

    Ok(DatabaseConnection {
        provider: Some(DatabaseProvider::Relational),
        connection_string: raw.to_string(),
        database: lookup(CATALOG_KEYS),
        username: lookup(USER_KEYS),
        host: Some(Host::new(target.host, target.domain)),
        port: target.port,
        instance: target.instance,
    })
}

/// Host, domain, named instance and port of a relational data source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSourceTarget {
    pub host: String,
    pub domain: String,
    pub instance: Option<String>,
    pub port: Option<u16>,
}

pub fn resolve_data_source(data_source: &str) -> Result<DataSourceTarget> {
    let mut ds = data_source.trim();
    for protocol in ["tcp:", "np:", "lpc:", "admin:"] {
        if ds.len() > protocol.len() && ds[..protocol.len()].eq_ignore_ascii_case(protocol) {
            ds = &ds[protocol.len()..];
        }
    }

    let mut host = String::new();
    let mut instance = None;
    let mut port = None;

    if let Some((left, right)) = ds.split_once(',') {
        let right = right.rsplit(',').next().unwrap_or(right).trim();
        port = Some(
            right
                .parse::<u16>()
                .with_context(|| format!("invalid port '{}' in data source", right))?,
        );
        host = left.to_lowercase();
    }
    if let Some((left, right)) = ds.split_once('\\') {
        host = left.to_lowercase();
        instance = right
            .split(',')
            .next()
            .map(|i| i.trim().to_lowercase())
            .filter(|i| !i.is_empty());
    }
    if host.trim().is_empty() {
        host = ds.to_lowercase();
    }
    let mut host = host.trim().to_string();
    if host == "." || host == "(local)" {
        host = "localhost".to_string();
    }

    let mut domain = String::new();
    let is_ipv4 = host.chars().all(|c| c.is_ascii_digit() || c == '.');
    if !is_ipv4 {
        if let Some((first, rest)) = host.split_once('.') {
            domain = rest.to_string();
            host = first.to_string();
        }
    }

    Ok(DataSourceTarget {
        host,
        domain,
        instance,
        port,
    })
}

/// Split a `key=value;key=value` connection string. Keys are lower-cased with
/// inner whitespace collapsed; values may be wrapped in single or double
/// quotes, with a doubled quote standing for a literal one.
pub fn parse_key_values(raw: &str) -> Result<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    let mut chars = raw.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace() || *c == ';') {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        let mut found_eq = false;
        for c in chars.by_ref() {
            if c == '=' {
                found_eq = true;
                break;
            }
            if c == ';' {
                break;
            }
            key.push(c);
        }
        if !found_eq {
            bail!("invalid connection string token '{}'", key.trim());
        }
        let key = key
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();
        if key.is_empty() {
            bail!("connection string contains an empty key");
        }

        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }

        let mut value = String::new();
        match chars.peek().copied() {
            Some(q @ ('"' | '\'')) => {
                chars.next();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    if c == q {
                        if chars.peek() == Some(&q) {
                            chars.next();
                            value.push(q);
                            continue;
                        }
                        closed = true;
                        break;
                    }
                    value.push(c);
                }
                if !closed {
                    bail!("unterminated quoted value for '{}'", key);
                }
                for c in chars.by_ref() {
                    if c == ';' {
                        break;
                    }
                    if !c.is_whitespace() {
                        bail!("unexpected character after quoted value for '{}'", key);
                    }
                }
            }
            _ => {
                for c in chars.by_ref() {
                    if c == ';' {
                        break;
                    }
                    value.push(c);
                }
                value = value.trim().to_string();
            }
        }
        pairs.push((key, value));
    }

    Ok(pairs)
}

/// Endpoint references declared anywhere in a configuration document.
///
/// Returns an error only if the document itself is not well-formed; an
/// individual `endpoint` without an address is logged and skipped.
pub fn endpoint_connections(xml: &str, origin: &str) -> Result<Vec<EndpointConnection>> {
    let root = parse_document(xml)?;
    Ok(root
        .descendants("endpoint")
        .into_iter()
        .filter_map(|el| endpoint_connection(el, origin))
        .collect())
}

fn endpoint_connection(el: &Element, origin: &str) -> Option<EndpointConnection> {
    let address = match el.attr("address").map(str::trim).filter(|a| !a.is_empty()) {
        Some(a) => a.to_string(),
        None => {
            warn!(config = origin, "Failed to parse endpoint element: missing address");
            return None;
        }
    };
    let username = el
        .child("identity")
        .and_then(|id| id.child("userPrincipalName"))
        .and_then(|upn| upn.attr("value"))
        .map(str::to_string);
    debug!(address = %address, config = origin, "endpoint discovered");
    Some(EndpointConnection {
        host: Some(Host::from_address(&address)),
        address,
        username,
    })
}
