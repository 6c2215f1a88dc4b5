//! Key-path schema for the base and profile documents.
//!
//! The walker runs on the raw `toml::Table` before serde sees it, so type
//! errors name the exact key path and unknown keys can be reported instead of
//! silently dropped.

use std::fmt;

use crate::error::BuildError;

#[derive(Debug, Clone, Copy)]
pub(crate) enum Kind {
    Str,
    Bool,
    Int { min: i64, max: i64 },
    StrList,
    IntList { min: i64, max: i64 },
    Table(&'static [Field]),
    TableList(&'static [Field]),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Field {
    key: &'static str,
    kind: Kind,
    required: bool,
}

const fn req(key: &'static str, kind: Kind) -> Field {
    Field {
        key,
        kind,
        required: true,
    }
}

const fn opt(key: &'static str, kind: Kind) -> Field {
    Field {
        key,
        kind,
        required: false,
    }
}

const PORTS: Kind = Kind::IntList { min: 1, max: 65535 };

const ETHERNET: &[Field] = &[
    opt("interface", Kind::Str),
    opt("dhcp", Kind::Bool),
    opt("address", Kind::Str),
    opt("gateway", Kind::Str),
    opt("dns", Kind::StrList),
];

const WIFI: &[Field] = &[
    opt("enabled", Kind::Bool),
    opt("interface", Kind::Str),
    opt("ap_mode", Kind::Bool),
    opt("dhcp", Kind::Bool),
    opt("address", Kind::Str),
    opt("gateway", Kind::Str),
    opt("dns", Kind::StrList),
];

const BRIDGE: &[Field] = &[
    opt("enabled", Kind::Bool),
    opt("name", Kind::Str),
    opt("members", Kind::StrList),
    opt("dhcp", Kind::Bool),
    opt("address", Kind::Str),
    opt("gateway", Kind::Str),
    opt("dns", Kind::StrList),
];

const VLAN: &[Field] = &[
    opt("id", Kind::Int { min: 1, max: 4094 }),
    opt("interface", Kind::Str),
    opt("name", Kind::Str),
    opt("dhcp", Kind::Bool),
    opt("address", Kind::Str),
    opt("gateway", Kind::Str),
];

const FIREWALL: &[Field] = &[opt("allow_ports", PORTS), opt("masquerade", Kind::Str)];

const NETWORK: &[Field] = &[
    opt("ethernet", Kind::Table(ETHERNET)),
    opt("wifi", Kind::Table(WIFI)),
    opt("bridge", Kind::Table(BRIDGE)),
    opt("vlans", Kind::TableList(VLAN)),
    opt("firewall", Kind::Table(FIREWALL)),
];

const HOSTAPD: &[Field] = &[
    opt("enabled", Kind::Bool),
    opt("interface", Kind::Str),
    opt("ssid", Kind::Str),
    opt("password", Kind::Str),
    opt("channel", Kind::Int { min: 1, max: 196 }),
    opt("hw_mode", Kind::Str),
    opt("country_code", Kind::Str),
];

const DNSMASQ: &[Field] = &[
    opt("enabled", Kind::Bool),
    opt("interface", Kind::Str),
    opt("dhcp_range", Kind::Str),
    opt("gateway", Kind::Str),
    opt("dns", Kind::StrList),
    opt("domain", Kind::Str),
];

const FRY: &[Field] = &[
    opt("bandwidth_mining", Kind::Bool),
    opt("node_type", Kind::Str),
    opt("api_endpoint", Kind::Str),
];

const BASE_GENERAL: &[Field] = &[opt("os_name", Kind::Str), opt("os_version", Kind::Str)];

const BASE_DEBIAN: &[Field] = &[
    req("suite", Kind::Str),
    req("mirror", Kind::Str),
    opt("security_mirror", Kind::Str),
    opt("components", Kind::StrList),
];

const BASE_PACKAGES: &[Field] = &[
    req("core", Kind::StrList),
    opt("iot", Kind::StrList),
    opt("desktop", Kind::StrList),
    opt("server", Kind::StrList),
    opt("exclude", Kind::StrList),
];

const BASE_BUILD: &[Field] = &[opt("image_size", Kind::Str), opt("filesystem", Kind::Str)];

const BASE_OUTPUT: &[Field] = &[opt("compression", Kind::Str), opt("image_prefix", Kind::Str)];

pub(crate) const BASE_DOCUMENT: &[Field] = &[
    opt("general", Kind::Table(BASE_GENERAL)),
    req("debian", Kind::Table(BASE_DEBIAN)),
    req("packages", Kind::Table(BASE_PACKAGES)),
    opt("build", Kind::Table(BASE_BUILD)),
    opt("output", Kind::Table(BASE_OUTPUT)),
    opt("fry", Kind::Table(FRY)),
    opt("network", Kind::Table(NETWORK)),
    opt("hostapd", Kind::Table(HOSTAPD)),
    opt("dnsmasq", Kind::Table(DNSMASQ)),
];

const PROFILE_GENERAL: &[Field] = &[
    opt("codename", Kind::Str),
    opt("brand", Kind::Str),
    opt("model", Kind::Str),
];

const PROFILE_BUILD: &[Field] = &[
    opt("architecture", Kind::Str),
    opt("flavor", Kind::Str),
    opt("image_size", Kind::Str),
    opt("filesystem", Kind::Str),
    opt("kernel_package", Kind::Str),
];

const PROFILE_SYSTEM: &[Field] = &[opt("hostname", Kind::Str)];

const PROFILE_PACKAGES: &[Field] = &[opt("include", Kind::StrList), opt("exclude", Kind::StrList)];

pub(crate) const PROFILE_DOCUMENT: &[Field] = &[
    opt("general", Kind::Table(PROFILE_GENERAL)),
    opt("build", Kind::Table(PROFILE_BUILD)),
    opt("system", Kind::Table(PROFILE_SYSTEM)),
    opt("packages", Kind::Table(PROFILE_PACKAGES)),
    opt("network", Kind::Table(NETWORK)),
    opt("hostapd", Kind::Table(HOSTAPD)),
    opt("dnsmasq", Kind::Table(DNSMASQ)),
    opt("fry", Kind::Table(FRY)),
];

/// A key the schema does not recognize. Reported, never fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    pub document: String,
    pub key_path: String,
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown key `{}` in {} (kept, but ignored by this builder)",
            self.key_path, self.document
        )
    }
}

pub(crate) struct Walker<'a> {
    document: &'a str,
    warnings: Vec<ConfigWarning>,
    /// Unknown keys below the top level, by dotted path.
    nested_extras: Vec<(String, toml::Value)>,
}

impl<'a> Walker<'a> {
    pub(crate) fn new(document: &'a str) -> Self {
        Self {
            document,
            warnings: Vec::new(),
            nested_extras: Vec::new(),
        }
    }

    pub(crate) fn into_parts(self) -> (Vec<ConfigWarning>, Vec<(String, toml::Value)>) {
        (self.warnings, self.nested_extras)
    }

    pub(crate) fn check_table(
        &mut self,
        table: &toml::Table,
        fields: &[Field],
        prefix: &str,
    ) -> Result<(), BuildError> {
        for field in fields {
            let path = join(prefix, field.key);
            match table.get(field.key) {
                Some(value) => self.check_value(value, field.kind, &path)?,
                None if field.required => {
                    let mut message = "required key is missing".to_string();
                    if let Some(near) = near_miss(table, field.key, fields) {
                        message.push_str(&format!(" (found `{}`; did you mean `{}`?)", near, field.key));
                    }
                    return Err(self.schema_error(&path, message));
                }
                None => {}
            }
        }

        for (key, value) in table {
            if !fields.iter().any(|field| field.key == key.as_str()) {
                let key_path = join(prefix, key);
                if !prefix.is_empty() {
                    self.nested_extras.push((key_path.clone(), value.clone()));
                }
                self.warnings.push(ConfigWarning {
                    document: self.document.to_string(),
                    key_path,
                });
            }
        }
        Ok(())
    }

    fn check_value(&mut self, value: &toml::Value, kind: Kind, path: &str) -> Result<(), BuildError> {
        match (kind, value) {
            (Kind::Str, toml::Value::String(_)) | (Kind::Bool, toml::Value::Boolean(_)) => Ok(()),
            (Kind::Int { min, max }, toml::Value::Integer(n)) => self.check_range(*n, min, max, path),
            (Kind::StrList, toml::Value::Array(items)) => {
                for (index, item) in items.iter().enumerate() {
                    if !item.is_str() {
                        return Err(self.schema_error(
                            &format!("{}[{}]", path, index),
                            format!("expected a string, found {}", item.type_str()),
                        ));
                    }
                }
                Ok(())
            }
            (Kind::IntList { min, max }, toml::Value::Array(items)) => {
                for (index, item) in items.iter().enumerate() {
                    let item_path = format!("{}[{}]", path, index);
                    match item.as_integer() {
                        Some(n) => self.check_range(n, min, max, &item_path)?,
                        None => {
                            return Err(self.schema_error(
                                &item_path,
                                format!("expected an integer, found {}", item.type_str()),
                            ))
                        }
                    }
                }
                Ok(())
            }
            (Kind::Table(fields), toml::Value::Table(table)) => self.check_table(table, fields, path),
            (Kind::TableList(fields), toml::Value::Array(items)) => {
                for (index, item) in items.iter().enumerate() {
                    let item_path = format!("{}[{}]", path, index);
                    match item.as_table() {
                        Some(table) => self.check_table(table, fields, &item_path)?,
                        None => {
                            return Err(self.schema_error(
                                &item_path,
                                format!("expected a table, found {}", item.type_str()),
                            ))
                        }
                    }
                }
                Ok(())
            }
            (kind, value) => Err(self.schema_error(
                path,
                format!("expected {}, found {}", kind.describe(), value.type_str()),
            )),
        }
    }

    fn check_range(&self, n: i64, min: i64, max: i64, path: &str) -> Result<(), BuildError> {
        if n < min || n > max {
            return Err(self.schema_error(
                path,
                format!("{} is out of range ({}..={})", n, min, max),
            ));
        }
        Ok(())
    }

    fn schema_error(&self, path: &str, message: String) -> BuildError {
        BuildError::ConfigSchema {
            document: self.document.to_string(),
            key_path: path.to_string(),
            message,
        }
    }
}

impl Kind {
    fn describe(&self) -> &'static str {
        match self {
            Kind::Str => "a string",
            Kind::Bool => "a boolean",
            Kind::Int { .. } => "an integer",
            Kind::StrList => "an array of strings",
            Kind::IntList { .. } => "an array of integers",
            Kind::Table(_) => "a table",
            Kind::TableList(_) => "an array of tables",
        }
    }
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", prefix, key)
    }
}

fn normalize(key: &str) -> String {
    key.to_ascii_lowercase().replace('-', "_")
}

/// An unrecognized sibling key that is the required key spelled differently.
fn near_miss<'t>(table: &'t toml::Table, wanted: &str, fields: &[Field]) -> Option<&'t str> {
    let wanted = normalize(wanted);
    table
        .keys()
        .filter(|key| !fields.iter().any(|field| field.key == key.as_str()))
        .find(|key| normalize(key) == wanted)
        .map(String::as_str)
}
