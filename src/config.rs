//! Plugin parameters.
//!
//! The host hands parameters over one `key=value` pair at a time through
//! [`Params::set`]; [`Params::validate`] then turns them into a typed [`Config`].

use std::collections::HashMap;
use std::fmt;
use std::io::BufRead;
use std::time::Duration;

use clap::ValueEnum;
use url::Url;

use crate::error::{AdapterError, Result};
use crate::poll::PollPolicy;

/// Which remote service backs the block device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// OpenStack Glance image download (sequential stream)
    Openstack,
    /// oVirt image transfer through the imageio proxy (ranged requests)
    Ovirt,
}

impl Backend {
    pub fn name(&self) -> &'static str {
        match self {
            Backend::Openstack => "openstack",
            Backend::Ovirt => "ovirt",
        }
    }

    fn accepts(&self, key: &str) -> bool {
        match key {
            "endpoint_url" | "username" | "password" | "target_id" | "insecure" => true,
            "project_name" | "project_domain_name" | "user_domain_name" | "region" => {
                *self == Backend::Openstack
            }
            "poll_interval"
            | "poll_max_interval"
            | "poll_timeout"
            | "probe_inactivity_timeout"
            | "inactivity_timeout" => *self == Backend::Ovirt,
            _ => false,
        }
    }
}

/// Map the historical parameter names onto the canonical ones.
fn canonical_key(key: &str) -> &str {
    match key {
        "auth_url" | "url" => "endpoint_url",
        "image" | "disk" => "target_id",
        other => other,
    }
}

/// Resolve a password parameter the way block-device hosts conventionally do:
/// `-` reads one line from stdin, `+FILE` reads the file, anything else is literal.
pub fn read_password(value: &str) -> Result<String> {
    if value == "-" {
        let mut line = String::new();
        std::io::stdin().lock().read_line(&mut line)?;
        return Ok(line.trim_end_matches(['\r', '\n']).to_string());
    }
    if let Some(path) = value.strip_prefix('+') {
        let contents = std::fs::read_to_string(path)?;
        return Ok(contents.trim_end_matches(['\r', '\n']).to_string());
    }
    Ok(value.to_string())
}

/// Raw parameters collected before `config_complete`.
#[derive(Clone)]
pub struct Params {
    backend: Backend,
    values: HashMap<String, String>,
}

impl Params {
    pub fn new(backend: Backend) -> Self {
        Self {
            backend,
            values: HashMap::new(),
        }
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Record one parameter. Later values for the same key replace earlier ones.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let key = canonical_key(key);
        if !self.backend.accepts(key) {
            return Err(AdapterError::InvalidParameter {
                key: key.to_string(),
                reason: format!("unknown parameter for the {} backend", self.backend.name()),
            });
        }

        let value = if key == "password" {
            read_password(value)?
        } else {
            value.to_string()
        };
        self.values.insert(key.to_string(), value);
        Ok(())
    }

    fn required(&self, name: &'static str) -> Result<&str> {
        self.values
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
            .ok_or(AdapterError::MissingParameter { name })
    }

    fn optional(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Check required parameters in a fixed order and build the typed config.
    pub fn validate(&self) -> Result<Config> {
        let endpoint = self.required("endpoint_url")?;
        let username = self.required("username")?;
        let password = self.required("password")?;
        let target_id = self.required("target_id")?;

        let endpoint = Url::parse(endpoint).map_err(|e| AdapterError::InvalidParameter {
            key: "endpoint_url".into(),
            reason: e.to_string(),
        })?;

        let defaults = PollPolicy::default();
        let poll = PollPolicy {
            interval: self.seconds("poll_interval")?.unwrap_or(defaults.interval),
            max_interval: self
                .seconds("poll_max_interval")?
                .unwrap_or(defaults.max_interval),
            deadline: match self.optional("poll_timeout") {
                Some("none") => None,
                Some(_) => self.seconds("poll_timeout")?,
                None => defaults.deadline,
            },
        };

        Ok(Config {
            backend: self.backend,
            endpoint,
            username: username.to_string(),
            password: password.to_string(),
            target_id: target_id.to_string(),
            project_name: self.optional("project_name").map(str::to_string),
            project_domain_name: self
                .optional("project_domain_name")
                .unwrap_or("Default")
                .to_string(),
            user_domain_name: self
                .optional("user_domain_name")
                .unwrap_or("Default")
                .to_string(),
            region: self.optional("region").map(str::to_string),
            insecure: self.flag("insecure")?,
            poll,
            probe_inactivity_timeout: self.integer("probe_inactivity_timeout")?.unwrap_or(30),
            inactivity_timeout: self.integer("inactivity_timeout")?.unwrap_or(3600),
        })
    }

    fn invalid(key: &str, reason: impl fmt::Display) -> AdapterError {
        AdapterError::InvalidParameter {
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }

    fn seconds(&self, key: &str) -> Result<Option<Duration>> {
        let Some(raw) = self.optional(key) else {
            return Ok(None);
        };
        let secs: f64 = raw.parse().map_err(|e| Self::invalid(key, e))?;
        Duration::try_from_secs_f64(secs)
            .map(Some)
            .map_err(|e| Self::invalid(key, e))
    }

    fn integer(&self, key: &str) -> Result<Option<u64>> {
        self.optional(key)
            .map(|raw| raw.parse().map_err(|e| Self::invalid(key, e)))
            .transpose()
    }

    fn flag(&self, key: &str) -> Result<bool> {
        match self.optional(key) {
            None => Ok(false),
            Some("1" | "true" | "yes" | "on") => Ok(true),
            Some("0" | "false" | "no" | "off") => Ok(false),
            Some(other) => Err(Self::invalid(key, format!("expected a boolean, got {other:?}"))),
        }
    }

    /// Parameter summary safe to log: the password is never included.
    pub fn redacted(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<_> = self
            .values
            .iter()
            .map(|(k, v)| {
                let v = if k == "password" { "<redacted>".to_string() } else { v.clone() };
                (k.clone(), v)
            })
            .collect();
        pairs.sort();
        pairs
    }
}

impl fmt::Debug for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Params")
            .field("backend", &self.backend)
            .field("values", &self.redacted())
            .finish()
    }
}

/// Validated configuration.
#[derive(Clone)]
pub struct Config {
    pub backend: Backend,
    pub endpoint: Url,
    pub username: String,
    pub password: String,
    pub target_id: String,
    pub project_name: Option<String>,
    pub project_domain_name: String,
    pub user_domain_name: String,
    pub region: Option<String>,
    /// Accept invalid TLS certificates.
    pub insecure: bool,
    pub poll: PollPolicy,
    /// Inactivity timeout (seconds) of the transfer used only to learn the size.
    pub probe_inactivity_timeout: u64,
    /// Inactivity timeout (seconds) of the transfer serving reads.
    pub inactivity_timeout: u64,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("backend", &self.backend)
            .field("endpoint", &self.endpoint.as_str())
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("target_id", &self.target_id)
            .field("project_name", &self.project_name)
            .field("region", &self.region)
            .field("insecure", &self.insecure)
            .field("poll", &self.poll)
            .finish_non_exhaustive()
    }
}
