//! Mapper configuration management.
//!
//! A configuration starts from a named resource found on a search path and
//! is then overridden by runtime property lines. The result is an immutable
//! [`OrmConfig`].

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use crate::error::{PersistError, PersistResult};
use crate::properties::parse_property_lines;

/// Name of the resource loaded when the caller does not pick one.
pub const DEFAULT_RESOURCE: &str = "orm.toml";

/// Mapper configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OrmConfig {
    /// Connection pool configuration.
    pub connection: ConnectionConfig,
    /// Log every statement the driver executes.
    #[serde(default)]
    pub show_sql: bool,
    /// Schema search path applied to new connections (Postgres only).
    #[serde(default)]
    pub default_schema: Option<String>,
}

/// Connection pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConnectionConfig {
    /// Database connection URL.
    pub url: String,
    /// Maximum number of connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool.
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Seconds to wait when opening a connection.
    #[serde(default = "default_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Seconds to wait for a pooled connection.
    #[serde(default = "default_timeout_secs")]
    pub acquire_timeout_secs: u64,
    /// Seconds a connection may sit idle before it is closed.
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,
    /// Defer connecting until the first session is opened.
    #[serde(default)]
    pub lazy: bool,
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_timeout_secs() -> u64 {
    30
}

impl OrmConfig {
    /// Builds a configuration from property lines alone.
    ///
    /// # Errors
    ///
    /// Returns `PersistError::Configuration` if a line is malformed or a
    /// required key (such as `connection.url`) is missing.
    pub fn from_properties<I, S>(lines: I) -> PersistResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let builder = apply_properties(config::Config::builder(), lines)?;
        Ok(builder.build()?.try_deserialize()?)
    }
}

/// Ordered list of directories searched for configuration resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLocator {
    roots: Vec<PathBuf>,
}

impl Default for ResourceLocator {
    fn default() -> Self {
        Self::new([PathBuf::from("."), PathBuf::from("config")])
    }
}

impl ResourceLocator {
    /// Creates a locator over the given roots, searched in order.
    pub fn new<I, P>(roots: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            roots: roots.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns the search roots.
    #[must_use]
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Resolves a resource name to the first existing file under a root.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        self.roots
            .iter()
            .map(|root| root.join(name))
            .find(|candidate| candidate.is_file())
    }
}

/// Loads [`OrmConfig`] from a resource plus runtime property lines.
///
/// The loader holds no mutable state, so one instance can be shared across
/// threads and every call with the same inputs yields the same result.
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    locator: ResourceLocator,
    properties: Vec<String>,
}

impl ConfigLoader {
    /// Creates a loader searching the given locator.
    #[must_use]
    pub fn new(locator: ResourceLocator) -> Self {
        Self {
            locator,
            properties: Vec::new(),
        }
    }

    /// Sets the property lines merged over every loaded resource.
    #[must_use]
    pub fn with_properties<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.properties = lines.into_iter().map(Into::into).collect();
        self
    }

    /// Returns the locator used for resolution.
    #[must_use]
    pub fn locator(&self) -> &ResourceLocator {
        &self.locator
    }

    /// Loads the default resource, [`DEFAULT_RESOURCE`].
    ///
    /// # Errors
    ///
    /// See [`ConfigLoader::load`].
    pub fn load_default(&self) -> PersistResult<OrmConfig> {
        self.load(DEFAULT_RESOURCE)
    }

    /// Resolves `name` on the search path and loads it.
    ///
    /// # Errors
    ///
    /// Returns `PersistError::Configuration` if the resource cannot be found,
    /// cannot be parsed, or a property line is malformed.
    pub fn load(&self, name: &str) -> PersistResult<OrmConfig> {
        let path = self.locator.resolve(name).ok_or_else(|| {
            PersistError::configuration(format!(
                "unable to locate {name} in {:?}",
                self.locator.roots()
            ))
        })?;

        self.load_file(&path)
    }

    /// Loads a configuration file directly, skipping resolution.
    ///
    /// # Errors
    ///
    /// Returns `PersistError::Configuration` if the file cannot be read or
    /// parsed, or a property line is malformed.
    pub fn load_file(&self, path: &Path) -> PersistResult<OrmConfig> {
        debug!(path = %path.display(), "loading mapper configuration");

        let builder = config::Config::builder().add_source(config::File::from(path).required(true));
        let builder = apply_properties(builder, &self.properties)?;

        Ok(builder.build()?.try_deserialize()?)
    }
}

fn apply_properties<I, S>(
    mut builder: config::ConfigBuilder<config::builder::DefaultState>,
    lines: I,
) -> PersistResult<config::ConfigBuilder<config::builder::DefaultState>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    for (key, value) in parse_property_lines(lines)? {
        builder = builder.set_override(key, value)?;
    }
    Ok(builder)
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
