//! Session factory construction.
//!
//! A factory is built once from configuration and shared by every session
//! of the process. It owns the SeaORM connection pool; sessions borrow
//! handles from it.

use std::sync::Arc;
use std::time::Duration;

use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbBackend, DbErr};
use tracing::{debug, info};
use unitwork_shared::{ConfigLoader, OrmConfig, PersistError, PersistResult};

/// Long-lived factory of database sessions.
///
/// Cloning is cheap and every clone shares the same pool.
#[derive(Debug, Clone)]
pub struct SessionFactory {
    db: DatabaseConnection,
    config: Arc<OrmConfig>,
}

impl SessionFactory {
    /// Builds a factory from the default configuration resource, overridden
    /// by the given property lines.
    ///
    /// # Errors
    ///
    /// Returns `PersistError::Configuration` if the resource cannot be
    /// loaded, a property line is malformed, or the pool cannot be created.
    pub async fn build(properties: Option<&[String]>) -> PersistResult<Self> {
        let lines = properties.unwrap_or_default().iter().cloned();
        let loader = ConfigLoader::default().with_properties(lines);
        Self::build_with(&loader).await
    }

    /// Builds a factory from the default resource of the given loader.
    ///
    /// # Errors
    ///
    /// See [`SessionFactory::build`].
    pub async fn build_with(loader: &ConfigLoader) -> PersistResult<Self> {
        let config = loader.load_default()?;
        Self::connect(&config).await
    }

    /// Connects a factory from a resolved configuration.
    ///
    /// # Errors
    ///
    /// Returns `PersistError::Configuration` if the pool cannot be created.
    pub async fn connect(config: &OrmConfig) -> PersistResult<Self> {
        let db = Database::connect(connect_options(config))
            .await
            .map_err(|e| {
                PersistError::configuration(format!("unable to build session factory: {e}"))
            })?;

        info!(backend = ?db.get_database_backend(), "Session factory ready");

        Ok(Self {
            db,
            config: Arc::new(config.clone()),
        })
    }

    /// Returns the configuration the factory was built from.
    #[must_use]
    pub fn config(&self) -> &OrmConfig {
        &self.config
    }

    /// Returns the database backend behind the pool.
    #[must_use]
    pub fn backend(&self) -> DbBackend {
        self.db.get_database_backend()
    }

    /// Returns the shared pool for work that bypasses sessions.
    #[must_use]
    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Checks the pool is reachable and hands out a handle for one session.
    ///
    /// # Errors
    ///
    /// Returns the driver error if no pooled connection answers.
    pub async fn open_session(&self) -> Result<DatabaseConnection, DbErr> {
        self.db.ping().await?;
        debug!("Session opened");
        Ok(self.db.clone())
    }

    /// Closes the pool. Sessions still holding handles start failing.
    ///
    /// # Errors
    ///
    /// Returns `PersistError::Database` if the pool reports an error while
    /// shutting down.
    pub async fn close(self) -> PersistResult<()> {
        self.db
            .close()
            .await
            .map_err(|e| PersistError::Database(e.to_string()))
    }
}

/// Maps configuration onto SeaORM connect options.
#[must_use]
pub fn connect_options(config: &OrmConfig) -> ConnectOptions {
    let conn = &config.connection;
    let mut opt = ConnectOptions::new(conn.url.clone());
    opt.max_connections(conn.max_connections)
        .min_connections(conn.min_connections)
        .connect_timeout(Duration::from_secs(conn.connect_timeout_secs))
        .acquire_timeout(Duration::from_secs(conn.acquire_timeout_secs))
        .connect_lazy(conn.lazy)
        .sqlx_logging(config.show_sql);

    if let Some(secs) = conn.idle_timeout_secs {
        opt.idle_timeout(Duration::from_secs(secs));
    }
    if let Some(schema) = &config.default_schema {
        opt.set_schema_search_path(schema.clone());
    }

    opt
}

/// Infers the backend from a connection URL without connecting.
///
/// # Errors
///
/// Returns `PersistError::Configuration` for an unsupported scheme.
pub fn backend_for_url(url: &str) -> PersistResult<DbBackend> {
    let scheme = url.split(':').next().unwrap_or_default();
    match scheme {
        "postgres" | "postgresql" => Ok(DbBackend::Postgres),
        "mysql" | "mariadb" => Ok(DbBackend::MySql),
        "sqlite" => Ok(DbBackend::Sqlite),
        _ => Err(PersistError::configuration(format!(
            "unsupported database url scheme: {scheme}"
        ))),
    }
}
