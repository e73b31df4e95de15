//! Schema export: DDL for registered entities, written to a script and/or
//! applied to a live database.

use std::path::Path;
use std::time::Instant;

use sea_orm::sea_query::{Alias, Table, TableCreateStatement};
use sea_orm::{ConnectionTrait, Database, DbBackend, EntityName, EntityTrait, Schema, Statement};
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};
use unitwork_shared::{ConfigLoader, PersistError, PersistResult};

use crate::factory::{backend_for_url, connect_options};

/// Report lines collected during an export.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InfoLines {
    lines: Vec<String>,
}

impl InfoLines {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a line terminated by a newline.
    pub fn add_ln(&mut self, line: impl Into<String>) {
        let mut line = line.into();
        line.push('\n');
        self.lines.push(line);
    }

    /// Appends text as is.
    pub fn add(&mut self, text: impl Into<String>) {
        self.lines.push(text.into());
    }

    /// Returns the collected entries.
    #[must_use]
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Whether any entry contains `needle`.
    #[must_use]
    pub fn contains(&self, needle: &str) -> bool {
        self.lines.iter().any(|line| line.contains(needle))
    }
}

struct RegisteredEntity {
    table: String,
    create: fn(DbBackend) -> TableCreateStatement,
}

/// Mapping metadata: the entities whose tables make up the schema.
#[derive(Default)]
pub struct SchemaMetadata {
    entities: Vec<RegisteredEntity>,
}

impl std::fmt::Debug for SchemaMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaMetadata")
            .field("tables", &self.table_names())
            .finish()
    }
}

impl SchemaMetadata {
    /// Creates empty metadata.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an entity. Tables are created in registration order and
    /// dropped in reverse, so register referenced tables first.
    #[must_use]
    pub fn register<E: EntityTrait>(mut self) -> Self {
        self.entities.push(RegisteredEntity {
            table: E::default().table_name().to_string(),
            create: create_table::<E>,
        });
        self
    }

    /// Returns the registered table names in registration order.
    #[must_use]
    pub fn table_names(&self) -> Vec<&str> {
        self.entities.iter().map(|e| e.table.as_str()).collect()
    }

    /// `CREATE TABLE` statements in registration order.
    #[must_use]
    pub fn create_statements(&self, backend: DbBackend) -> Vec<Statement> {
        self.entities
            .iter()
            .map(|e| backend.build(&(e.create)(backend)))
            .collect()
    }

    /// `DROP TABLE IF EXISTS` statements in reverse registration order.
    #[must_use]
    pub fn drop_statements(&self, backend: DbBackend) -> Vec<Statement> {
        self.entities
            .iter()
            .rev()
            .map(|e| {
                let mut drop = Table::drop();
                drop.table(Alias::new(e.table.as_str())).if_exists();
                backend.build(&drop)
            })
            .collect()
    }
}

fn create_table<E: EntityTrait>(backend: DbBackend) -> TableCreateStatement {
    Schema::new(backend).create_table_from_entity(E::default())
}

/// Drives a schema export and reports into an [`InfoLines`] buffer.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchemaExport;

impl SchemaExport {
    /// Drops and recreates every registered table.
    ///
    /// The script goes to `out_file` when given; statements run against the
    /// configured database when `export` is set. A failing statement is
    /// reported and skipped. Failures never propagate: they are appended to
    /// `info` and `false` is returned.
    pub async fn execute(
        info: &mut InfoLines,
        out_file: Option<&Path>,
        export: bool,
        loader: &ConfigLoader,
        metadata: &SchemaMetadata,
    ) -> bool {
        info.add_ln("Started export of schema");
        let started = Instant::now();

        let outcome = run(info, out_file, export, loader, metadata).await;

        let succeeded = match outcome {
            Ok(()) => {
                let elapsed = started.elapsed().as_secs();
                info.add_ln(format!("Elapsed time: {}:{:02}", elapsed / 60, elapsed % 60));
                true
            }
            Err(err) => {
                error!(error = %err, "Schema export failed");
                info.add_ln(format!("Schema export failed: {err}"));
                false
            }
        };

        info.add_ln("Schema build completed");
        succeeded
    }
}

async fn run(
    info: &mut InfoLines,
    out_file: Option<&Path>,
    export: bool,
    loader: &ConfigLoader,
    metadata: &SchemaMetadata,
) -> PersistResult<()> {
    let config = loader.load_default()?;
    let backend = backend_for_url(&config.connection.url)?;

    let statements: Vec<Statement> = metadata
        .drop_statements(backend)
        .into_iter()
        .chain(metadata.create_statements(backend))
        .collect();
    info!(count = statements.len(), ?backend, "Schema statements built");

    if let Some(path) = out_file {
        write_script(path, &statements).await?;
        info.add_ln(format!("Script written to {}", path.display()));
    }

    if export {
        let db = Database::connect(connect_options(&config))
            .await
            .map_err(|e| {
                PersistError::configuration(format!("unable to connect for export: {e}"))
            })?;

        let mut applied = 0usize;
        for stmt in &statements {
            match db.execute(stmt.clone()).await {
                Ok(_) => applied += 1,
                Err(err) => {
                    warn!(error = %err, sql = %stmt.sql, "Schema statement failed");
                    info.add_ln(format!("Statement failed: {}: {err}", stmt.sql));
                }
            }
        }
        info.add_ln(format!("Applied {applied} of {} statements", statements.len()));

        if let Err(err) = db.close().await {
            warn!(error = %err, "Closing export connection failed");
        }
    }

    Ok(())
}

async fn write_script(path: &Path, statements: &[Statement]) -> PersistResult<()> {
    let mut script = String::new();
    for stmt in statements {
        script.push_str(&stmt.sql);
        script.push_str(";\n");
    }

    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| PersistError::Database(format!("cannot create {}: {e}", path.display())))?;
    file.write_all(script.as_bytes())
        .await
        .map_err(|e| PersistError::Database(format!("cannot write {}: {e}", path.display())))?;
    file.flush()
        .await
        .map_err(|e| PersistError::Database(format!("cannot write {}: {e}", path.display())))
}
