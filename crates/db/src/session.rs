//! Session wrapper: one unit of work against the database.
//!
//! A [`DbSession`] is created empty, initialised from a [`SessionFactory`],
//! used for at most a few transaction cycles and then closed. Any error
//! raised by the database moves the session into a terminal failed state:
//! the transaction is rolled back, the connection handle is released and
//! every later call returns the same classified error.
//!
//! Writes issued outside an explicit transaction run inside an implicit
//! unit of work that [`DbSession::flush`] or [`DbSession::close`] commits.

use std::collections::HashSet;
use std::fmt;

use chrono::NaiveDateTime;
use sea_orm::sea_query::{IntoCondition, OnConflict};
use sea_orm::{
    ActiveModelBehavior, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection,
    DatabaseTransaction, DbBackend, DbErr, EntityTrait, FromQueryResult, IntoActiveModel, Iterable,
    PrimaryKeyToColumn, PrimaryKeyTrait, QueryFilter, Statement, TransactionTrait, Value,
};
use tracing::{debug, error, warn};
use unitwork_shared::{PersistError, PersistResult};

use crate::classify::classify;
use crate::entity::{
    CascadeDelete, EntityKey, EntityOf, ModelOf, VersionedEntity, primary_key_values,
};
use crate::factory::SessionFactory;
use crate::query::{ActiveQuery, CalendarDay, Criteria, NamedQuery};

enum Lifecycle {
    Uninitialized,
    Open(DatabaseConnection),
    Closed,
    Failed(PersistError),
}

struct UnitOfWork {
    txn: DatabaseTransaction,
    explicit: bool,
}

/// Single-use session over a pooled connection.
///
/// Not shareable between tasks: every operation takes `&mut self`.
pub struct DbSession {
    state: Lifecycle,
    work: Option<UnitOfWork>,
    dirty: bool,
    rolled_back: bool,
    query: Option<ActiveQuery>,
    attached: HashSet<EntityKey>,
}

impl Default for DbSession {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DbSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.state {
            Lifecycle::Uninitialized => "uninitialized",
            Lifecycle::Open(_) => "open",
            Lifecycle::Closed => "closed",
            Lifecycle::Failed(_) => "failed",
        };
        f.debug_struct("DbSession")
            .field("state", &state)
            .field("transaction_started", &self.transaction_started())
            .field("dirty", &self.dirty)
            .field("rolled_back", &self.rolled_back)
            .field("attached", &self.attached.len())
            .finish_non_exhaustive()
    }
}

impl DbSession {
    /// Creates an uninitialised session.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Lifecycle::Uninitialized,
            work: None,
            dirty: false,
            rolled_back: false,
            query: None,
            attached: HashSet::new(),
        }
    }

    /// Opens the session from a factory.
    ///
    /// # Errors
    ///
    /// Returns the classified error if no connection can be obtained; the
    /// session is then failed. Returns `PersistError::IllegalState` if the
    /// session was already closed.
    pub async fn init(&mut self, factory: &SessionFactory) -> PersistResult<()> {
        match &self.state {
            Lifecycle::Uninitialized => {}
            Lifecycle::Open(_) => return Err(PersistError::illegal_state("session already open")),
            Lifecycle::Closed => return Err(PersistError::illegal_state("session is closed")),
            Lifecycle::Failed(err) => return Err(err.clone()),
        }

        match factory.open_session().await {
            Ok(conn) => {
                self.state = Lifecycle::Open(conn);
                debug!("Session initialised");
                Ok(())
            }
            Err(err) => Err(self.fail(err).await),
        }
    }

    /// Whether the session holds an open connection.
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self.state, Lifecycle::Open(_))
    }

    /// The stored error of a failed session.
    #[must_use]
    pub fn failure(&self) -> Option<&PersistError> {
        match &self.state {
            Lifecycle::Failed(err) => Some(err),
            _ => None,
        }
    }

    /// Whether an explicit transaction is active.
    #[must_use]
    pub fn transaction_started(&self) -> bool {
        self.work.as_ref().is_some_and(|work| work.explicit)
    }

    /// Whether [`DbSession::rollback`] has been called since the last
    /// [`DbSession::begin_transaction`].
    #[must_use]
    pub fn rolled_back(&self) -> bool {
        self.rolled_back
    }

    /// Whether writes were issued that are not yet flushed or committed.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Whether the entity is attached to this session.
    #[must_use]
    pub fn contains<T: VersionedEntity>(&self, entity: &T) -> bool {
        EntityKey::of_active_model(&entity.active_model())
            .is_some_and(|key| self.attached.contains(&key))
    }

    /// Starts an explicit transaction.
    ///
    /// Pending implicit work becomes part of the new transaction.
    ///
    /// # Errors
    ///
    /// Returns `PersistError::IllegalState` if a transaction is already
    /// active, or the stored error of a failed session.
    pub async fn begin_transaction(&mut self) -> PersistResult<()> {
        self.ensure_usable()?;

        if let Some(work) = &mut self.work {
            if work.explicit {
                return Err(PersistError::illegal_state("transaction already started"));
            }
            work.explicit = true;
            self.rolled_back = false;
            debug!("Unit of work promoted to transaction");
            return Ok(());
        }

        let begun = self.connection()?.begin().await;
        match begun {
            Ok(txn) => {
                self.work = Some(UnitOfWork {
                    txn,
                    explicit: true,
                });
                self.rolled_back = false;
                debug!("Transaction started");
                Ok(())
            }
            Err(err) => Err(self.fail(err).await),
        }
    }

    /// Commits the explicit transaction. A no-op without one.
    ///
    /// # Errors
    ///
    /// Returns `PersistError::StaleState` for a concurrency conflict, any
    /// other classified error if the commit fails, or the stored error of a
    /// failed session.
    pub async fn commit(&mut self) -> PersistResult<()> {
        self.ensure_usable()?;

        match self.work.take() {
            Some(work) if work.explicit => {
                let result = work.txn.commit().await;
                self.settle(result).await?;
                self.dirty = false;
                debug!("Transaction committed");
            }
            other => self.work = other,
        }

        Ok(())
    }

    /// Rolls back pending work, explicit or implicit, and detaches every
    /// entity.
    ///
    /// A second call finds no pending work and only keeps the rolled-back
    /// flag set.
    ///
    /// # Errors
    ///
    /// Returns the classified error if the rollback fails, or the stored
    /// error of a failed session.
    pub async fn rollback(&mut self) -> PersistResult<()> {
        self.ensure_usable()?;

        let result = match self.work.take() {
            Some(work) => {
                debug!(explicit = work.explicit, "Rolling back unit of work");
                work.txn.rollback().await
            }
            None => Ok(()),
        };
        self.attached.clear();
        self.dirty = false;
        self.rolled_back = true;

        self.settle(result).await
    }

    /// Commits the implicit unit of work.
    ///
    /// Inside an explicit transaction statements have already been sent, so
    /// only the dirty flag is reset.
    ///
    /// # Errors
    ///
    /// Returns the classified error if the commit fails, or the stored error
    /// of a failed session.
    pub async fn flush(&mut self) -> PersistResult<()> {
        self.ensure_usable()?;

        match self.work.take() {
            Some(work) if !work.explicit => {
                let result = work.txn.commit().await;
                self.settle(result).await?;
                debug!("Unit of work flushed");
            }
            other => self.work = other,
        }
        self.dirty = false;

        Ok(())
    }

    /// Detaches every entity and discards unflushed implicit work.
    ///
    /// # Errors
    ///
    /// Returns the classified error if discarding fails, or the stored error
    /// of a failed session.
    pub async fn clear(&mut self) -> PersistResult<()> {
        self.ensure_usable()?;
        self.attached.clear();

        match self.work.take() {
            Some(work) if !work.explicit => {
                let result = work.txn.rollback().await;
                self.settle(result).await?;
                self.dirty = false;
            }
            other => self.work = other,
        }

        Ok(())
    }

    /// Detaches one entity.
    ///
    /// # Errors
    ///
    /// Returns the stored error of a failed session.
    pub fn evict<T: VersionedEntity>(&mut self, entity: &T) -> PersistResult<()> {
        self.ensure_usable()?;
        if let Some(key) = EntityKey::of_active_model(&entity.active_model()) {
            self.attached.remove(&key);
        }
        Ok(())
    }

    /// Ends the session.
    ///
    /// Pending work is committed unless the session was rolled back. The
    /// connection handle is released even when the commit fails; that
    /// failure is returned afterwards. Closing a session that is not open
    /// does nothing.
    ///
    /// # Errors
    ///
    /// Returns the classified error of a failed final commit.
    pub async fn close(&mut self) -> PersistResult<()> {
        let conn = match std::mem::replace(&mut self.state, Lifecycle::Closed) {
            Lifecycle::Open(conn) => conn,
            other => {
                self.state = other;
                return Ok(());
            }
        };

        let mut deferred = None;
        if let Some(work) = self.work.take() {
            if !self.rolled_back && (work.explicit || self.dirty) {
                if let Err(err) = work.txn.commit().await {
                    deferred = Some(err);
                }
            } else if let Err(err) = work.txn.rollback().await {
                warn!(error = %err, "Discarding unit of work on close failed");
            }
        }

        self.query = None;
        self.attached.clear();
        self.dirty = false;
        drop(conn);

        match deferred {
            None => {
                debug!("Session closed");
                Ok(())
            }
            Some(err) => {
                let classified = classify(&err);
                error!(error = %err, code = classified.error_code(), "Commit on close failed");
                self.state = Lifecycle::Failed(classified.clone());
                Err(classified)
            }
        }
    }

    /// Reads the database clock.
    ///
    /// # Errors
    ///
    /// Returns the classified error if the query fails, or the stored error
    /// of a failed session.
    pub async fn current_timestamp(&mut self) -> PersistResult<NaiveDateTime> {
        let backend = self.backend()?;
        let sql = match backend {
            DbBackend::Postgres => "SELECT CAST(CURRENT_TIMESTAMP AS TIMESTAMP) AS now",
            _ => "SELECT CURRENT_TIMESTAMP AS now",
        };

        let result = read_clock(self.work().await?, Statement::from_string(backend, sql)).await;
        self.settle(result).await
    }

    /// Inserts a new entity.
    ///
    /// Runs the `before_save` hook, attaches the entity and deletes the
    /// dependents it reports.
    ///
    /// # Errors
    ///
    /// Returns the classified error if a statement fails, or the stored
    /// error of a failed session.
    pub async fn save<T>(&mut self, entity: &mut T) -> PersistResult<ModelOf<T::ActiveModel>>
    where
        T: VersionedEntity,
        ModelOf<T::ActiveModel>: IntoActiveModel<T::ActiveModel>,
    {
        self.ensure_usable()?;
        entity.before_save();

        let result = entity.active_model().insert(self.work().await?).await;
        let model = self.settle(result).await?;
        self.written(EntityKey::of_model(&model));

        self.cascade(entity.take_deleted_entities()).await?;
        Ok(model)
    }

    /// Updates an existing entity.
    ///
    /// # Errors
    ///
    /// Returns `PersistError::IllegalState` when the entity's primary key is
    /// unset, `PersistError::StaleState` when no row matches it, any other
    /// classified error if a statement fails, or the stored error of a
    /// failed session.
    pub async fn update<T>(&mut self, entity: &mut T) -> PersistResult<ModelOf<T::ActiveModel>>
    where
        T: VersionedEntity,
        ModelOf<T::ActiveModel>: IntoActiveModel<T::ActiveModel>,
    {
        self.ensure_usable()?;
        entity.before_save();

        let model = entity.active_model();
        if primary_key_values(&model).is_none() {
            return Err(PersistError::illegal_state("entity has no primary key value"));
        }

        let result = model.update(self.work().await?).await;
        let model = self.settle(result).await?;
        self.written(EntityKey::of_model(&model));

        self.cascade(entity.take_deleted_entities()).await?;
        Ok(model)
    }

    /// Updates the row with the entity's primary key, or inserts it when no
    /// such row exists.
    ///
    /// # Errors
    ///
    /// Returns the classified error if a statement fails, or the stored
    /// error of a failed session.
    pub async fn merge<T>(&mut self, entity: &mut T) -> PersistResult<ModelOf<T::ActiveModel>>
    where
        T: VersionedEntity,
        ModelOf<T::ActiveModel>: IntoActiveModel<T::ActiveModel>,
    {
        self.ensure_usable()?;
        entity.before_save();

        let result = merge_row(self.work().await?, entity.active_model()).await;
        let model = self.settle(result).await?;
        self.written(EntityKey::of_model(&model));

        self.cascade(entity.take_deleted_entities()).await?;
        Ok(model)
    }

    /// Inserts the entity when its primary key is unset, updates it
    /// otherwise.
    ///
    /// # Errors
    ///
    /// Returns the classified error if a statement fails, or the stored
    /// error of a failed session.
    pub async fn save_or_update<T>(&mut self, entity: &mut T) -> PersistResult<T::ActiveModel>
    where
        T: VersionedEntity,
        ModelOf<T::ActiveModel>: IntoActiveModel<T::ActiveModel>,
    {
        self.ensure_usable()?;
        entity.before_save();

        let result = entity.active_model().save(self.work().await?).await;
        let saved = self.settle(result).await?;
        if let Some(key) = EntityKey::of_active_model(&saved) {
            self.written(key);
        } else {
            self.dirty = true;
        }

        self.cascade(entity.take_deleted_entities()).await?;
        Ok(saved)
    }

    /// Deletes an entity, then its dependents.
    ///
    /// # Errors
    ///
    /// Returns `PersistError::IllegalState` when the entity's primary key is
    /// unset, `PersistError::StaleState` when the row is already gone, any
    /// other classified error if a statement fails, or the stored error of a
    /// failed session.
    pub async fn delete<T: VersionedEntity>(&mut self, entity: &mut T) -> PersistResult<()> {
        self.ensure_usable()?;
        entity.before_deletion();

        let model = entity.active_model();
        let Some(key) = EntityKey::of_active_model(&model) else {
            return Err(PersistError::illegal_state("entity has no primary key value"));
        };
        self.attached.remove(&key);

        let result = model.delete(self.work().await?).await;
        let outcome = self.settle(result).await?;
        if outcome.rows_affected == 0 {
            return Err(self.fail(DbErr::RecordNotUpdated).await);
        }
        self.dirty = true;

        self.cascade(entity.take_deleted_entities()).await
    }

    /// Loads an entity by primary key and attaches it.
    ///
    /// # Errors
    ///
    /// Returns the classified error if the query fails, or the stored error
    /// of a failed session.
    pub async fn get<E: EntityTrait>(
        &mut self,
        id: impl Into<<E::PrimaryKey as PrimaryKeyTrait>::ValueType>,
    ) -> PersistResult<Option<E::Model>> {
        self.ensure_usable()?;

        let result = E::find_by_id(id).one(self.work().await?).await;
        let found = self.settle(result).await?;
        if let Some(model) = &found {
            self.attached.insert(EntityKey::of_model(model));
        }
        Ok(found)
    }

    /// Inserts the entity unless a row with its primary key already exists.
    ///
    /// Used to replay rows exported from another database.
    ///
    /// # Errors
    ///
    /// Returns the classified error if the insert fails, or the stored error
    /// of a failed session.
    pub async fn restore<T: VersionedEntity>(&mut self, entity: &T) -> PersistResult<()> {
        self.ensure_usable()?;

        let model = entity.active_model();
        let key = EntityKey::of_active_model(&model);
        let columns = <EntityOf<T::ActiveModel> as EntityTrait>::PrimaryKey::iter()
            .map(PrimaryKeyToColumn::into_column);

        let result = EntityOf::<T::ActiveModel>::insert(model)
            .on_conflict(OnConflict::columns(columns).do_nothing().to_owned())
            .exec(self.work().await?)
            .await;

        match result {
            Ok(_) | Err(DbErr::RecordNotInserted) => {}
            Err(err) => return Err(self.fail(err).await),
        }

        match key {
            Some(key) => self.written(key),
            None => self.dirty = true,
        }
        Ok(())
    }

    /// Replaces the active query with SQL using `:name` placeholders.
    ///
    /// # Errors
    ///
    /// Returns the stored error of a failed session.
    pub fn create_query(&mut self, sql: impl Into<String>) -> PersistResult<()> {
        self.ensure_usable()?;
        self.query = Some(ActiveQuery::Named(NamedQuery::new(sql)));
        Ok(())
    }

    /// Replaces the active query with a select over every column of `E`.
    ///
    /// # Errors
    ///
    /// Returns the stored error of a failed session.
    pub fn create_criteria<E: EntityTrait>(&mut self) -> PersistResult<()> {
        self.ensure_usable()?;
        self.query = Some(ActiveQuery::Criteria(Criteria::new::<E>()));
        Ok(())
    }

    /// Adds a restriction to the active criteria.
    ///
    /// # Errors
    ///
    /// Returns `PersistError::IllegalState` when the active query is not a
    /// criteria, or the stored error of a failed session.
    pub fn restrict(&mut self, condition: impl IntoCondition) -> PersistResult<()> {
        match self.active_query()? {
            ActiveQuery::Criteria(criteria) => {
                criteria.restrict(condition);
                Ok(())
            }
            ActiveQuery::Named(_) => Err(PersistError::illegal_state(
                "restrictions apply to criteria only",
            )),
        }
    }

    /// Binds a string parameter.
    ///
    /// # Errors
    ///
    /// Returns `PersistError::IllegalState` without an active named query,
    /// or the stored error of a failed session.
    pub fn set_string(&mut self, name: &str, value: &str) -> PersistResult<()> {
        self.named_query()?.bind(name, value);
        Ok(())
    }

    /// Binds a 32-bit integer parameter.
    ///
    /// # Errors
    ///
    /// See [`DbSession::set_string`].
    pub fn set_int(&mut self, name: &str, value: i32) -> PersistResult<()> {
        self.named_query()?.bind(name, value);
        Ok(())
    }

    /// Binds a 64-bit integer parameter.
    ///
    /// # Errors
    ///
    /// See [`DbSession::set_string`].
    pub fn set_long(&mut self, name: &str, value: i64) -> PersistResult<()> {
        self.named_query()?.bind(name, value);
        Ok(())
    }

    /// Binds a boolean parameter.
    ///
    /// # Errors
    ///
    /// See [`DbSession::set_string`].
    pub fn set_bool(&mut self, name: &str, value: bool) -> PersistResult<()> {
        self.named_query()?.bind(name, value);
        Ok(())
    }

    /// Binds a binary parameter.
    ///
    /// # Errors
    ///
    /// See [`DbSession::set_string`].
    pub fn set_bytes(&mut self, name: &str, value: Vec<u8>) -> PersistResult<()> {
        self.named_query()?.bind(name, value);
        Ok(())
    }

    /// Binds the primary key of an entity.
    ///
    /// # Errors
    ///
    /// Returns `PersistError::IllegalState` if the entity's key is unset or
    /// spans several columns, without an active named query, or the stored
    /// error of a failed session.
    pub fn set_entity<T: VersionedEntity>(&mut self, name: &str, entity: &T) -> PersistResult<()> {
        let query = self.named_query()?;
        let mut key = primary_key_values(&entity.active_model())
            .ok_or_else(|| PersistError::illegal_state("entity has no primary key value"))?;
        if key.len() != 1 {
            return Err(PersistError::illegal_state(
                "composite primary keys cannot be bound as one parameter",
            ));
        }
        if let Some((_, value)) = key.pop() {
            query.bind(name, value);
        }
        Ok(())
    }

    /// Binds the calendar day of `when`, discarding any time of day.
    ///
    /// # Errors
    ///
    /// See [`DbSession::set_string`].
    pub fn set_date(&mut self, name: &str, when: &impl CalendarDay) -> PersistResult<()> {
        self.named_query()?.bind_date(name, when);
        Ok(())
    }

    /// Binds any value SeaORM can encode.
    ///
    /// # Errors
    ///
    /// See [`DbSession::set_string`].
    pub fn set_parameter(&mut self, name: &str, value: impl Into<Value>) -> PersistResult<()> {
        self.named_query()?.bind(name, value);
        Ok(())
    }

    /// Binds a list of values for an `IN (:name)` clause.
    ///
    /// # Errors
    ///
    /// See [`DbSession::set_string`].
    pub fn set_parameter_list<I, V>(&mut self, name: &str, values: I) -> PersistResult<()>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.named_query()?.bind_list(name, values);
        Ok(())
    }

    /// Skips the first `first` rows of the result.
    ///
    /// # Errors
    ///
    /// Returns `PersistError::IllegalState` without an active query, or the
    /// stored error of a failed session.
    pub fn set_first_result(&mut self, first: u64) -> PersistResult<()> {
        self.active_query()?.set_first_result(first);
        Ok(())
    }

    /// Limits the result to `max` rows.
    ///
    /// # Errors
    ///
    /// See [`DbSession::set_first_result`].
    pub fn set_max_results(&mut self, max: u64) -> PersistResult<()> {
        self.active_query()?.set_max_results(max);
        Ok(())
    }

    /// Runs the active query and maps every row.
    ///
    /// # Errors
    ///
    /// Returns `PersistError::IllegalState` without an active query or with
    /// an unbound parameter, the classified error if the query fails, or the
    /// stored error of a failed session.
    pub async fn list<M: FromQueryResult>(&mut self) -> PersistResult<Vec<M>> {
        let stmt = self.prepared_statement()?;
        let result = M::find_by_statement(stmt).all(self.work().await?).await;
        self.settle(result).await
    }

    /// Runs the active query expecting at most one row.
    ///
    /// # Errors
    ///
    /// Returns `PersistError::Database` if more than one row comes back;
    /// otherwise as [`DbSession::list`].
    pub async fn unique<M: FromQueryResult>(&mut self) -> PersistResult<Option<M>> {
        let mut rows = self.list::<M>().await?;
        if rows.len() > 1 {
            let err = DbErr::Custom(format!(
                "query returned {} rows where at most one was expected",
                rows.len()
            ));
            return Err(self.fail(err).await);
        }
        Ok(rows.pop())
    }

    /// Executes the active named query as a write and returns the number of
    /// rows affected.
    ///
    /// # Errors
    ///
    /// Returns `PersistError::IllegalState` when the active query is a
    /// criteria; otherwise as [`DbSession::list`].
    pub async fn execute_update(&mut self) -> PersistResult<u64> {
        if let ActiveQuery::Criteria(_) = self.active_query()? {
            return Err(PersistError::illegal_state("a criteria cannot be executed as an update"));
        }

        let stmt = self.prepared_statement()?;
        let result = self.work().await?.execute(stmt).await;
        let outcome = self.settle(result).await?;
        self.dirty = true;
        Ok(outcome.rows_affected())
    }

    fn ensure_usable(&self) -> PersistResult<()> {
        self.connection().map(|_| ())
    }

    fn connection(&self) -> PersistResult<&DatabaseConnection> {
        match &self.state {
            Lifecycle::Open(conn) => Ok(conn),
            Lifecycle::Failed(err) => Err(err.clone()),
            Lifecycle::Uninitialized => Err(PersistError::illegal_state("session not initialised")),
            Lifecycle::Closed => Err(PersistError::illegal_state("session is closed")),
        }
    }

    fn backend(&self) -> PersistResult<DbBackend> {
        Ok(self.connection()?.get_database_backend())
    }

    fn active_query(&mut self) -> PersistResult<&mut ActiveQuery> {
        self.ensure_usable()?;
        self.query
            .as_mut()
            .ok_or_else(|| PersistError::illegal_state("no active query"))
    }

    fn named_query(&mut self) -> PersistResult<&mut NamedQuery> {
        self.active_query()?.named_mut()
    }

    fn prepared_statement(&mut self) -> PersistResult<Statement> {
        let backend = self.backend()?;
        self.active_query()?.to_statement(backend)
    }

    /// The transaction statements run in, begun on first use.
    async fn work(&mut self) -> PersistResult<&DatabaseTransaction> {
        if self.work.is_none() {
            let begun = self.connection()?.begin().await;
            match begun {
                Ok(txn) => {
                    debug!("Unit of work started");
                    self.work = Some(UnitOfWork {
                        txn,
                        explicit: false,
                    });
                }
                Err(err) => return Err(self.fail(err).await),
            }
        }

        self.ensure_usable()?;
        self.work
            .as_ref()
            .map(|work| &work.txn)
            .ok_or_else(|| PersistError::illegal_state("no unit of work"))
    }

    fn written(&mut self, key: EntityKey) {
        self.attached.insert(key);
        self.dirty = true;
    }

    /// Deletes reported dependents depth first, each before its own
    /// dependents.
    async fn cascade(&mut self, dependents: Vec<Box<dyn CascadeDelete>>) -> PersistResult<()> {
        let backend = self.backend()?;
        let mut pending: Vec<_> = dependents.into_iter().rev().collect();

        while let Some(mut entity) = pending.pop() {
            // The owning write already went out, so a keyless dependent
            // fails the whole unit of work.
            let Some(key) = entity.cascade_key() else {
                let err = PersistError::illegal_state("cascaded entity has no primary key value");
                return Err(self.abort(err).await);
            };
            self.attached.remove(&key);
            entity.prepare_deletion();

            let Some(stmt) = entity.delete_statement(backend) else {
                let err = PersistError::illegal_state("cascaded entity has no primary key value");
                return Err(self.abort(err).await);
            };
            let result = self.work().await?.execute(stmt).await;
            let outcome = self.settle(result).await?;
            if outcome.rows_affected() == 0 {
                return Err(self.fail(DbErr::RecordNotUpdated).await);
            }
            self.dirty = true;
            debug!(entity = %key, "Cascade delete");

            pending.extend(entity.take_cascade().into_iter().rev());
        }

        Ok(())
    }

    async fn settle<T>(&mut self, result: Result<T, DbErr>) -> PersistResult<T> {
        match result {
            Ok(value) => Ok(value),
            Err(err) => Err(self.fail(err).await),
        }
    }

    /// Moves the session into its terminal failed state.
    async fn fail(&mut self, err: DbErr) -> PersistError {
        let classified = classify(&err);
        error!(error = %err, code = classified.error_code(), "Session failed");
        self.discard(classified).await
    }

    async fn abort(&mut self, err: PersistError) -> PersistError {
        error!(error = %err, code = err.error_code(), "Session failed");
        self.discard(err).await
    }

    async fn discard(&mut self, classified: PersistError) -> PersistError {
        if let Some(work) = self.work.take() {
            if let Err(rollback) = work.txn.rollback().await {
                warn!(error = %rollback, "Rollback after failure failed");
            }
        }

        self.query = None;
        self.attached.clear();
        self.dirty = false;
        self.state = Lifecycle::Failed(classified.clone());

        classified
    }
}

async fn merge_row<A>(txn: &DatabaseTransaction, model: A) -> Result<ModelOf<A>, DbErr>
where
    A: ActiveModelTrait + ActiveModelBehavior + Send + Sync + 'static,
    ModelOf<A>: IntoActiveModel<A>,
{
    let Some(key) = primary_key_values(&model) else {
        return model.insert(txn).await;
    };

    let mut existing = <A::Entity as EntityTrait>::find();
    for (column, value) in key {
        existing = existing.filter(column.eq(value));
    }

    if existing.one(txn).await?.is_some() {
        model.update(txn).await
    } else {
        model.insert(txn).await
    }
}

async fn read_clock(txn: &DatabaseTransaction, stmt: Statement) -> Result<NaiveDateTime, DbErr> {
    let row = txn
        .query_one(stmt)
        .await?
        .ok_or_else(|| DbErr::RecordNotFound("database clock returned no row".to_string()))?;
    row.try_get::<NaiveDateTime>("", "now")
}
