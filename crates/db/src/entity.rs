//! Entity capabilities the session relies on.
//!
//! Anything persisted through a [`DbSession`](crate::DbSession) implements
//! [`VersionedEntity`]: it hands out a SeaORM active model, may react to the
//! save and delete lifecycle, and may report dependent sub-entities that must
//! be deleted alongside it. Sub-entities of any type travel as
//! `Box<dyn CascadeDelete>`.

use std::fmt;

use sea_orm::{
    ActiveModelBehavior, ActiveModelTrait, DbBackend, EntityName, EntityTrait, Iterable,
    ModelTrait, PrimaryKeyToColumn, QueryTrait, Statement, Value,
};

/// The entity an active model belongs to.
pub type EntityOf<A> = <A as ActiveModelTrait>::Entity;

/// The model type persisted for an active model.
pub type ModelOf<A> = <<A as ActiveModelTrait>::Entity as EntityTrait>::Model;

/// The column type of an active model's entity.
pub type ColumnOf<A> = <<A as ActiveModelTrait>::Entity as EntityTrait>::Column;

/// Lookup key of a persisted entity: table name plus primary key values.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityKey {
    table: String,
    id: String,
}

impl EntityKey {
    /// Creates a key from a table name and a rendered identifier.
    #[must_use]
    pub fn new(table: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            id: id.into(),
        }
    }

    /// Returns the table name.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Returns the rendered primary key.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Computes the key of an active model, if its primary key is set.
    #[must_use]
    pub fn of_active_model<A: ActiveModelTrait>(model: &A) -> Option<Self> {
        let values = primary_key_values(model)?;
        Some(Self::from_values::<A::Entity>(values.into_iter().map(|(_, v)| v)))
    }

    /// Computes the key of a loaded model.
    #[must_use]
    pub fn of_model<M: ModelTrait>(model: &M) -> Self {
        let values = <<M::Entity as EntityTrait>::PrimaryKey as Iterable>::iter()
            .map(|key| model.get(key.into_column()));
        Self::from_values::<M::Entity>(values)
    }

    fn from_values<E: EntityTrait>(values: impl Iterator<Item = Value>) -> Self {
        let id = values
            .map(|v| format!("{v:?}"))
            .collect::<Vec<_>>()
            .join(",");
        Self::new(E::default().table_name(), id)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.table, self.id)
    }
}

/// Returns the primary key columns and values of an active model.
///
/// `None` when any key column is not set.
pub(crate) fn primary_key_values<A: ActiveModelTrait>(
    model: &A,
) -> Option<Vec<(ColumnOf<A>, Value)>> {
    <<A::Entity as EntityTrait>::PrimaryKey as Iterable>::iter()
        .map(|key| {
            let column = key.into_column();
            model.get(column).into_value().map(|value| (column, value))
        })
        .collect()
}

/// An entity the session can persist.
///
/// The hooks default to no-ops and the sub-entity list defaults to empty, so
/// plain active models only need [`versioned_entity!`](crate::versioned_entity).
pub trait VersionedEntity: Send {
    /// The SeaORM active model written to the database.
    type ActiveModel: ActiveModelTrait + ActiveModelBehavior + Send + Sync + 'static;

    /// Returns the active model to persist.
    fn active_model(&self) -> Self::ActiveModel;

    /// Runs before save, update, merge and save-or-update.
    fn before_save(&mut self) {}

    /// Runs before delete.
    fn before_deletion(&mut self) {}

    /// Drains the dependent entities to delete after this entity is written
    /// or deleted.
    fn take_deleted_entities(&mut self) -> Vec<Box<dyn CascadeDelete>> {
        Vec::new()
    }
}

/// Type-erased view of an entity scheduled for cascade deletion.
pub trait CascadeDelete: Send {
    /// Lookup key, `None` if the primary key is not set.
    fn cascade_key(&self) -> Option<EntityKey>;

    /// Runs the entity's pre-deletion hook.
    fn prepare_deletion(&mut self);

    /// Builds the `DELETE` for this entity, `None` if the primary key is not
    /// set.
    fn delete_statement(&self, backend: DbBackend) -> Option<Statement>;

    /// Drains this entity's own dependents.
    fn take_cascade(&mut self) -> Vec<Box<dyn CascadeDelete>>;
}

impl<E: VersionedEntity> CascadeDelete for E {
    fn cascade_key(&self) -> Option<EntityKey> {
        EntityKey::of_active_model(&self.active_model())
    }

    fn prepare_deletion(&mut self) {
        VersionedEntity::before_deletion(self);
    }

    fn delete_statement(&self, backend: DbBackend) -> Option<Statement> {
        let model = self.active_model();
        primary_key_values(&model)?;
        Some(EntityOf::<E::ActiveModel>::delete(model).build(backend))
    }

    fn take_cascade(&mut self) -> Vec<Box<dyn CascadeDelete>> {
        VersionedEntity::take_deleted_entities(self)
    }
}

/// Implements [`VersionedEntity`] with no hooks and no dependents for
/// active model types.
#[macro_export]
macro_rules! versioned_entity {
    ($($model:ty),+ $(,)?) => {
        $(
            impl $crate::VersionedEntity for $model {
                type ActiveModel = $model;

                fn active_model(&self) -> Self::ActiveModel {
                    ::std::clone::Clone::clone(self)
                }
            }
        )+
    };
}
