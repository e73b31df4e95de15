//! Shared entities and fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use sea_orm::{ActiveValue, ConnectionTrait, EntityTrait, Set};
use unitwork_db::{CascadeDelete, DbSession, SchemaMetadata, SessionFactory, VersionedEntity};
use unitwork_shared::OrmConfig;

pub mod calendar {
    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "calendar")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub id: i32,
        pub name: String,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

pub mod event {
    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "event")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub id: i32,
        pub calendar_id: i32,
        pub title: String,
        pub day: Date,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

unitwork_db::versioned_entity!(calendar::ActiveModel, event::ActiveModel);

/// Records hook invocations in call order.
pub type HookLog = Arc<Mutex<Vec<String>>>;

pub fn hook_log() -> HookLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn entries(log: &HookLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

fn record(log: &HookLog, entry: String) {
    log.lock().unwrap().push(entry);
}

fn label(id: &ActiveValue<i32>) -> String {
    match id {
        ActiveValue::Set(id) | ActiveValue::Unchanged(id) => id.to_string(),
        ActiveValue::NotSet => "unset".to_string(),
    }
}

/// Calendar aggregate that owns events scheduled for deletion.
pub struct TrackedCalendar {
    pub model: calendar::ActiveModel,
    pub doomed: Vec<TrackedEvent>,
    pub log: HookLog,
}

impl VersionedEntity for TrackedCalendar {
    type ActiveModel = calendar::ActiveModel;

    fn active_model(&self) -> calendar::ActiveModel {
        self.model.clone()
    }

    fn before_save(&mut self) {
        record(&self.log, format!("save calendar {}", label(&self.model.id)));
    }

    fn before_deletion(&mut self) {
        record(&self.log, format!("delete calendar {}", label(&self.model.id)));
    }

    fn take_deleted_entities(&mut self) -> Vec<Box<dyn CascadeDelete>> {
        self.doomed
            .drain(..)
            .map(|event| Box::new(event) as Box<dyn CascadeDelete>)
            .collect()
    }
}

/// Event that may own further events.
pub struct TrackedEvent {
    pub model: event::ActiveModel,
    pub dependents: Vec<TrackedEvent>,
    pub log: HookLog,
}

impl TrackedEvent {
    pub fn new(id: i32, log: &HookLog) -> Self {
        Self {
            model: event::ActiveModel {
                id: Set(id),
                ..Default::default()
            },
            dependents: Vec::new(),
            log: Arc::clone(log),
        }
    }

    /// An event whose primary key was never assigned.
    pub fn keyless(log: &HookLog) -> Self {
        Self {
            model: event::ActiveModel::default(),
            dependents: Vec::new(),
            log: Arc::clone(log),
        }
    }

    pub fn with_dependents(mut self, dependents: Vec<TrackedEvent>) -> Self {
        self.dependents = dependents;
        self
    }
}

impl VersionedEntity for TrackedEvent {
    type ActiveModel = event::ActiveModel;

    fn active_model(&self) -> event::ActiveModel {
        self.model.clone()
    }

    fn before_deletion(&mut self) {
        record(&self.log, format!("delete event {}", label(&self.model.id)));
    }

    fn take_deleted_entities(&mut self) -> Vec<Box<dyn CascadeDelete>> {
        self.dependents
            .drain(..)
            .map(|event| Box::new(event) as Box<dyn CascadeDelete>)
            .collect()
    }
}

pub fn metadata() -> SchemaMetadata {
    SchemaMetadata::new()
        .register::<calendar::Entity>()
        .register::<event::Entity>()
}

/// Factory over a private in-memory database with the schema applied.
///
/// The pool holds a single connection, so a session with open work must be
/// closed before the factory connection is used directly.
pub async fn setup() -> SessionFactory {
    let config = OrmConfig::from_properties([
        "connection.url=sqlite::memory:",
        "connection.max_connections=1",
        "connection.min_connections=1",
        "connection.acquire_timeout_secs=5",
    ])
    .expect("test config");
    let factory = SessionFactory::connect(&config)
        .await
        .expect("Failed to connect to database");

    let db = factory.connection();
    for stmt in metadata().create_statements(db.get_database_backend()) {
        db.execute(stmt).await.expect("Failed to create schema");
    }

    factory
}

pub async fn open(factory: &SessionFactory) -> DbSession {
    let mut session = DbSession::new();
    session.init(factory).await.expect("Failed to open session");
    session
}

pub fn make_calendar(id: i32, name: &str) -> calendar::ActiveModel {
    calendar::ActiveModel {
        id: Set(id),
        name: Set(name.to_string()),
    }
}

pub fn make_event(
    id: i32,
    calendar_id: i32,
    title: &str,
    day: chrono::NaiveDate,
) -> event::ActiveModel {
    event::ActiveModel {
        id: Set(id),
        calendar_id: Set(calendar_id),
        title: Set(title.to_string()),
        day: Set(day),
    }
}

pub async fn calendar_row(factory: &SessionFactory, id: i32) -> Option<calendar::Model> {
    calendar::Entity::find_by_id(id)
        .one(factory.connection())
        .await
        .expect("Failed to query calendar")
}

pub async fn event_row(factory: &SessionFactory, id: i32) -> Option<event::Model> {
    event::Entity::find_by_id(id)
        .one(factory.connection())
        .await
        .expect("Failed to query event")
}
