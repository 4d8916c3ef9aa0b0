//! `functions` table: one row per registered function version.
//! `(name, version)` carries a unique index in the schema.

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq)]
#[sea_orm(table_name = "functions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub name: String,
    pub version: String,
    pub runtime: String,
    pub handler: String,
    pub code_location: String,
    pub code_checksum: String,
    pub code_size: i64,
    pub timeout_seconds: i64,
    pub memory_mb: i32,
    pub max_concurrency: i32,
    pub environment: String, // JSON object
    pub metadata: String,    // JSON object
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
