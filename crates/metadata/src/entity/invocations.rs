//! `invocations` table: one row per execution attempt. Rows are never
//! deleted by the core; history retention is a schema policy.

use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq)]
#[sea_orm(table_name = "invocations")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub function_id: String,
    pub payload: String, // JSON value
    pub headers: String, // JSON object
    pub status: String,
    pub result: Option<Vec<u8>>,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
    pub error_stack: Option<String>,
    pub duration_ns: Option<i64>,
    pub cpu_time_ns: Option<i64>,
    pub memory_peak: Option<i64>,
    pub network_in: Option<i64>,
    pub network_out: Option<i64>,
    pub created_at: DateTimeUtc,
    pub started_at: Option<DateTimeUtc>,
    pub completed_at: Option<DateTimeUtc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
