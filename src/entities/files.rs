use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// A published upload. The name is the public title of the file.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "files")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub name: String,
    pub storage_key: String,
    pub size: i64,
    #[sea_orm(indexed)]
    pub sha256: String,
    pub mime_type: Option<String>,
    pub uploader_id: String,
    #[sea_orm(column_type = "Text")]
    pub comment: String,
    #[sea_orm(column_type = "Text")]
    pub description: String,
    pub tags: Json,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
