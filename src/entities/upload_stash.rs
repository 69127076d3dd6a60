use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// A stashed (not yet published) upload. Partial entries keep one storage
/// object per chunk under `{storage_key}.{index}`.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "upload_stash")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub file_key: String,
    #[sea_orm(indexed)]
    pub user_id: String,
    pub storage_key: String,
    pub original_name: String,
    pub size: i64,
    pub sha256: Option<String>,
    pub mime_type: Option<String>,
    pub is_partial: bool,
    pub chunk_count: i32,
    pub created_at: DateTimeUtc,
    pub expires_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
