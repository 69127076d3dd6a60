use chrono::{DateTime, Utc};
use sea_orm::{ColumnTrait, Condition, DatabaseConnection, DbErr, EntityTrait, QueryFilter};
use serde::Serialize;

use crate::entities::{user_blocks, users};

pub const RIGHT_UPLOAD: &str = "upload";
pub const RIGHT_REUPLOAD: &str = "reupload";
pub const RIGHT_REUPLOAD_OWN: &str = "reupload-own";
pub const RIGHT_UPLOAD_BY_URL: &str = "upload_by_url";
pub const RIGHT_NO_RATE_LIMIT: &str = "noratelimit";
pub const RIGHT_APPLY_CHANGE_TAGS: &str = "applychangetags";
pub const RIGHT_BLOCK: &str = "block";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockInfo {
    pub blocker_id: String,
    pub reason: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// The acting user of a request or a background job.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Identity {
    pub user_id: Option<String>,
    pub username: Option<String>,
    pub rights: Vec<String>,
    pub watch_uploads: bool,
    pub block: Option<BlockInfo>,
}

impl Identity {
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Loads a user with its rights and any block in force. `None` for an unknown id.
    pub async fn load(db: &DatabaseConnection, user_id: &str) -> Result<Option<Self>, DbErr> {
        let Some(user) = users::Entity::find_by_id(user_id).one(db).await? else {
            return Ok(None);
        };
        Self::from_user(db, user).await.map(Some)
    }

    pub async fn load_by_name(
        db: &DatabaseConnection,
        username: &str,
    ) -> Result<Option<Self>, DbErr> {
        let Some(user) = users::Entity::find()
            .filter(users::Column::Username.eq(username))
            .one(db)
            .await?
        else {
            return Ok(None);
        };
        Self::from_user(db, user).await.map(Some)
    }

    async fn from_user(db: &DatabaseConnection, user: users::Model) -> Result<Self, DbErr> {
        let rights = serde_json::from_value::<Vec<String>>(user.rights.clone()).unwrap_or_default();
        let block = active_block(db, &user.id).await?.map(|b| BlockInfo {
            blocker_id: b.blocker_id,
            reason: b.reason,
            expires_at: b.expires_at,
        });

        Ok(Self {
            user_id: Some(user.id),
            username: Some(user.username),
            rights,
            watch_uploads: user.watch_uploads,
            block,
        })
    }

    pub fn is_logged_in(&self) -> bool {
        self.user_id.is_some()
    }

    pub fn has_right(&self, right: &str) -> bool {
        self.rights.iter().any(|r| r == right)
    }

    pub fn owner(&self) -> Option<&str> {
        self.user_id.as_deref()
    }
}

/// A block with no expiry, or one that has not expired yet.
pub async fn active_block(
    db: &DatabaseConnection,
    user_id: &str,
) -> Result<Option<user_blocks::Model>, DbErr> {
    user_blocks::Entity::find()
        .filter(user_blocks::Column::UserId.eq(user_id))
        .filter(
            Condition::any()
                .add(user_blocks::Column::ExpiresAt.is_null())
                .add(user_blocks::Column::ExpiresAt.gt(Utc::now())),
        )
        .one(db)
        .await
}
