use chrono::{Duration, Utc};
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter};
use serde_json::json;
use std::sync::Arc;

use crate::api::error::{ApiError, ErrorKind};
use crate::config::UploadConfig;
use crate::entities::files;
use crate::services::identity::{
    Identity, RIGHT_APPLY_CHANGE_TAGS, RIGHT_NO_RATE_LIMIT, RIGHT_REUPLOAD, RIGHT_REUPLOAD_OWN,
    RIGHT_UPLOAD,
};

/// Capability, block, overwrite, throttle and change-tag checks for uploads.
#[derive(Clone)]
pub struct PermissionService {
    db: DatabaseConnection,
    config: Arc<UploadConfig>,
}

impl PermissionService {
    pub fn new(db: DatabaseConnection, config: Arc<UploadConfig>) -> Self {
        Self { db, config }
    }

    pub fn check_upload_permission(&self, identity: &Identity) -> Result<(), ApiError> {
        if !identity.has_right(RIGHT_UPLOAD) {
            if !identity.is_logged_in() {
                return Err(ApiError::permission(
                    "mustbeloggedin",
                    "You must be logged in to upload this file",
                ));
            }
            return Err(ApiError::permission(
                "permissiondenied",
                "You don't have permission to upload files",
            ));
        }

        if let Some(block) = &identity.block {
            return Err(ApiError::permission(
                "blocked",
                "You have been blocked from editing",
            )
            .with_data("blockinfo", json!(block)));
        }

        Ok(())
    }

    /// May `identity` create or overwrite the published file `name`?
    pub async fn check_title_permission(
        &self,
        identity: &Identity,
        name: &str,
    ) -> Result<(), ApiError> {
        let Some(existing) = files::Entity::find_by_id(name).one(&self.db).await? else {
            return Ok(());
        };

        let own_file = identity.owner() == Some(existing.uploader_id.as_str());
        if identity.has_right(RIGHT_REUPLOAD)
            || (own_file && identity.has_right(RIGHT_REUPLOAD_OWN))
        {
            return Ok(());
        }

        Err(ApiError::new(
            ErrorKind::RecoverableContent,
            "fileexists-forbidden",
            format!("A file with the name \"{}\" already exists, and cannot be overwritten", name),
        ))
    }

    pub async fn check_throttle(&self, identity: &Identity) -> Result<(), ApiError> {
        if identity.has_right(RIGHT_NO_RATE_LIMIT) {
            return Ok(());
        }
        let Some(user_id) = identity.owner() else {
            return Ok(());
        };

        let since = Utc::now() - Duration::hours(1);
        let recent = files::Entity::find()
            .filter(files::Column::UploaderId.eq(user_id))
            .filter(files::Column::UpdatedAt.gt(since))
            .count(&self.db)
            .await?;

        if recent >= self.config.uploads_per_hour as u64 {
            tracing::warn!(user_id = %user_id, recent, "Upload rate limit hit");
            return Err(ApiError::new(
                ErrorKind::RateLimited,
                "ratelimited",
                "You've exceeded your rate limit. Please wait some time and try again",
            ));
        }
        Ok(())
    }

    pub fn check_tags(&self, identity: &Identity, tags: &[String]) -> Result<(), ApiError> {
        if tags.is_empty() {
            return Ok(());
        }
        if !identity.has_right(RIGHT_APPLY_CHANGE_TAGS) {
            return Err(ApiError::permission(
                "tags-apply-no-permission",
                "You are not allowed to apply change tags along with your changes",
            ));
        }

        let disallowed: Vec<&String> = tags
            .iter()
            .filter(|tag| !self.config.allowed_change_tags.contains(&tag.to_lowercase()))
            .collect();
        if !disallowed.is_empty() {
            return Err(ApiError::client(
                "tags-apply-not-allowed",
                format!(
                    "Tags not allowed to be manually applied: {}",
                    disallowed
                        .iter()
                        .map(|t| t.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            )
            .with_data("tags", json!(disallowed)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::database::run_migrations;
    use crate::services::identity::BlockInfo;
    use sea_orm::{ActiveModelTrait, Database, Set};

    fn identity(user_id: Option<&str>, rights: &[&str]) -> Identity {
        Identity {
            user_id: user_id.map(|s| s.to_string()),
            username: user_id.map(|s| s.to_string()),
            rights: rights.iter().map(|r| r.to_string()).collect(),
            ..Identity::default()
        }
    }

    async fn service(config: UploadConfig) -> PermissionService {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        run_migrations(&db).await.unwrap();
        PermissionService::new(db, Arc::new(config))
    }

    async fn publish(service: &PermissionService, name: &str, uploader: &str) {
        files::ActiveModel {
            name: Set(name.to_string()),
            storage_key: Set(format!("public/{}", name)),
            size: Set(10),
            sha256: Set("abc".to_string()),
            mime_type: Set(None),
            uploader_id: Set(uploader.to_string()),
            comment: Set(String::new()),
            description: Set(String::new()),
            tags: Set(json!([])),
            created_at: Set(Utc::now()),
            updated_at: Set(Utc::now()),
        }
        .insert(&service.db)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_upload_permission_codes() {
        let service = service(UploadConfig::default()).await;

        let err = service.check_upload_permission(&Identity::anonymous()).unwrap_err();
        assert_eq!(err.code, "mustbeloggedin");

        let err = service
            .check_upload_permission(&identity(Some("u1"), &[]))
            .unwrap_err();
        assert_eq!(err.code, "permissiondenied");

        let mut blocked = identity(Some("u1"), &["upload"]);
        blocked.block = Some(BlockInfo {
            blocker_id: "admin".to_string(),
            reason: "vandalism".to_string(),
            expires_at: None,
        });
        let err = service.check_upload_permission(&blocked).unwrap_err();
        assert_eq!(err.code, "blocked");
        assert_eq!(err.data["blockinfo"]["reason"], "vandalism");

        assert!(service
            .check_upload_permission(&identity(Some("u1"), &["upload"]))
            .is_ok());
    }

    #[tokio::test]
    async fn test_overwrite_rules() {
        let service = service(UploadConfig::default()).await;
        publish(&service, "Taken.png", "owner").await;

        assert!(service
            .check_title_permission(&identity(Some("u1"), &["upload"]), "Free.png")
            .await
            .is_ok());

        let err = service
            .check_title_permission(&identity(Some("u1"), &["upload"]), "Taken.png")
            .await
            .unwrap_err();
        assert_eq!(err.code, "fileexists-forbidden");
        assert!(err.is_recoverable());

        assert!(service
            .check_title_permission(&identity(Some("owner"), &["upload", "reupload-own"]), "Taken.png")
            .await
            .is_ok());
        assert!(service
            .check_title_permission(&identity(Some("u1"), &["upload", "reupload-own"]), "Taken.png")
            .await
            .is_err());
        assert!(service
            .check_title_permission(&identity(Some("u1"), &["upload", "reupload"]), "Taken.png")
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_throttle() {
        let service = service(UploadConfig {
            uploads_per_hour: 2,
            ..UploadConfig::default()
        })
        .await;
        let user = identity(Some("u1"), &["upload"]);

        publish(&service, "One.png", "u1").await;
        assert!(service.check_throttle(&user).await.is_ok());
        publish(&service, "Two.png", "u1").await;

        let err = service.check_throttle(&user).await.unwrap_err();
        assert_eq!(err.code, "ratelimited");

        let exempt = identity(Some("u1"), &["upload", "noratelimit"]);
        assert!(service.check_throttle(&exempt).await.is_ok());
    }

    #[tokio::test]
    async fn test_change_tags() {
        let service = service(UploadConfig {
            allowed_change_tags: vec!["bot-upload".to_string()],
            ..UploadConfig::default()
        })
        .await;
        let tagger = identity(Some("u1"), &["upload", "applychangetags"]);

        assert!(service.check_tags(&identity(Some("u1"), &[]), &[]).is_ok());
        assert!(service.check_tags(&tagger, &["bot-upload".to_string()]).is_ok());

        let err = service
            .check_tags(&identity(Some("u1"), &["upload"]), &["bot-upload".to_string()])
            .unwrap_err();
        assert_eq!(err.code, "tags-apply-no-permission");

        let err = service
            .check_tags(&tagger, &["made-up".to_string()])
            .unwrap_err();
        assert_eq!(err.code, "tags-apply-not-allowed");
    }
}
