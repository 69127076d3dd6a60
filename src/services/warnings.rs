use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use serde_json::{Map, Value, json};
use std::sync::Arc;

use crate::api::error::ApiError;
use crate::config::UploadConfig;
use crate::entities::files;
use crate::utils::validation::{final_extension, split_extensions};

pub const WARNING_LARGE_FILE: &str = "large-file";

/// Advisory findings about an upload, keyed by warning name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UploadWarnings(Map<String, Value>);

impl UploadWarnings {
    pub fn insert(&mut self, name: &str, detail: Value) {
        self.0.insert(name.to_string(), detail);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Anything other than `large-file` needs the client to confirm with `ignorewarnings`.
    pub fn is_blocking(&self) -> bool {
        self.0.keys().any(|k| k != WARNING_LARGE_FILE)
    }

    pub fn to_value(&self) -> Option<Value> {
        if self.0.is_empty() {
            None
        } else {
            Some(Value::Object(self.0.clone()))
        }
    }
}

/// Post-content checks: name rewrites, unwanted types, size, and clashes with published files.
#[derive(Clone)]
pub struct WarningService {
    db: DatabaseConnection,
    config: Arc<UploadConfig>,
}

impl WarningService {
    pub fn new(db: DatabaseConnection, config: Arc<UploadConfig>) -> Self {
        Self { db, config }
    }

    pub async fn check(
        &self,
        desired_name: &str,
        filtered_name: &str,
        size: u64,
        sha256: Option<&str>,
    ) -> Result<UploadWarnings, ApiError> {
        let mut warnings = UploadWarnings::default();

        if desired_name != filtered_name {
            warnings.insert("badfilename", json!(filtered_name));
        }

        if self.config.check_file_extensions && !self.config.strict_file_extensions {
            if let Some(ext) = final_extension(filtered_name) {
                if !self.config.is_allowed_extension(&ext) {
                    warnings.insert("filetype-unwanted-type", json!([ext]));
                }
            }
        }

        if let Some(limit) = self.config.large_file_warning_size {
            if size > limit as u64 {
                warnings.insert(WARNING_LARGE_FILE, json!([limit, size]));
            }
        }

        if files::Entity::find_by_id(filtered_name)
            .one(&self.db)
            .await?
            .is_some()
        {
            warnings.insert("exists", json!(filtered_name));
        } else if let Some(other) = self.find_normalized(filtered_name).await? {
            warnings.insert("exists-normalized", json!(other));
        }

        if let Some(sha256) = sha256 {
            let dupes: Vec<String> = files::Entity::find()
                .filter(files::Column::Sha256.eq(sha256))
                .filter(files::Column::Name.ne(filtered_name))
                .all(&self.db)
                .await?
                .into_iter()
                .map(|f| f.name)
                .collect();
            if !dupes.is_empty() {
                warnings.insert("duplicate", json!(dupes));
            }
        }

        Ok(warnings)
    }

    /// A published file whose name differs from `name` only in the case of its extension.
    async fn find_normalized(&self, name: &str) -> Result<Option<String>, ApiError> {
        let (partname, exts) = split_extensions(name);
        if exts.is_empty() {
            return Ok(None);
        }
        let prefix = format!("{}.", partname);
        let candidates = files::Entity::find()
            .filter(files::Column::Name.starts_with(&prefix))
            .all(&self.db)
            .await?;

        let wanted = name.to_lowercase();
        Ok(candidates
            .into_iter()
            .map(|f| f.name)
            .find(|other| other != name && other.to_lowercase() == wanted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::database::run_migrations;
    use chrono::Utc;
    use sea_orm::{ActiveModelTrait, Database, Set};

    async fn service(config: UploadConfig) -> WarningService {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        run_migrations(&db).await.unwrap();
        WarningService::new(db, Arc::new(config))
    }

    async fn publish(service: &WarningService, name: &str, sha256: &str) {
        files::ActiveModel {
            name: Set(name.to_string()),
            storage_key: Set(format!("public/{}", name)),
            size: Set(4),
            sha256: Set(sha256.to_string()),
            mime_type: Set(None),
            uploader_id: Set("u1".to_string()),
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
    async fn test_clean_upload_has_no_warnings() {
        let service = service(UploadConfig::default()).await;
        let warnings = service.check("Fresh.png", "Fresh.png", 10, Some("abc")).await.unwrap();
        assert!(warnings.is_empty());
        assert!(warnings.to_value().is_none());
    }

    #[tokio::test]
    async fn test_existing_and_duplicate() {
        let service = service(UploadConfig::default()).await;
        publish(&service, "Cat.png", "aaa").await;
        publish(&service, "Other.png", "bbb").await;

        let warnings = service.check("Cat.png", "Cat.png", 4, Some("bbb")).await.unwrap();
        assert!(warnings.contains("exists"));
        assert!(warnings.is_blocking());
        assert_eq!(warnings.to_value().unwrap()["duplicate"], json!(["Other.png"]));

        // Re-uploading identical content under its own name is not a duplicate
        let warnings = service.check("Cat.png", "Cat.png", 4, Some("aaa")).await.unwrap();
        assert!(!warnings.contains("duplicate"));
    }

    #[tokio::test]
    async fn test_extension_case_clash() {
        let service = service(UploadConfig::default()).await;
        publish(&service, "Photo.PNG", "aaa").await;

        let warnings = service.check("Photo.png", "Photo.png", 4, None).await.unwrap();
        assert!(!warnings.contains("exists"));
        assert_eq!(warnings.to_value().unwrap()["exists-normalized"], "Photo.PNG");
    }

    #[tokio::test]
    async fn test_informational_warnings() {
        let service = service(UploadConfig {
            large_file_warning_size: Some(100),
            strict_file_extensions: false,
            ..UploadConfig::default()
        })
        .await;

        let warnings = service.check("big.png", "big.png", 500, None).await.unwrap();
        assert!(warnings.contains(WARNING_LARGE_FILE));
        assert!(!warnings.is_blocking());

        let warnings = service.check("notes txt.odt", "notes_txt.odt", 5, None).await.unwrap();
        let value = warnings.to_value().unwrap();
        assert_eq!(value["badfilename"], "notes_txt.odt");
        assert_eq!(value["filetype-unwanted-type"], json!(["odt"]));
    }
}
