use chrono::Utc;
use sea_orm::{ActiveModelTrait, DatabaseConnection, DbErr, Set};
use std::fmt;
use thiserror::Error;

use crate::entities::user_blocks;
use crate::services::identity::{Identity, RIGHT_BLOCK, active_block};

#[derive(Error, Debug)]
pub enum BlockError {
    #[error("User '{0}' doesn't exist.")]
    UnknownPerformer(String),

    #[error("User '{0}' doesn't have blocking rights.")]
    NotAllowed(String),

    #[error(transparent)]
    Db(#[from] DbErr),
}

#[derive(Debug, Clone, PartialEq)]
pub enum BlockOutcome {
    Blocked(String),
    UnknownUser(String),
    AlreadyBlocked(String),
    Failed { name: String, reason: String },
}

impl fmt::Display for BlockOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockOutcome::Blocked(name) => write!(f, "Blocking '{}' succeeded.", name),
            BlockOutcome::UnknownUser(name) => write!(
                f,
                "Blocking '{}' skipped (user doesn't exist or is invalid).",
                name
            ),
            BlockOutcome::AlreadyBlocked(name) => {
                write!(f, "Blocking '{}' skipped (user already blocked).", name)
            }
            BlockOutcome::Failed { name, reason } => {
                write!(f, "Blocking '{}' failed: {}", name, reason)
            }
        }
    }
}

/// One user name per line, blank lines ignored.
pub fn parse_user_list(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| line.to_string())
        .collect()
}

/// Indefinite blocks, as read by the upload permission check.
pub struct BlockService {
    db: DatabaseConnection,
}

impl BlockService {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Looks up the user the blocks are made by. They must hold the `block` right.
    pub async fn performer(&self, username: &str) -> Result<Identity, BlockError> {
        let identity = Identity::load_by_name(&self.db, username)
            .await?
            .ok_or_else(|| BlockError::UnknownPerformer(username.to_string()))?;
        if !identity.has_right(RIGHT_BLOCK) {
            return Err(BlockError::NotAllowed(username.to_string()));
        }
        Ok(identity)
    }

    pub async fn block_users(
        &self,
        performer: &Identity,
        usernames: &[String],
        reason: &str,
    ) -> Result<Vec<BlockOutcome>, BlockError> {
        let blocker_id = performer
            .owner()
            .ok_or_else(|| BlockError::UnknownPerformer("anonymous".to_string()))?;

        let mut outcomes = Vec::with_capacity(usernames.len());
        for name in usernames {
            let Some(target) = Identity::load_by_name(&self.db, name).await? else {
                outcomes.push(BlockOutcome::UnknownUser(name.clone()));
                continue;
            };
            let Some(user_id) = target.user_id else {
                outcomes.push(BlockOutcome::UnknownUser(name.clone()));
                continue;
            };

            if active_block(&self.db, &user_id).await?.is_some() {
                outcomes.push(BlockOutcome::AlreadyBlocked(name.clone()));
                continue;
            }

            let inserted = user_blocks::ActiveModel {
                id: Set(uuid::Uuid::new_v4().to_string()),
                user_id: Set(user_id.clone()),
                blocker_id: Set(blocker_id.to_string()),
                reason: Set(reason.to_string()),
                expires_at: Set(None),
                created_at: Set(Utc::now()),
            }
            .insert(&self.db)
            .await;

            match inserted {
                Ok(_) => {
                    tracing::info!(user_id = %user_id, blocker_id = %blocker_id, "User blocked");
                    outcomes.push(BlockOutcome::Blocked(name.clone()));
                }
                Err(e) => {
                    tracing::error!(user_id = %user_id, "Failed to block user: {}", e);
                    outcomes.push(BlockOutcome::Failed {
                        name: name.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::users;
    use crate::infrastructure::database::run_migrations;
    use sea_orm::Database;

    async fn insert_user(db: &DatabaseConnection, name: &str, rights: &[&str]) {
        users::ActiveModel {
            id: Set(format!("id-{}", name)),
            username: Set(name.to_string()),
            rights: Set(serde_json::json!(rights)),
            watch_uploads: Set(false),
            created_at: Set(Some(Utc::now())),
        }
        .insert(db)
        .await
        .unwrap();
    }

    #[test]
    fn test_parse_user_list() {
        assert_eq!(parse_user_list("  Spammer1\n\nSpammer2  \n"), vec!["Spammer1", "Spammer2"]);
    }

    #[tokio::test]
    async fn test_performer_needs_block_right() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        run_migrations(&db).await.unwrap();
        insert_user(&db, "Admin", &["block"]).await;
        insert_user(&db, "Regular", &["upload"]).await;
        let service = BlockService::new(db);

        assert!(service.performer("Admin").await.is_ok());
        assert!(matches!(
            service.performer("Regular").await,
            Err(BlockError::NotAllowed(_))
        ));
        assert!(matches!(
            service.performer("Nobody").await,
            Err(BlockError::UnknownPerformer(_))
        ));
    }

    #[tokio::test]
    async fn test_block_users() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        run_migrations(&db).await.unwrap();
        insert_user(&db, "Admin", &["block"]).await;
        insert_user(&db, "Spammer", &["upload"]).await;
        let service = BlockService::new(db.clone());
        let admin = service.performer("Admin").await.unwrap();

        let names = vec!["Spammer".to_string(), "Ghost".to_string(), "Spammer".to_string()];
        let outcomes = service.block_users(&admin, &names, "spam").await.unwrap();
        assert_eq!(
            outcomes,
            vec![
                BlockOutcome::Blocked("Spammer".to_string()),
                BlockOutcome::UnknownUser("Ghost".to_string()),
                BlockOutcome::AlreadyBlocked("Spammer".to_string()),
            ]
        );
        assert_eq!(outcomes[0].to_string(), "Blocking 'Spammer' succeeded.");

        let identity = Identity::load(&db, "id-Spammer").await.unwrap().unwrap();
        assert_eq!(identity.block.unwrap().reason, "spam");
    }
}
