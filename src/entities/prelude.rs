pub use super::files::Entity as Files;
pub use super::upload_sessions::Entity as UploadSessions;
pub use super::upload_stash::Entity as UploadStash;
pub use super::user_blocks::Entity as UserBlocks;
pub use super::users::Entity as Users;
pub use super::watchlist::Entity as Watchlist;
