pub mod prelude;

pub mod files;
pub mod upload_sessions;
pub mod upload_stash;
pub mod user_blocks;
pub mod users;
pub mod watchlist;
