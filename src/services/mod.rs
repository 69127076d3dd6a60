pub mod blocks;
pub mod chunks;
pub mod identity;
pub mod jobs;
pub mod permissions;
pub mod publisher;
pub mod scanner;
pub mod source;
pub mod stash;
pub mod storage;
pub mod upload_service;
pub mod verification;
pub mod warnings;
pub mod worker;
