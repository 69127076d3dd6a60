pub mod auth;
pub mod keyed_mutex;
pub mod validation;
