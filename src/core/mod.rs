pub mod cache;
pub mod credentials;
pub mod error;
pub mod models;
pub mod query;
pub mod retry;
pub mod settings;
