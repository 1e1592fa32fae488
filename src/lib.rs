pub mod baseline;
pub mod catalog;
pub mod credentials;
pub mod download_plan;
pub mod error;
pub mod retry;
pub mod selection;
pub mod token;
