pub mod error;
pub mod handler_utils;
pub mod jobs;
pub mod ledger;
pub mod server;
