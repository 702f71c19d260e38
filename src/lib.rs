pub mod api;
pub mod db;
pub mod pipeline;
pub mod provider;
pub mod storage;
