pub mod admission;
pub mod classify;
pub mod refund;
pub mod runner;
pub mod service;
