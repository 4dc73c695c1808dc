pub mod config;
pub mod diagnostics;
pub mod dispatch;
pub mod error;
pub mod interface;
pub mod outage;
pub mod reporter;
pub mod storage;
pub mod types;
