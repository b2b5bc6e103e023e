pub mod aggregate;
pub mod app;
pub mod config;
pub mod detect;
pub mod domain;
pub mod download;
pub mod error;
pub mod fs_util;
pub mod http;
pub mod output;
pub mod router;
pub mod sources;
pub mod store;
pub mod sync;
pub mod tribe;
