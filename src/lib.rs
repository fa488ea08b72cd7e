//! Streaming, encrypted backups and restores of PostgreSQL, MySQL, MariaDB
//! and MongoDB databases.
//!
//! Backups are produced by the engines' own client tools. Their output is
//! compressed, optionally encrypted with a per-backup key and streamed into
//! a [`storage::Storage`] without ever being written to local disk. The
//! entry point is [`pipeline::Pipeline`].

#![forbid(unsafe_code)]

pub mod cli;
pub mod config;
pub mod encryption;
pub mod engines;
pub mod model;
pub mod pipeline;
pub mod secret;
pub mod shutdown;
pub mod storage;
