pub mod commands;
pub mod config;
pub mod controller;
pub mod error;
pub mod flow;
pub mod fs;
pub mod hardware;
pub mod models;
pub mod outbox;
pub mod process;
pub mod registry;
pub mod schedule;
pub mod supervisor;
