//! Integration tests for the vinectl library, exercised through its
//! public API only.

mod controller;
mod registry;
mod schedule_engine;
mod supervisor;
