//! core
//!
//! Core domain types, configuration, and workspace-level state.
//!
//! # Modules
//!
//! - [`types`] - Strong types: WorkspaceId, RepoEntry, WorkspaceSnapshot, etc.
//! - [`config`] - Configuration schema and loading
//! - [`paths`] - Centralized path routing for Grove storage
//! - [`ops`] - Cross-process workspace locking
//! - [`cache`] - TTL cache of workspace metadata
//!
//! # Design Principles
//!
//! - Strong typing prevents invalid states at compile time
//! - Schemas are strict and self-describing
//! - Nothing here is global; every component is constructed explicitly

pub mod cache;
pub mod config;
pub mod ops;
pub mod paths;
pub mod types;
