//! Autocrud kernel library.
//!
//! Metadata-driven CRUD over PostgreSQL: entity registry, listing query
//! engine, record mutations, uploads, custom fields and the axum routes.
//! The `autocrud` binary wires these into a server.

pub mod config;
pub mod crud;
pub mod db;
pub mod entity;
pub mod error;
pub mod file;
pub mod query;
pub mod routes;
pub mod state;

#[cfg(test)]
mod testing;
