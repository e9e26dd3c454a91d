pub mod bootstrap;
pub mod config;
pub mod consistency;
pub mod database;
pub mod derivatives;
pub mod error;
pub mod fetch;
pub mod lifecycle;
pub mod models;
pub mod recovery;
pub mod routes;
pub mod store;
