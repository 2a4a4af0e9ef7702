pub mod aliases;
pub mod app_error;
pub mod app_state;
pub mod bootstrap;
pub mod catalog;
pub mod config;
pub mod db;
pub mod middleware;
pub mod models;
pub mod pricing;
pub mod routes;
pub mod schema;
pub mod swagger;
