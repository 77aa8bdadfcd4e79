//! Unified payment processing for municipal bill pay: permits, business
//! licenses, service applications and tax submissions paid through Finix.

pub mod api;
pub mod config;
pub mod database;
pub mod error;
pub mod health;
pub mod logging;
pub mod middleware;
pub mod payments;
pub mod services;
pub mod workers;
