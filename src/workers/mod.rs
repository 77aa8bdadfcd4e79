//! Background workers

pub mod webhook_retry;
