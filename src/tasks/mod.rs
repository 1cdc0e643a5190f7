//! Background tasks

pub mod cleanup;
pub mod scheduler;
