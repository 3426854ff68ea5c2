//! Background tasks

pub mod backup;
