//! Data models shared between the cluster observer and the backup subsystem.

pub mod backup;
pub mod commands;
pub mod report;
pub mod topology;
