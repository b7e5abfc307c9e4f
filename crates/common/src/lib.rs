// gridsync-common: shared types and utilities for the gridsync workspace

pub mod address;
pub mod protocol;
pub mod types;
