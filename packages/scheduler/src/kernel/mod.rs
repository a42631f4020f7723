//! Kernel module - job engine infrastructure.

pub mod jobs;
