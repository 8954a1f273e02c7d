//! Kestrel kernel support library.
//!
//! Small, dependency-light helpers shared across kernel crates: alignment
//! arithmetic and the klog logging facade.

#![cfg_attr(not(test), no_std)]

pub mod alignment;
pub mod klog;

pub use alignment::{
    align_down_u64, align_down_usize, align_up_u64, align_up_usize, is_aligned_u64,
    is_aligned_usize,
};
pub use klog::{
    KlogLevel, klog_get_level, klog_init, klog_is_enabled, klog_register_backend, klog_set_level,
};
