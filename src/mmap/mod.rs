//! mmap window cache (spec §4.1): per-type sliding windows with SIGBUS tolerance.

pub mod sigbus;
pub mod window;

pub use window::{MappedWindow, MappedWindowMut, TypeContext, WindowCache, N_CONTEXTS};
