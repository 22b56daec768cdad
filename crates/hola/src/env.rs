//! Transactional mutation of the process environment.
//!
//! The `ruby_block` driver exports its declared environment pairs
//! around the scripted call. The process environment is shared mutable
//! state, so every mutation is snapshotted first and restored on every
//! exit path (success, error, unwind) by running the restore in
//! `Drop`.
//!
//! This module is the crate's only unsafe code: `std::env::set_var` /
//! `remove_var` are unsafe fns under edition 2024, and exporting
//! variables into the parent process is exactly what this resource is
//! specified to do.

use std::env;

/// Snapshot-and-restore guard for a set of environment keys.
///
/// Restores in reverse application order so overlapping keys unwind
/// correctly.
#[derive(Debug)]
pub struct EnvTransaction {
    saved: Vec<(String, Option<String>)>,
}

impl EnvTransaction {
    /// Snapshot the prior value (or absence) of each key, then apply
    /// the new pairs.
    #[allow(unsafe_code)]
    pub fn apply(pairs: &[(String, String)]) -> Self {
        let mut saved = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            saved.push((key.clone(), env::var(key).ok()));
            // SAFETY: the scheduler is single-threaded at this point;
            // drivers that spawn workers never mutate the environment.
            unsafe { env::set_var(key, value) };
        }
        Self { saved }
    }
}

#[allow(unsafe_code)]
impl Drop for EnvTransaction {
    fn drop(&mut self) {
        for (key, prior) in self.saved.drain(..).rev() {
            match prior {
                // SAFETY: see `apply`.
                Some(value) => unsafe { env::set_var(&key, value) },
                None => unsafe { env::remove_var(&key) },
            }
        }
    }
}
