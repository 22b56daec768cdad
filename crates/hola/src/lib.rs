//! # hola
//!
//! A declarative host-configuration convergence engine. Recipes
//! enumerate resources (files, directories, links, packages, services,
//! git checkouts, remote downloads, commands, secrets, templates,
//! scripted blocks) that describe the desired state of a machine; the
//! engine compares desired to actual state for every resource, performs
//! the minimum set of changes, and propagates change events to
//! dependent resources.
//!
//! ## Pipeline
//!
//! The core flow is **register → preflight → converge → notify**:
//!
//! 1. Builders ([`builder`]) collect one declaration each, fill in
//!    defaults, coerce scalars, resolve paths, and fire exactly one
//!    registration call on [`host::RecipeHost`].
//! 2. [`engine::run`] validates required fields, indexes the
//!    [`types::ResourceList`], and synthesises notification edges from
//!    subscriptions.
//! 3. Each record's guards run, then its driver ([`drivers`]) diffs
//!    current against desired state and acts only on divergence,
//!    offloaded to a worker thread ([`hola_task`]) so the foreground
//!    can keep a progress indicator ticking.
//! 4. Updates fire immediate notifications inline and queue delayed
//!    ones for an end-of-run replay with `(target, action)` dedup.
//!
//! ## Embedding
//!
//! Recipes are evaluated by an embedded scripting runtime that this
//! crate treats as a black box behind [`interp::Interpreter`]. Guard
//! and block callables cross the boundary as pinned handles
//! ([`interp::PinnedCallable`]) so the interpreter's garbage collector
//! cannot reclaim user code mid-run.
//!
//! ## Example
//!
//! ```
//! use hola::builder::{ExecuteBuilder, FileBuilder};
//! use hola::drivers::DriverContext;
//! use hola::engine::{self, NullReporter};
//! use hola::host::RecipeHost;
//!
//! # fn main() -> anyhow::Result<()> {
//! let dir = tempfile::tempdir()?;
//! let motd = dir.path().join("motd");
//!
//! let mut host = RecipeHost::new();
//! FileBuilder::new(motd.display().to_string())
//!     .content("converged\n")
//!     .register(&mut host)?;
//!
//! let report = engine::run(
//!     &host.into_resources(),
//!     &DriverContext::default(),
//!     &mut NullReporter,
//! )?;
//! assert_eq!(report.updated, 1);
//! # Ok(())
//! # }
//! ```

/// Per-kind resource builders: defaults, coercion, path expansion.
pub mod builder;

/// Resource drivers: one idempotence protocol per kind.
pub mod drivers;

/// The convergence scheduler and run report.
pub mod engine;

/// Transactional process-environment mutation.
pub mod env;

/// Filesystem plumbing: atomic writes, backups, modes, ownership.
pub mod fsutil;

/// Guard evaluation (`only_if` / `not_if`).
pub mod guard;

/// The registration ABI between interpreter and engine.
pub mod host;

/// The interpreter seam and callable pinning.
pub mod interp;

/// Run lock.
pub mod lock;

/// Source-URI grammar for secret and remote-style inputs.
pub mod source;

/// Domain types: records, actions, results, errors.
pub mod types;
