//! # grabthar
//!
//! Release-engineering helpers for npm packages, centred on mirroring
//! published tarballs onto a static CDN.
//!
//! ## Pipeline
//!
//! A mirror run ([`engine::generate_mirror`]) works against one
//! [`registry::RegistryClient`], whose cache gives the run a single
//! snapshot of registry metadata:
//!
//! 1. Stale versioned subtrees under the mirror root are removed.
//! 2. Every retained version of the root package
//!    ([`retention::select_versions_to_keep`]) is synced into
//!    `{mirror_root}/{release_version}` by [`mirror::sync_module`], and with
//!    `recursive` each of its declared dependencies is synced alongside.
//! 3. With `legacy_overwrite`, the same pass is repeated into the bare
//!    mirror root.
//!
//! Each synced package ends up as `info.json` plus a `tarballs/` folder in
//! which only retained versions survive; manifest URLs for mirrored
//! tarballs point at the CDN.
//!
//! ## Modules
//!
//! - [`engine`]: Mirror lifecycle, recursive driver, [`engine::Reporter`]
//! - [`mirror`]: Per-package sync, pruning and manifest rewrite
//! - [`retention`]: Which versions stay in the mirror
//! - [`registry`]: Cached registry client and packument normalization
//! - [`deps`]: Lockfile diffing and flat-lockfile validation
//! - [`config`]: `.grabthar.toml` loading and option resolution
//! - [`git`] / [`npm`]: External tool collaborators
//! - [`retry`]: Backoff strategies for registry transport
//! - [`types`] / [`error`]: Domain records and the error taxonomy

pub mod config;
pub mod deps;
pub mod engine;
pub mod error;
pub mod git;
pub mod mirror;
pub mod npm;
pub mod process;
pub mod registry;
pub mod retention;
pub mod retry;
pub mod types;

#[cfg(test)]
mod test_support;
