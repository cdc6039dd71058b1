//! A content-addressed library of environment trees and the machinery to
//! materialize ("restore") them into working copies, deduplicating shared
//! file content across environments via the blob store and, where the
//! filesystem allows, via hardlinks.
//!
//! The flow: an external builder stages an environment under
//! [`library::Library::stage`], [`lift`] walks the staged tree into the blob
//! store and persists a [`catalog`] for its blueprint, and [`restore`]
//! materializes any catalog into a `(controller, space)` working copy,
//! verifying every byte it writes against its digest.

pub mod archive;
pub mod blobs;
pub mod blueprint;
pub mod catalog;
pub mod context;
pub mod counters;
pub mod environment;
pub mod error;
pub mod fanout;
pub mod file_util;
pub mod hardlink;
pub mod hashing;
pub mod library;
pub mod lift;
pub mod locks;
pub mod prefetch;
pub mod restore;
pub mod tree;

/// Files smaller than this (and with few rewrites) are batched several to a
/// task instead of getting their own.
pub const SMALL_FILE_THRESHOLD: u64 = 100 * 1024;

/// A small file stops being batchable once it has more rewrite offsets than this.
pub const SMALL_FILE_MAX_REWRITES: usize = 10;

/// Capacity of the fan-out work queue.
pub const WORK_QUEUE_DEPTH: usize = 4096;
