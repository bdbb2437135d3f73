// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Secondary read cache for decoded log content.
//!
//! The cache is never the system of record: a miss falls through to the
//! buffer or a storage unit, and clearing it at any time is harmless.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  lru.rs        - LogCache                                    │
//! │  └─ put/get touch a KV-side logical clock                    │
//! │  └─ evict: drop oldest-by-last-use while size > max_bytes    │
//! │  └─ status/clear for the admin surface                       │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod lru;

pub use lru::{CacheStatus, LogCache};
