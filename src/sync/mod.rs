// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cross-tier synchronization.
//!
//! [`SyncEngine`] promotes completed items from wherever they live (buffer
//! first, otherwise a random storage unit holding them) into every writable
//! storage unit. [`PeriodicScheduler`] drives it: one loop per unit on that
//! unit's interval, and one loop woken by item completion.

pub mod engine;
pub mod scheduler;

pub use engine::{ItemSync, SyncEngine, SyncReport};
pub use scheduler::PeriodicScheduler;
