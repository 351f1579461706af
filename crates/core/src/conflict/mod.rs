//! Conflict detection and resolution.
//!
//! 1. **Detection** -- classifying each side of an entity against the
//!    last-synced hashes and deciding what a pass does with it.
//! 2. **Resolution** -- applying the side the user chose and unfreezing
//!    the entity.

pub mod detector;
pub mod resolver;

pub use detector::{decide, ConflictType, SideChange, SyncAction};
pub use resolver::{format_payload, ConflictResolver, PayloadPreview};
