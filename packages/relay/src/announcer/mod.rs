// packages/relay/src/announcer/mod.rs
//! Catalog announcements
//!
//! Tells the upstream broker which bundles this relay serves, with
//! at-least-once delivery.
//!
//! ```text
//!            start                announce
//! Stopped ─────────▶ Waiting ───────────────▶ ReceiptWaiting ──┐
//!    ▲                  ▲      (publish, arm retry)     │  ▲    │ retry timer:
//!    │                  └───── matching receipt ────────┘  └────┘ re-publish
//!    └──── stop (from any state) ────────────────────────────────
//! ```

#[allow(clippy::module_inception)]
pub mod announcer;
pub mod messages;

// Re-export commonly used types
pub use announcer::{Announcer, AnnouncerConfig, AnnouncerHandle, AnnouncerState, AnnouncerStatus};
pub use messages::{Announcement, AnnouncementReceipt, ReceiptStatus};
