//! Canopy Routing - the per-node protocol engine
//!
//! Everything in this crate is plain state owned by one node's event loop:
//! - `LinkTable`: arena of directed links and their state machine
//! - `InterestTable`: local subscriptions plus per-link interest, and the
//!   advertisement each link should carry
//! - `DedupCache`: bounded memory of recently seen publications
//! - `PublicationRouter`: dedup, decrypt, deliver locally, forward by interest
//!
//! No I/O happens here; the runtime turns decisions into frames.

pub mod dedup;
pub mod interest;
pub mod link;
pub mod router;

pub use dedup::*;
pub use interest::*;
pub use link::*;
pub use router::*;
