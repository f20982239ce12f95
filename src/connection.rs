//! Bookkeeping for links and for connections that outlive any single open()
//! request: background auto-connects, "listen" registrations, and the set of
//! links currently up.

pub mod background_tracker;
pub mod link_tracker;

pub use background_tracker::{BackgroundConnectionEntry, BackgroundConnectionTracker};
pub use link_tracker::LinkTracker;
