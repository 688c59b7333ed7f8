//! Shared data for the style-transfer pipeline: the style catalog, asset value
//! types, the observable pipeline state, the event log and receipts.

pub mod assets;
pub mod events;
pub mod runs;
pub mod state;
pub mod styles;
