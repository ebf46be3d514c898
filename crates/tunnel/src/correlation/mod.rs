//! Request/response correlation across an asynchronous, multiplexed transport.
//!
//! A caller registers a [`PendingCall`] under a fresh id from [`CorrelationIds`] and awaits the
//! returned [`Waiter`]; whoever receives the reply completes it by id. The sweep fails calls whose
//! deadline passed.

mod id;
mod table;

pub use id::CorrelationIds;
pub use table::CallFault;
pub use table::CorrelationError;
pub use table::CorrelationTable;
pub use table::PendingCall;
pub use table::Waiter;
