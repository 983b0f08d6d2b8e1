//! Reactions to registry change events
//!
//! Registry events are a tagged union `{Added, Updated, Removed} x path x
//! value`. [`handlers`] turns each event into [`Action`]s with pure functions;
//! [`ListenerManager`] owns the task that receives events and applies the
//! actions through the job services.

pub mod handlers;
pub mod manager;

pub use handlers::{actions_for, Action, ListenerContext};
pub use manager::{dispatch, ListenerManager};
