//! Conversation engine
//!
//! Pure state transitions: `apply(state, event)` computes the next state and
//! the outbound actions, with no I/O.

mod action;
pub mod event;
pub mod state;
pub(crate) mod transition;

#[cfg(test)]
mod proptests;

pub use action::{Action, ActionKind};
pub use event::{Event, EventKind};
pub use state::{AttrValue, ConversationState, StateTag};
pub use transition::apply;
