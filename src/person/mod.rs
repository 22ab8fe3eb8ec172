//! Person and memory subsystem.
//!
//! A person is a configured LLM persona. The conversation is one global
//! append-only log per execution; every memory view is derived on read and
//! never alters storage.

mod conversation;
mod memory;

pub use conversation::{Conversation, Message, Speaker};
pub use memory::{select_view, MemorySettings, MemoryView, GOLDFISH};
