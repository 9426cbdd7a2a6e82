//! imux-core — wire format, secure links, configuration.
//! All other imux crates depend on this one.

pub mod config;
pub mod crypto;
pub mod link;
pub mod wire;

pub use link::{LinkError, LinkReader, LinkWriter, SecureLink};
pub use wire::{Chunk, Command, Response, WireMessage};
