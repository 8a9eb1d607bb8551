#![allow(unused_doc_comments)]
/**
 * This style of comments threw out warnings.
 * This allow statement fixes that
 */

/**
 * lib.rs
 */

pub mod registry;
pub mod rudp;
pub mod server;
pub mod wire;

pub use server::{RendezvousServer, ServerConfig, Timeouts};
pub use wire::{Message, MessageType};
