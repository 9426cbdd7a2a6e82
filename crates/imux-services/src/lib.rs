//! imux-services — the routing and sequencing engine.
//!
//! Server side: [`registry`], [`router`] and [`fanout`]. Client side:
//! [`pool`], [`producer`] and [`reassembler`]. Both sides share the
//! [`sequencer`] and the [`link`] seam.

pub mod destination;
pub mod error;
pub mod fanout;
pub mod known_hosts;
pub mod link;
pub mod pool;
pub mod producer;
pub mod progress;
pub mod reassembler;
pub mod registry;
pub mod router;
pub mod sequencer;
pub mod work_queue;

pub use error::{ImuxError, Result};
pub use fanout::ResponseFanout;
pub use link::{next_link_id, ChunkSink, LinkId, LinkSender};
pub use registry::{Session, SessionRegistry, SessionSnapshot};
pub use router::DestinationRouter;
pub use sequencer::{ChunkSequencer, Direction, ReorderBuffer};
