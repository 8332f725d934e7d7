//! Topology graph of the site resource manager.
//!
//! - [`Graph`], [`Term`]: an in-memory triple store
//! - [`turtle`], [`ntriples`], [`jsonld`]: the published serializations,
//!   bundled by [`SerializedModel`]
//! - [`content`]: decoding and applying delta fragments
//! - [`ModelParser`]: graph → [`ActiveDeltas`](srm_types::ActiveDeltas)
//! - [`ModelWriter`]: active deltas and site topology → graph

pub mod content;
pub mod error;
pub mod format;
pub mod graph;
pub mod jsonld;
pub mod ntriples;
pub mod parser;
pub mod prefixes;
pub mod term;
pub mod turtle;
pub mod uri;
pub mod writer;

pub use content::{apply_delta, decode_content, DeltaContent};
pub use error::{ModelError, ModelResult};
pub use format::{ModelFormat, SerializedModel};
pub use graph::Graph;
pub use parser::{ModelParser, ParserContext, SwitchServices, MONITOR_TAG_PREFIX};
pub use prefixes::Prefixes;
pub use term::{Literal, Term, Triple};
pub use uri::{encode_port, SiteUris};
pub use writer::{monitor_status, ModelWriter, PortDescription};
