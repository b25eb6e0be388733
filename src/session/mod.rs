//! Engine internals: one actor task per conversation, plus the client and
//! listener plumbing that feeds it datagrams.

pub(crate) mod actor;
pub(crate) mod listener;
pub(crate) mod stream;

pub(crate) use listener::SessionListener;
pub(crate) use stream::KcpSession;
pub use stream::READ_CHUNK;

// Channel capacities
const CMD_QUEUE: usize = 64;
const INPUT_QUEUE: usize = 1024;
const DATA_QUEUE: usize = 256;
