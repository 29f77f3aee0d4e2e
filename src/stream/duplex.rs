//! A stream that is both readable and writable over the same underlying
//! descriptor (a connected socket or a bidirectional pipe).

use super::{ReadableStream, WritableStream};

/// Pairs a [`ReadableStream`] and [`WritableStream`] driven by the same
/// source, matching the original's combined read/write stream type used for
/// connected sockets.
pub struct Duplex {
    pub readable: ReadableStream,
    pub writable: WritableStream,
}

impl Duplex {
    pub fn new(high_water_mark: usize) -> Duplex {
        Duplex {
            readable: ReadableStream::new(high_water_mark),
            writable: WritableStream::new(high_water_mark),
        }
    }
}

impl std::fmt::Debug for Duplex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Duplex")
            .field("readable", &self.readable)
            .field("writable", &self.writable)
            .finish()
    }
}
