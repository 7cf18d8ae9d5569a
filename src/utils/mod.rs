mod io;
mod other;

pub use io::{read_exact, ByteWriter, DbFile, Decodeable, Encodeable};
pub use other::{init_log, HandyRwLock};
