mod in_memory;
mod log;

pub use in_memory::InMemoryLog;
pub use log::Entry;
pub use log::Log;
pub use log::Position;
pub use log::StorageError;
