mod connection;
mod multiplexer;
mod processor;
mod streams;

pub use connection::Connection;
pub use multiplexer::{Multiplexer, MultiplexerRegistry};
pub use processor::{Processor, RunnerStream, CHANNEL_CAPACITY};
pub use streams::Streams;
