//! Application Ports (Driven)
//!
//! Interfaces the multiplexer uses to reach the outside world. Each port has
//! a production adapter under `infrastructure` and an in-memory stand-in in
//! the tests.
//!
//! - `Transport`: opens a bidirectional text-frame connection upstream
//! - `FrameCodec`: turns control frames into wire text and wire text into
//!   domain events
//! - `Clock` / `Scheduler`: time and deferred work, injectable so throttle
//!   windows and health ticks can be driven deterministically

mod clock_port;
mod codec_port;
mod transport_port;

pub use clock_port::{Clock, ScheduledTask, Scheduler};
pub use codec_port::{CodecError, FrameCodec};
#[cfg(test)]
pub use transport_port::MockTransport;
pub use transport_port::{FrameSink, FrameStream, Transport, TransportError, TransportLink};
