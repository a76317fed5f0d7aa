//! SCP over the SFTP filesystem interface.
//!
//! An `scp -f`/`scp -t` exec request becomes an [`ScpSession`] that speaks
//! the legacy record protocol on an [`ScpChannel`] and does its file work
//! through any [`SftpServer`] backend.

mod channel;
mod error;
mod parser;
mod reply;
mod sink;
mod source;
mod types;
mod wildcard;

pub use channel::ScpChannel;
pub use error::ScpErrorReporter;
use fxp_common::ScpConfig;
use fxp_protocol_sftp::SftpServer;
pub use parser::ScpParser;
pub use sink::{ScpSink, SinkProgress};
pub use source::ScpSource;
pub use types::*;
pub use wildcard::{unescape as wildcard_unescape, Wildcard};

/// Channel-side entry points of a running scp session.
///
/// Sessions never block. Work that has to happen later is queued, and the
/// host drives it by calling [`run_queued`](Self::run_queued) until it
/// returns `false`.
pub trait ScpServer {
    /// Data received from the client.
    fn send(&mut self, data: &[u8]);
    /// The channel's outgoing buffer filled up (`true`) or drained (`false`).
    fn throttle(&mut self, throttled: bool);
    /// The client will send no more data.
    fn eof(&mut self);
    fn has_queued(&self) -> bool;
    /// Runs the queued step, if any. Returns whether one ran.
    fn run_queued(&mut self) -> bool;
    /// Exit status has been sent and the channel close initiated.
    fn is_finished(&self) -> bool;
}

pub enum ScpSession<C, S> {
    Source(ScpSource<C, S>),
    Sink(ScpSink<C, S>),
    Error(ScpErrorReporter<C>),
}

impl<C: ScpChannel, S: SftpServer> ScpSession<C, S> {
    pub fn new(command: ScpCommand, channel: C, server: S, config: &ScpConfig) -> Self {
        match command {
            ScpCommand::Source { path, options } => {
                Self::Source(ScpSource::new(channel, server, &path, options, config))
            }
            ScpCommand::Sink { path, options } => {
                Self::Sink(ScpSink::new(channel, server, &path, options))
            }
            ScpCommand::Invalid { command } => {
                Self::Error(ScpErrorReporter::new(channel, &command))
            }
        }
    }

    fn inner(&mut self) -> &mut dyn ScpServer {
        match self {
            Self::Source(s) => s,
            Self::Sink(s) => s,
            Self::Error(s) => s,
        }
    }

    fn inner_ref(&self) -> &dyn ScpServer {
        match self {
            Self::Source(s) => s,
            Self::Sink(s) => s,
            Self::Error(s) => s,
        }
    }
}

impl<C: ScpChannel, S: SftpServer> ScpServer for ScpSession<C, S> {
    fn send(&mut self, data: &[u8]) {
        self.inner().send(data)
    }

    fn throttle(&mut self, throttled: bool) {
        self.inner().throttle(throttled)
    }

    fn eof(&mut self) {
        self.inner().eof()
    }

    fn has_queued(&self) -> bool {
        self.inner_ref().has_queued()
    }

    fn run_queued(&mut self) -> bool {
        self.inner().run_queued()
    }

    fn is_finished(&self) -> bool {
        self.inner_ref().is_finished()
    }
}

/// Starts an scp session if `command` is an scp invocation.
///
/// Commands that do not start with `scp ` return `None`. A command that
/// does but is otherwise malformed still yields a session, which reports
/// the problem to the client.
pub fn recognise_exec<C: ScpChannel, S: SftpServer>(
    channel: C,
    server: S,
    command: &str,
    config: &ScpConfig,
) -> Option<ScpSession<C, S>> {
    let command = ScpParser::new().parse_command(command)?;
    Some(ScpSession::new(command, channel, server, config))
}
