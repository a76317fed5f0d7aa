use tracing::*;

use crate::channel::ScpChannel;
use crate::ScpServer;

/// Stands in for a session whose `scp` command line could not be parsed.
/// Its only job is to report that and close the channel.
pub struct ScpErrorReporter<C> {
    channel: C,
    message: String,
    queued: bool,
    finished: bool,
}

impl<C: ScpChannel> ScpErrorReporter<C> {
    pub fn new(channel: C, command: &str) -> Self {
        Self {
            channel,
            message: format!("Unable to parse scp command: '{command}'"),
            queued: true,
            finished: false,
        }
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    fn report(&mut self) {
        warn!(message = %self.message, "Rejecting scp command");
        self.channel.write_stderr(self.message.as_bytes());
        self.channel.write_stderr(b"\n");
        self.channel.send_exit_status(1);
        self.channel.write_eof();
        self.channel.initiate_close(Some(&self.message));
        self.finished = true;
    }
}

impl<C: ScpChannel> ScpServer for ScpErrorReporter<C> {
    fn send(&mut self, _data: &[u8]) {}

    fn throttle(&mut self, _throttled: bool) {}

    fn eof(&mut self) {}

    fn has_queued(&self) -> bool {
        self.queued
    }

    fn run_queued(&mut self) -> bool {
        if !std::mem::take(&mut self.queued) {
            return false;
        }
        if !self.finished {
            self.report();
        }
        true
    }

    fn is_finished(&self) -> bool {
        self.finished
    }
}
