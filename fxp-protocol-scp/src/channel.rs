/// The SSH channel an scp session talks through.
pub trait ScpChannel {
    /// Queues data on the channel's main stream, returning the number of
    /// bytes now buffered and not yet taken by the peer.
    fn write(&mut self, data: &[u8]) -> usize;
    fn write_stderr(&mut self, data: &[u8]);
    fn send_exit_status(&mut self, status: u32);
    fn write_eof(&mut self);
    fn initiate_close(&mut self, reason: Option<&str>);
}

#[cfg(test)]
pub(crate) mod tests {
    use super::ScpChannel;

    /// Records everything a session sends.
    #[derive(Debug, Default)]
    pub struct RecordingChannel {
        pub stdout: Vec<u8>,
        pub stderr: Vec<u8>,
        pub exit_status: Option<u32>,
        pub eof: bool,
        pub close_reason: Option<Option<String>>,
        /// Reported back from every `write`
        pub backlog: usize,
    }

    impl RecordingChannel {
        pub fn stderr_lines(&self) -> Vec<String> {
            String::from_utf8_lossy(&self.stderr)
                .lines()
                .map(str::to_string)
                .collect()
        }

        pub fn is_closed(&self) -> bool {
            self.close_reason.is_some()
        }
    }

    impl ScpChannel for RecordingChannel {
        fn write(&mut self, data: &[u8]) -> usize {
            assert!(!self.eof, "write after EOF");
            self.stdout.extend_from_slice(data);
            self.backlog
        }

        fn write_stderr(&mut self, data: &[u8]) {
            self.stderr.extend_from_slice(data);
        }

        fn send_exit_status(&mut self, status: u32) {
            assert!(self.exit_status.is_none(), "exit status sent twice");
            self.exit_status = Some(status);
        }

        fn write_eof(&mut self) {
            self.eof = true;
        }

        fn initiate_close(&mut self, reason: Option<&str>) {
            self.close_reason = Some(reason.map(str::to_string));
        }
    }
}
