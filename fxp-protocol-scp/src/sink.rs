//! `scp -t`: receives files from the client and writes them to the backend.

use bytes::{Buf, BytesMut};
use fxp_protocol_sftp::{FileAttributes, OpenFlags, SftpServer};
use tracing::*;

use crate::channel::ScpChannel;
use crate::parser::ScpParser;
use crate::reply::ScpBackend;
use crate::types::{ScpOptions, ScpRecord};
use crate::ScpServer;

/// Where incoming records are written: the root target plus one entry per
/// open `D` record.
#[derive(Debug)]
struct SinkTarget {
    path: String,
    is_dir: bool,
}

#[derive(Debug)]
enum SinkState {
    /// The opening ack has not been sent yet
    Starting,
    AwaitingCommand,
    AwaitingFileBytes {
        handle: Vec<u8>,
        path: String,
        size: u64,
        offset: u64,
    },
    AwaitingTrailingZero {
        handle: Vec<u8>,
        path: String,
    },
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkProgress {
    NeedMoreData,
    Finished,
}

pub struct ScpSink<C, S> {
    channel: C,
    backend: ScpBackend<S>,
    parser: ScpParser,
    state: SinkState,
    buffer: BytesMut,
    targets: Vec<SinkTarget>,
    /// `(atime, mtime)` from a `T` record, applied to the next `C`/`D`
    times: Option<(u32, u32)>,
    input_eof: bool,
    queued: bool,
}

impl<C: ScpChannel, S: SftpServer> ScpSink<C, S> {
    pub fn new(channel: C, server: S, path: &str, options: ScpOptions) -> Self {
        let mut backend = ScpBackend::new(server);
        let is_dir = options.target_is_dir
            || backend
                .stat(path)
                .map(|attrs| attrs.is_dir())
                .unwrap_or(false);
        info!(%path, is_dir, "Starting scp sink");

        Self {
            channel,
            backend,
            parser: ScpParser::new(),
            state: SinkState::Starting,
            buffer: BytesMut::new(),
            targets: vec![SinkTarget {
                path: path.to_string(),
                is_dir,
            }],
            times: None,
            input_eof: false,
            queued: true,
        }
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn server(&self) -> &S {
        self.backend.server()
    }

    pub fn into_server(self) -> S {
        self.backend.into_server()
    }

    /// Buffers client data and runs the state machine as far as it goes.
    pub fn feed(&mut self, data: &[u8]) -> SinkProgress {
        if !self.input_eof && !self.is_finished() {
            self.buffer.extend_from_slice(data);
        }
        self.process();
        self.progress()
    }

    fn progress(&self) -> SinkProgress {
        match self.state {
            SinkState::Finished => SinkProgress::Finished,
            _ => SinkProgress::NeedMoreData,
        }
    }

    fn process(&mut self) {
        while self.step() {}
    }

    fn send_ack(&mut self) {
        self.channel.write(b"\0");
    }

    fn close_handle(&mut self, handle: &[u8], path: &str) {
        if let Err(error) = self.backend.close(handle) {
            warn!(%path, %error, "Failed to close file");
        }
    }

    fn done(&mut self, error: Option<String>) {
        match &error {
            Some(message) => {
                warn!(%message, "scp sink failed");
                self.channel.write_stderr(message.as_bytes());
                self.channel.write_stderr(b"\n");
                self.channel.send_exit_status(1);
            }
            None => {
                info!("scp sink finished");
                self.channel.send_exit_status(0);
            }
        }
        self.channel.write_eof();
        self.channel.initiate_close(error.as_deref());
        self.state = SinkState::Finished;
    }

    fn destination(&self, name: &str) -> String {
        match self.targets.last() {
            Some(target) if target.is_dir => {
                let mut path = target.path.clone();
                if !path.is_empty() && !path.ends_with('/') {
                    path.push('/');
                }
                path.push_str(name);
                path
            }
            Some(target) => target.path.clone(),
            None => name.to_string(),
        }
    }

    fn new_attrs(&mut self, mode: u32) -> FileAttributes {
        FileAttributes {
            permissions: Some(mode),
            times: self.times.take(),
            ..Default::default()
        }
    }

    fn handle_command(&mut self, line: &[u8]) {
        let Some(record) = self.parser.parse_record(line) else {
            let line = String::from_utf8_lossy(line);
            return self.done(Some(format!("unrecognised scp command '{line}'")));
        };
        debug!(%record, "Received scp record");

        match record {
            ScpRecord::Times { mtime, atime } => {
                self.times = Some((atime, mtime));
            }
            ScpRecord::Dir { mode, name } => {
                let path = self.destination(&name);
                let attrs = self.new_attrs(mode);
                if let Err(error) = self.backend.mkdir(&path, &attrs) {
                    return self.done(Some(format!(
                        "'{path}': unable to create directory: {error}"
                    )));
                }
                self.targets.push(SinkTarget { path, is_dir: true });
            }
            ScpRecord::File { mode, size, name } => {
                let path = self.destination(&name);
                let attrs = self.new_attrs(mode);
                let flags = OpenFlags::WRITE | OpenFlags::CREAT | OpenFlags::TRUNC;
                match self.backend.open(&path, flags, &attrs) {
                    Ok(handle) => {
                        debug!(%path, size, "Receiving file");
                        self.send_ack();
                        self.state = SinkState::AwaitingFileBytes {
                            handle,
                            path,
                            size,
                            offset: 0,
                        };
                        return;
                    }
                    Err(error) => {
                        return self.done(Some(format!("'{path}': unable to open file: {error}")));
                    }
                }
            }
            ScpRecord::EndDir => {
                if self.targets.len() <= 1 {
                    return self.done(Some("received E command without matching D".into()));
                }
                self.targets.pop();
                self.times = None;
            }
        }

        self.send_ack();
        self.state = SinkState::AwaitingCommand;
    }

    /// Advances the state machine once. Returns false when it has to wait
    /// for more input or has finished.
    fn step(&mut self) -> bool {
        match std::mem::replace(&mut self.state, SinkState::Finished) {
            SinkState::Starting => {
                self.send_ack();
                self.state = SinkState::AwaitingCommand;
                true
            }
            SinkState::AwaitingCommand => {
                let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') else {
                    if self.input_eof {
                        self.done(None);
                    } else {
                        self.state = SinkState::AwaitingCommand;
                    }
                    return false;
                };
                let line = self.buffer.split_to(newline + 1);
                self.handle_command(&line[..newline]);
                true
            }
            SinkState::AwaitingFileBytes {
                handle,
                path,
                size,
                offset,
            } => {
                if offset >= size {
                    self.state = SinkState::AwaitingTrailingZero { handle, path };
                    return true;
                }
                if self.buffer.is_empty() {
                    if self.input_eof {
                        self.close_handle(&handle, &path);
                        self.done(None);
                    } else {
                        self.state = SinkState::AwaitingFileBytes {
                            handle,
                            path,
                            size,
                            offset,
                        };
                    }
                    return false;
                }

                let len = (self.buffer.len() as u64).min(size - offset) as usize;
                if let Err(error) = self.backend.write(&handle, offset, &self.buffer[..len]) {
                    self.close_handle(&handle, &path);
                    self.done(Some(format!("'{path}': unable to write to file: {error}")));
                    return false;
                }
                self.buffer.advance(len);
                self.state = SinkState::AwaitingFileBytes {
                    handle,
                    path,
                    size,
                    offset: offset + len as u64,
                };
                true
            }
            SinkState::AwaitingTrailingZero { handle, path } => {
                if self.buffer.is_empty() {
                    if self.input_eof {
                        self.close_handle(&handle, &path);
                        self.done(None);
                    } else {
                        self.state = SinkState::AwaitingTrailingZero { handle, path };
                    }
                    return false;
                }

                let status = self.buffer.get_u8();
                self.close_handle(&handle, &path);
                if status != 0 {
                    self.done(Some(format!("'{path}': client failed to send file")));
                    return false;
                }
                self.send_ack();
                self.state = SinkState::AwaitingCommand;
                true
            }
            SinkState::Finished => false,
        }
    }
}

impl<C: ScpChannel, S: SftpServer> ScpServer for ScpSink<C, S> {
    fn send(&mut self, data: &[u8]) {
        self.feed(data);
    }

    fn throttle(&mut self, _throttled: bool) {}

    fn eof(&mut self) {
        if self.input_eof {
            return;
        }
        self.input_eof = true;
        self.process();
    }

    fn has_queued(&self) -> bool {
        self.queued
    }

    fn run_queued(&mut self) -> bool {
        if !std::mem::take(&mut self.queued) {
            return false;
        }
        self.process();
        true
    }

    fn is_finished(&self) -> bool {
        matches!(self.state, SinkState::Finished)
    }
}

#[cfg(test)]
mod tests {
    use fxp_protocol_sftp::MemoryFs;

    use super::*;
    use crate::channel::tests::RecordingChannel;

    type Sink = ScpSink<RecordingChannel, MemoryFs>;

    fn sink_with(fs: MemoryFs, path: &str, options: ScpOptions) -> Sink {
        let mut sink = ScpSink::new(RecordingChannel::default(), fs, path, options);
        assert!(sink.run_queued());
        assert_eq!(sink.channel().stdout, b"\0");
        sink
    }

    fn sink(path: &str) -> Sink {
        let mut fs = MemoryFs::new();
        fs.add_dir("dest");
        fs.add_file("dest/a", b"existing");
        sink_with(fs, path, ScpOptions::default())
    }

    fn acks(sink: &Sink) -> usize {
        let stdout = &sink.channel().stdout;
        assert!(stdout.iter().all(|&b| b == 0));
        stdout.len()
    }

    #[test]
    fn test_directory_then_end() {
        let mut sink = sink("dest");

        assert_eq!(sink.feed(b"D0755 0 sub\n"), SinkProgress::NeedMoreData);
        assert!(sink.server().is_dir("dest/sub"));
        assert_eq!(sink.feed(b"E\n"), SinkProgress::NeedMoreData);
        assert_eq!(sink.server().files_opened(), 0);
        assert_eq!(acks(&sink), 3);

        // back in the parent
        sink.feed(b"C0644 2 x\nhi\0");
        assert_eq!(sink.server().file_contents("dest/x"), Some(&b"hi"[..]));
        assert!(!sink.server().exists("dest/sub/x"));

        sink.eof();
        assert!(sink.is_finished());
        assert_eq!(sink.channel().exit_status, Some(0));
        assert_eq!(sink.channel().close_reason, Some(None));
    }

    #[test]
    fn test_file_fed_bytewise() {
        let mut sink = sink("dest");
        for byte in b"T200 0 100 0\nC0640 5 f.txt\nhello\0" {
            sink.feed(&[*byte]);
        }

        let fs = sink.server();
        assert_eq!(fs.file_contents("dest/f.txt"), Some(&b"hello"[..]));
        let attrs = fs.attrs_of("dest/f.txt").unwrap();
        assert_eq!(attrs.permissions.map(|p| p & 0o7777), Some(0o640));
        assert_eq!(attrs.times, Some((100, 200)));
        assert_eq!(fs.open_handles(), 0);
        // opening, after T, after the C line, after the file body
        assert_eq!(acks(&sink), 4);
    }

    #[test]
    fn test_times_apply_to_one_file() {
        let mut sink = sink("dest");
        sink.feed(b"T200 0 100 0\nC0644 1 one\n1\0C0644 1 two\n2\0");

        let fs = sink.server();
        assert_eq!(fs.attrs_of("dest/one").unwrap().times, Some((100, 200)));
        assert_eq!(fs.attrs_of("dest/two").unwrap().times, None);
    }

    #[test]
    fn test_empty_file() {
        let mut sink = sink("dest");
        sink.feed(b"C0644 0 empty\n\0");

        assert_eq!(sink.server().file_contents("dest/empty"), Some(&b""[..]));
        assert_eq!(sink.server().open_handles(), 0);
    }

    #[test]
    fn test_non_directory_target_used_verbatim() {
        let mut sink = sink("dest/renamed");
        sink.feed(b"C0644 3 whatever.txt\nabc\0");

        assert_eq!(sink.server().file_contents("dest/renamed"), Some(&b"abc"[..]));
        assert!(!sink.server().exists("dest/renamed/whatever.txt"));
    }

    #[test]
    fn test_target_is_dir_flag() {
        let options = ScpOptions {
            target_is_dir: true,
            ..Default::default()
        };
        let mut sink = sink_with(MemoryFs::new(), "missing", options);
        assert_eq!(sink.feed(b"C0644 1 f\n"), SinkProgress::Finished);

        let channel = sink.channel();
        assert_eq!(
            channel.stderr_lines(),
            vec!["'missing/f': unable to open file: No such file or directory"]
        );
        assert_eq!(channel.exit_status, Some(1));
    }

    #[test]
    fn test_unrecognised_command() {
        let mut sink = sink("dest");
        assert_eq!(sink.feed(b"X marks the spot\n"), SinkProgress::Finished);

        let channel = sink.channel();
        assert_eq!(
            channel.stderr_lines(),
            vec!["unrecognised scp command 'X marks the spot'"]
        );
        assert_eq!(channel.exit_status, Some(1));
        assert!(channel.eof);
        assert_eq!(
            channel.close_reason,
            Some(Some("unrecognised scp command 'X marks the spot'".into()))
        );

        sink.feed(b"C0644 1 f\nx\0");
        assert!(!sink.server().exists("dest/f"));
    }

    #[test]
    fn test_end_without_directory() {
        let mut sink = sink("dest");
        sink.feed(b"E\n");

        assert_eq!(
            sink.channel().stderr_lines(),
            vec!["received E command without matching D"]
        );
        assert_eq!(sink.channel().exit_status, Some(1));
    }

    #[test]
    fn test_mkdir_failure() {
        let mut sink = sink("dest");
        sink.feed(b"D0755 0 a\n");

        assert_eq!(
            sink.channel().stderr_lines(),
            vec!["'dest/a': unable to create directory: File exists"]
        );
        assert_eq!(sink.channel().exit_status, Some(1));
    }

    #[test]
    fn test_eof_inside_file() {
        let mut sink = sink("dest");
        sink.feed(b"C0644 10 partial\nabc");
        sink.eof();

        assert!(sink.is_finished());
        assert_eq!(sink.server().file_contents("dest/partial"), Some(&b"abc"[..]));
        assert_eq!(sink.server().open_handles(), 0);
        assert_eq!(sink.channel().exit_status, Some(0));
    }

    #[test]
    fn test_bad_trailing_byte() {
        let mut sink = sink("dest");
        sink.feed(b"C0644 2 f\nhi\x02");

        assert_eq!(
            sink.channel().stderr_lines(),
            vec!["'dest/f': client failed to send file"]
        );
        assert_eq!(sink.channel().exit_status, Some(1));
        assert_eq!(sink.server().open_handles(), 0);
    }
}
