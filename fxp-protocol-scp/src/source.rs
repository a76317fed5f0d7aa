//! `scp -f`: walks the backend and sends its files to the client.
//!
//! Directory descent uses an explicit stack of [`StackEntry`] frames, one
//! step per call to `process_stack`, so the walk can stop at any point to
//! wait for an ack or for the channel to drain.

use std::collections::VecDeque;

use fxp_common::{ScpConfig, StatusCode};
use fxp_protocol_sftp::{FileAttributes, OpenFlags, SftpServer};
use tracing::*;

use crate::channel::ScpChannel;
use crate::reply::ScpBackend;
use crate::types::{ScpAck, ScpOptions, ScpRecord};
use crate::wildcard::{self, Wildcard};
use crate::ScpServer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeKind {
    /// The path from the command line, not yet looked at
    RootPath,
    /// A file or directory that passed the filters and is due to be sent
    Name,
    /// An open directory handle being listed
    ReadDir,
    /// An open file handle being streamed
    ReadFile,
}

#[derive(Debug)]
struct StackEntry {
    kind: NodeKind,
    path: String,
    handle: Vec<u8>,
    wildcard: Option<Wildcard>,
    attrs: FileAttributes,
}

impl StackEntry {
    fn new(kind: NodeKind, path: String) -> Self {
        Self {
            kind,
            path,
            handle: Vec::new(),
            wildcard: None,
            attrs: FileAttributes::default(),
        }
    }
}

fn leaf_name(path: &str) -> &str {
    path.rsplit_once('/').map(|(_, leaf)| leaf).unwrap_or(path)
}

fn join_path(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

pub struct ScpSource<C, S> {
    channel: C,
    backend: ScpBackend<S>,
    options: ScpOptions,
    max_backlog: usize,
    read_chunk_size: u64,

    stack: Vec<StackEntry>,
    /// Records waiting for an ack each. An empty record stands for the
    /// ack that has to arrive between a `C` line and its data.
    pending_commands: VecDeque<Vec<u8>>,
    acks: usize,
    expect_newline: bool,
    client_message: Vec<u8>,
    eof: bool,
    throttled: bool,
    finished: bool,
    queued: bool,

    file_offset: u64,
    file_size: u64,
}

impl<C: ScpChannel, S: SftpServer> ScpSource<C, S> {
    pub fn new(channel: C, server: S, path: &str, options: ScpOptions, config: &ScpConfig) -> Self {
        info!(%path, recursive = options.recursive, "Starting scp source");
        Self {
            channel,
            backend: ScpBackend::new(server),
            options,
            max_backlog: config.max_backlog,
            read_chunk_size: config.read_chunk_size.max(1),
            stack: vec![StackEntry::new(NodeKind::RootPath, path.to_string())],
            pending_commands: VecDeque::new(),
            acks: 0,
            expect_newline: false,
            client_message: Vec::new(),
            eof: false,
            throttled: false,
            finished: false,
            queued: false,
            file_offset: 0,
            file_size: 0,
        }
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.channel
    }

    pub fn server(&self) -> &S {
        self.backend.server()
    }

    fn requeue(&mut self) {
        self.queued = true;
    }

    /// Reports a problem on stderr without ending the session.
    fn report_error(&mut self, message: &str) {
        debug!(%message, "scp source error");
        self.channel.write_stderr(message.as_bytes());
        self.channel.write_stderr(b"\n");
    }

    fn abort(&mut self, message: &str) {
        warn!(%message, "Aborting scp source");
        self.channel.write_stderr(message.as_bytes());
        self.channel.write_stderr(b"\n");
        self.release_handles();
        self.pending_commands.clear();
        self.channel.send_exit_status(1);
        self.channel.write_eof();
        self.channel.initiate_close(Some(message));
        self.finished = true;
    }

    fn finish(&mut self) {
        info!("scp source finished");
        self.channel.send_exit_status(0);
        self.channel.write_eof();
        self.channel.initiate_close(None);
        self.finished = true;
    }

    fn close_handle(&mut self, entry: &StackEntry) {
        if entry.handle.is_empty() {
            return;
        }
        if let Err(error) = self.backend.close(&entry.handle) {
            warn!(path = %entry.path, %error, "Failed to close handle");
        }
    }

    fn release_handles(&mut self) {
        for entry in std::mem::take(&mut self.stack).into_iter().rev() {
            self.close_handle(&entry);
        }
    }

    /// Queues a `C` or `D` record, preceded by `T` when times are preserved.
    fn queue_header(&mut self, record: ScpRecord, attrs: &FileAttributes) {
        if self.options.preserve_times {
            if let Some((atime, mtime)) = attrs.times {
                self.pending_commands
                    .push_back(ScpRecord::Times { mtime, atime }.to_line());
            }
        }
        let is_file = matches!(record, ScpRecord::File { .. });
        self.pending_commands.push_back(record.to_line());
        if is_file {
            self.pending_commands.push_back(Vec::new());
        }
    }

    fn push_name(&mut self, path: String, attrs: FileAttributes, wildcard: Option<Wildcard>) {
        if attrs.permissions.is_none() {
            return self.report_error(&format!("unable to read file permissions for {path}"));
        }
        if attrs.is_dir() {
            if !self.options.recursive && wildcard.is_none() {
                return self.report_error(&format!("{path}: is a directory"));
            }
        } else if attrs.size.is_none() {
            return self.report_error(&format!("unable to read file size for {path}"));
        }

        let mut entry = StackEntry::new(NodeKind::Name, path);
        entry.attrs = attrs;
        entry.wildcard = wildcard;
        self.stack.push(entry);
    }

    fn resolve_root(&mut self) {
        let Some(root) = self.stack.pop() else {
            return;
        };

        let (path, wildcard) = match wildcard::unescape(&root.path) {
            Some(path) => (path, None),
            None => {
                let (dir, pattern) = root
                    .path
                    .rsplit_once('/')
                    .unwrap_or((".", root.path.as_str()));
                let Some(mut dir) = wildcard::unescape(dir) else {
                    return self.abort(
                        "scp: wildcards in path components before the file name not supported",
                    );
                };
                if dir.is_empty() {
                    dir.push('/');
                }
                match Wildcard::new(pattern) {
                    Ok(wildcard) => (dir, Some(wildcard)),
                    Err(error) => {
                        return self.abort(&format!("scp: invalid wildcard '{pattern}': {error}"))
                    }
                }
            }
        };

        match self.backend.stat(&path) {
            Ok(attrs) => {
                self.push_name(path, attrs, wildcard);
                self.requeue();
            }
            Err(error) => self.abort(&format!("{path}: unable to access: {error}")),
        }
    }

    fn read_directory(&mut self, node: StackEntry) {
        match self.backend.readdir_one(&node.handle) {
            Ok(name) => {
                let skip = name.filename == "."
                    || name.filename == ".."
                    || node
                        .wildcard
                        .as_ref()
                        .is_some_and(|w| !w.matches(&name.filename));
                let child = (!skip).then(|| join_path(&node.path, &name.filename));
                self.stack.push(node);
                if let Some(child) = child {
                    self.push_name(child, name.attrs, None);
                }
            }
            Err(error) => {
                if !error.is_eof() {
                    self.report_error(&format!("{}: unable to list directory: {error}", node.path));
                }
                self.close_handle(&node);
                if node.wildcard.is_none() {
                    self.pending_commands.push_back(ScpRecord::EndDir.to_line());
                }
            }
        }
    }

    fn enter_directory(&mut self, mut node: StackEntry) {
        if node.wildcard.is_none() {
            let record = ScpRecord::Dir {
                mode: node.attrs.permissions.unwrap_or(0),
                name: leaf_name(&node.path).to_string(),
            };
            self.queue_header(record, &node.attrs);
        }

        match self.backend.opendir(&node.path) {
            Ok(handle) => {
                debug!(path = %node.path, "Entering directory");
                node.kind = NodeKind::ReadDir;
                node.handle = handle;
                self.stack.push(node);
            }
            Err(error) => {
                self.report_error(&format!("{}: unable to access: {error}", node.path));
                if node.wildcard.is_none() {
                    self.pending_commands.push_back(ScpRecord::EndDir.to_line());
                }
            }
        }
    }

    fn start_file(&mut self, mut node: StackEntry) {
        let handle = match self
            .backend
            .open(&node.path, OpenFlags::READ, &FileAttributes::default())
        {
            Ok(handle) => handle,
            Err(error) => {
                return self.report_error(&format!("{}: unable to open: {error}", node.path));
            }
        };
        node.handle = handle;

        let size = match self.backend.fstat(&node.handle) {
            Ok(attrs) => attrs.size.or(node.attrs.size).unwrap_or(0),
            Err(error) => {
                self.report_error(&format!("{}: unable to stat: {error}", node.path));
                return self.close_handle(&node);
            }
        };

        debug!(path = %node.path, size, "Sending file");
        self.file_offset = 0;
        self.file_size = size;
        let record = ScpRecord::File {
            mode: node.attrs.permissions.unwrap_or(0),
            size,
            name: leaf_name(&node.path).to_string(),
        };
        self.queue_header(record, &node.attrs);
        node.kind = NodeKind::ReadFile;
        self.stack.push(node);
    }

    fn send_file_data(&mut self) {
        let Some(entry) = self.stack.last() else {
            return;
        };

        let remaining = self.file_size.saturating_sub(self.file_offset);
        if remaining > 0 {
            let limit = remaining.min(self.read_chunk_size) as u32;
            match self.backend.read(&entry.handle, self.file_offset, limit) {
                Ok(mut data) if !data.is_empty() => {
                    data.truncate(limit as usize);
                    self.file_offset += data.len() as u64;
                    let backlog = self.channel.write(&data);
                    if backlog < self.max_backlog {
                        self.requeue();
                    }
                }
                Ok(_) => {
                    let message = format!("{}: unable to read: {}", entry.path, StatusCode::Eof);
                    self.abort(&message);
                }
                Err(error) => {
                    let message = format!("{}: unable to read: {error}", entry.path);
                    self.abort(&message);
                }
            }
            return;
        }

        self.channel.write(b"\0");
        if let Some(entry) = self.stack.pop() {
            self.close_handle(&entry);
        }
        self.requeue();
    }

    fn process_stack(&mut self) {
        if self.finished || self.throttled {
            return;
        }

        while !self.pending_commands.is_empty() {
            if self.eof {
                return self.abort("scp: received client EOF, abandoning transfer");
            }
            if self.acks == 0 {
                return;
            }
            self.acks -= 1;
            if let Some(command) = self.pending_commands.pop_front() {
                if !command.is_empty() {
                    self.channel.write(&command);
                }
            }
        }

        let Some(top) = self.stack.last() else {
            return self.finish();
        };
        match top.kind {
            NodeKind::RootPath => return self.resolve_root(),
            NodeKind::ReadFile => return self.send_file_data(),
            NodeKind::Name | NodeKind::ReadDir => {}
        }

        let Some(node) = self.stack.pop() else {
            return;
        };
        match node.kind {
            NodeKind::ReadDir => self.read_directory(node),
            _ if node.attrs.is_dir() => self.enter_directory(node),
            _ => self.start_file(node),
        }
        self.requeue();
    }
}

impl<C: ScpChannel, S: SftpServer> ScpServer for ScpSource<C, S> {
    fn send(&mut self, data: &[u8]) {
        if self.finished {
            return;
        }

        for &byte in data {
            if self.expect_newline {
                if byte == b'\n' {
                    let message = String::from_utf8_lossy(&self.client_message);
                    warn!(%message, "scp client reported an error");
                    self.client_message.clear();
                    self.expect_newline = false;
                    self.acks += 1;
                } else {
                    self.client_message.push(byte);
                }
                continue;
            }

            match ScpAck::from_u8(byte) {
                Some(ScpAck::Ok) => self.acks += 1,
                Some(ScpAck::Warning) => self.expect_newline = true,
                Some(ScpAck::Fatal) => {
                    return self.abort("terminating on fatal error from client");
                }
                None => return self.abort("unrecognised response code from client"),
            }
        }

        self.process_stack();
    }

    fn throttle(&mut self, throttled: bool) {
        if self.finished {
            return;
        }
        self.throttled = throttled;
        if !throttled {
            self.process_stack();
        }
    }

    fn eof(&mut self) {
        if self.finished {
            return;
        }
        self.eof = true;
        self.process_stack();
    }

    fn has_queued(&self) -> bool {
        self.queued
    }

    fn run_queued(&mut self) -> bool {
        if !std::mem::take(&mut self.queued) {
            return false;
        }
        self.process_stack();
        true
    }

    fn is_finished(&self) -> bool {
        self.finished
    }
}
