//! In-memory filesystem backend
//!
//! A complete [`SftpServer`] over a tree held in a `BTreeMap`. Hosts use
//! it as a scratch store and the protocol tests use it as their backend.

use std::collections::{BTreeMap, HashMap};

use fxp_common::StatusCode;
use tracing::*;

use crate::attrs::FileAttributes;
use crate::server::{Name, SftpReplyBuilder, SftpServer};
use crate::types::{OpenFlags, PERMS_DIRECTORY};

const PERMS_REGULAR: u32 = 0o100000;
const PERMS_MODE_MASK: u32 = 0o7777;

/// Largest file the store will grow to.
pub const MAX_FILE_SIZE: usize = 1 << 30;

/// End offset of `len` bytes written at `offset`, if it stays within
/// [`MAX_FILE_SIZE`].
fn checked_end(offset: u64, len: usize) -> Option<usize> {
    usize::try_from(offset)
        .ok()
        .and_then(|offset| offset.checked_add(len))
        .filter(|&end| end <= MAX_FILE_SIZE)
}

#[derive(Debug, Clone)]
enum NodeKind {
    File(Vec<u8>),
    Dir,
}

#[derive(Debug, Clone)]
struct Node {
    kind: NodeKind,
    mode: u32,
    uid_gid: Option<(u32, u32)>,
    times: Option<(u32, u32)>,
}

impl Node {
    fn attrs(&self) -> FileAttributes {
        let (size, type_bits) = match &self.kind {
            NodeKind::File(data) => (data.len() as u64, PERMS_REGULAR),
            NodeKind::Dir => (0, PERMS_DIRECTORY),
        };
        FileAttributes {
            size: Some(size),
            uid_gid: self.uid_gid,
            permissions: Some(type_bits | self.mode),
            times: self.times,
        }
    }

    fn apply(&mut self, attrs: &FileAttributes) -> Result<(), &'static str> {
        if let (Some(size), NodeKind::File(data)) = (attrs.size, &mut self.kind) {
            let size = checked_end(size, 0).ok_or("File too large")?;
            data.resize(size, 0);
        }
        if let Some(permissions) = attrs.permissions {
            self.mode = permissions & PERMS_MODE_MASK;
        }
        if attrs.uid_gid.is_some() {
            self.uid_gid = attrs.uid_gid;
        }
        if attrs.times.is_some() {
            self.times = attrs.times;
        }
        Ok(())
    }
}

#[derive(Debug)]
enum OpenHandle {
    File {
        path: String,
        flags: OpenFlags,
    },
    Dir {
        entries: Vec<Name>,
        position: usize,
    },
}

#[derive(Debug)]
pub struct MemoryFs {
    nodes: BTreeMap<String, Node>,
    handles: HashMap<Vec<u8>, OpenHandle>,
    next_handle: u64,
    files_opened: usize,
    reverse_listing: bool,
    denied: Vec<String>,
}

impl Default for MemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

/// Canonical key of a path: components joined by `/`, root is `""`.
fn normalise(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            part => parts.push(part),
        }
    }
    parts.join("/")
}

fn parent_of(key: &str) -> &str {
    key.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("")
}

fn leaf_of(key: &str) -> &str {
    key.rsplit_once('/').map(|(_, leaf)| leaf).unwrap_or(key)
}

fn longname(name: &str, attrs: &FileAttributes) -> String {
    format!(
        "{:06o} {:>10} {}",
        attrs.permissions.unwrap_or(0),
        attrs.size.unwrap_or(0),
        name
    )
}

impl MemoryFs {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            String::new(),
            Node {
                kind: NodeKind::Dir,
                mode: 0o755,
                uid_gid: None,
                times: None,
            },
        );
        Self {
            nodes,
            handles: HashMap::new(),
            next_handle: 0,
            files_opened: 0,
            reverse_listing: false,
            denied: Vec::new(),
        }
    }

    /// Lists directories in reverse name order.
    pub fn with_reversed_listing(mut self) -> Self {
        self.reverse_listing = true;
        self
    }

    /// Creates a directory and any missing parents.
    pub fn add_dir(&mut self, path: &str) {
        let key = normalise(path);
        let mut prefix = String::new();
        for part in key.split('/').filter(|p| !p.is_empty()) {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(part);
            self.nodes.entry(prefix.clone()).or_insert(Node {
                kind: NodeKind::Dir,
                mode: 0o755,
                uid_gid: None,
                times: None,
            });
        }
    }

    /// Creates or replaces a file, creating missing parent directories.
    pub fn add_file(&mut self, path: &str, contents: &[u8]) {
        let key = normalise(path);
        self.add_dir(parent_of(&key));
        self.nodes.insert(
            key,
            Node {
                kind: NodeKind::File(contents.to_vec()),
                mode: 0o644,
                uid_gid: None,
                times: None,
            },
        );
    }

    pub fn set_times(&mut self, path: &str, atime: u32, mtime: u32) {
        if let Some(node) = self.nodes.get_mut(&normalise(path)) {
            node.times = Some((atime, mtime));
        }
    }

    /// Makes every open of `path` fail with `PermissionDenied`.
    pub fn deny(&mut self, path: &str) {
        self.denied.push(normalise(path));
    }

    pub fn file_contents(&self, path: &str) -> Option<&[u8]> {
        match &self.nodes.get(&normalise(path))?.kind {
            NodeKind::File(data) => Some(data),
            NodeKind::Dir => None,
        }
    }

    pub fn attrs_of(&self, path: &str) -> Option<FileAttributes> {
        self.nodes.get(&normalise(path)).map(Node::attrs)
    }

    pub fn is_dir(&self, path: &str) -> bool {
        matches!(
            self.nodes.get(&normalise(path)).map(|n| &n.kind),
            Some(NodeKind::Dir)
        )
    }

    pub fn exists(&self, path: &str) -> bool {
        self.nodes.contains_key(&normalise(path))
    }

    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    /// Number of successful file opens so far.
    pub fn files_opened(&self) -> usize {
        self.files_opened
    }

    fn new_handle(&mut self, handle: OpenHandle) -> Vec<u8> {
        let name = format!("h{}", self.next_handle).into_bytes();
        self.next_handle += 1;
        self.handles.insert(name.clone(), handle);
        name
    }

    fn children(&self, key: &str) -> Vec<(&str, &Node)> {
        let mut children: Vec<_> = self
            .nodes
            .iter()
            .filter(|(k, _)| !k.is_empty() && k.as_str() != key && parent_of(k) == key)
            .map(|(k, node)| (leaf_of(k), node))
            .collect();
        if self.reverse_listing {
            children.reverse();
        }
        children
    }

    fn parent_is_dir(&self, key: &str) -> bool {
        matches!(
            self.nodes.get(parent_of(key)).map(|n| &n.kind),
            Some(NodeKind::Dir)
        )
    }

    fn handle_path(&self, handle: &[u8]) -> Option<&str> {
        match self.handles.get(handle)? {
            OpenHandle::File { path, .. } => Some(path),
            OpenHandle::Dir { .. } => None,
        }
    }
}

impl SftpServer for MemoryFs {
    fn realpath(&mut self, reply: &mut dyn SftpReplyBuilder, path: &str) {
        reply.reply_simple_name(&format!("/{}", normalise(path)));
    }

    fn open(
        &mut self,
        reply: &mut dyn SftpReplyBuilder,
        path: &str,
        flags: OpenFlags,
        attrs: &FileAttributes,
    ) {
        let key = normalise(path);
        if self.denied.contains(&key) {
            return reply.reply_error(StatusCode::PermissionDenied, "Permission denied");
        }

        match self.nodes.get_mut(&key) {
            Some(Node {
                kind: NodeKind::Dir,
                ..
            }) => return reply.reply_error(StatusCode::Failure, "Is a directory"),
            Some(_) if flags.contains(OpenFlags::CREAT | OpenFlags::EXCL) => {
                return reply.reply_error(StatusCode::Failure, "File exists")
            }
            Some(node) => {
                if flags.contains(OpenFlags::TRUNC) {
                    if let NodeKind::File(data) = &mut node.kind {
                        data.clear();
                    }
                }
            }
            None if flags.contains(OpenFlags::CREAT) => {
                if !self.parent_is_dir(&key) {
                    return reply.reply_error(StatusCode::NoSuchFile, "No such file or directory");
                }
                let mut node = Node {
                    kind: NodeKind::File(Vec::new()),
                    mode: 0o644,
                    uid_gid: None,
                    times: None,
                };
                if let Err(message) = node.apply(&FileAttributes { size: None, ..*attrs }) {
                    return reply.reply_error(StatusCode::Failure, message);
                }
                self.nodes.insert(key.clone(), node);
            }
            None => return reply.reply_error(StatusCode::NoSuchFile, "No such file or directory"),
        }

        debug!(path = %key, ?flags, "Opened file");
        self.files_opened += 1;
        let handle = self.new_handle(OpenHandle::File { path: key, flags });
        reply.reply_handle(&handle);
    }

    fn opendir(&mut self, reply: &mut dyn SftpReplyBuilder, path: &str) {
        let key = normalise(path);
        if self.denied.contains(&key) {
            return reply.reply_error(StatusCode::PermissionDenied, "Permission denied");
        }
        let Some(node) = self.nodes.get(&key) else {
            return reply.reply_error(StatusCode::NoSuchFile, "No such file or directory");
        };
        if !matches!(node.kind, NodeKind::Dir) {
            return reply.reply_error(StatusCode::Failure, "Not a directory");
        }

        let parent_attrs = self
            .nodes
            .get(parent_of(&key))
            .map(Node::attrs)
            .unwrap_or_default();
        let mut entries = vec![Name::new(".", node.attrs()), Name::new("..", parent_attrs)];
        entries.extend(
            self.children(&key)
                .into_iter()
                .map(|(leaf, child)| Name::new(leaf, child.attrs())),
        );

        let handle = self.new_handle(OpenHandle::Dir {
            entries,
            position: 0,
        });
        reply.reply_handle(&handle);
    }

    fn close(&mut self, reply: &mut dyn SftpReplyBuilder, handle: &[u8]) {
        match self.handles.remove(handle) {
            Some(_) => reply.reply_ok(),
            None => reply.reply_error(StatusCode::Failure, "invalid file handle"),
        }
    }

    fn mkdir(&mut self, reply: &mut dyn SftpReplyBuilder, path: &str, attrs: &FileAttributes) {
        let key = normalise(path);
        if self.nodes.contains_key(&key) {
            return reply.reply_error(StatusCode::Failure, "File exists");
        }
        if !self.parent_is_dir(&key) {
            return reply.reply_error(StatusCode::NoSuchFile, "No such file or directory");
        }
        let mut node = Node {
            kind: NodeKind::Dir,
            mode: 0o755,
            uid_gid: None,
            times: None,
        };
        if let Err(message) = node.apply(attrs) {
            return reply.reply_error(StatusCode::Failure, message);
        }
        self.nodes.insert(key, node);
        reply.reply_ok();
    }

    fn rmdir(&mut self, reply: &mut dyn SftpReplyBuilder, path: &str) {
        let key = normalise(path);
        match self.nodes.get(&key).map(|n| &n.kind) {
            None => reply.reply_error(StatusCode::NoSuchFile, "No such file or directory"),
            Some(NodeKind::File(_)) => reply.reply_error(StatusCode::Failure, "Not a directory"),
            Some(NodeKind::Dir) if key.is_empty() || !self.children(&key).is_empty() => {
                reply.reply_error(StatusCode::Failure, "Directory not empty")
            }
            Some(NodeKind::Dir) => {
                self.nodes.remove(&key);
                reply.reply_ok();
            }
        }
    }

    fn remove(&mut self, reply: &mut dyn SftpReplyBuilder, path: &str) {
        let key = normalise(path);
        match self.nodes.get(&key).map(|n| &n.kind) {
            None => reply.reply_error(StatusCode::NoSuchFile, "No such file or directory"),
            Some(NodeKind::Dir) => reply.reply_error(StatusCode::Failure, "Is a directory"),
            Some(NodeKind::File(_)) => {
                self.nodes.remove(&key);
                reply.reply_ok();
            }
        }
    }

    fn rename(&mut self, reply: &mut dyn SftpReplyBuilder, from: &str, to: &str) {
        let from = normalise(from);
        let to = normalise(to);
        if from.is_empty() || !self.nodes.contains_key(&from) {
            return reply.reply_error(StatusCode::NoSuchFile, "No such file or directory");
        }
        if self.nodes.contains_key(&to) {
            return reply.reply_error(StatusCode::Failure, "File exists");
        }
        if !self.parent_is_dir(&to) || to.starts_with(&format!("{from}/")) {
            return reply.reply_error(StatusCode::Failure, "Invalid argument");
        }

        let prefix = format!("{from}/");
        let moved: Vec<String> = self
            .nodes
            .keys()
            .filter(|k| **k == from || k.starts_with(&prefix))
            .cloned()
            .collect();
        for old in moved {
            if let Some(node) = self.nodes.remove(&old) {
                let new = format!("{to}{}", &old[from.len()..]);
                self.nodes.insert(new, node);
            }
        }
        reply.reply_ok();
    }

    fn stat(&mut self, reply: &mut dyn SftpReplyBuilder, path: &str, _follow_symlinks: bool) {
        match self.nodes.get(&normalise(path)) {
            Some(node) => reply.reply_attrs(&node.attrs()),
            None => reply.reply_error(StatusCode::NoSuchFile, "No such file or directory"),
        }
    }

    fn fstat(&mut self, reply: &mut dyn SftpReplyBuilder, handle: &[u8]) {
        let attrs = self
            .handle_path(handle)
            .and_then(|path| self.nodes.get(path))
            .map(Node::attrs);
        match attrs {
            Some(attrs) => reply.reply_attrs(&attrs),
            None => reply.reply_error(StatusCode::Failure, "invalid file handle"),
        }
    }

    fn setstat(&mut self, reply: &mut dyn SftpReplyBuilder, path: &str, attrs: &FileAttributes) {
        match self.nodes.get_mut(&normalise(path)) {
            Some(node) => match node.apply(attrs) {
                Ok(()) => reply.reply_ok(),
                Err(message) => reply.reply_error(StatusCode::Failure, message),
            },
            None => reply.reply_error(StatusCode::NoSuchFile, "No such file or directory"),
        }
    }

    fn fsetstat(&mut self, reply: &mut dyn SftpReplyBuilder, handle: &[u8], attrs: &FileAttributes) {
        let Some(path) = self.handle_path(handle).map(str::to_owned) else {
            return reply.reply_error(StatusCode::Failure, "invalid file handle");
        };
        match self.nodes.get_mut(&path) {
            Some(node) => match node.apply(attrs) {
                Ok(()) => reply.reply_ok(),
                Err(message) => reply.reply_error(StatusCode::Failure, message),
            },
            None => reply.reply_error(StatusCode::NoSuchFile, "No such file or directory"),
        }
    }

    fn read(&mut self, reply: &mut dyn SftpReplyBuilder, handle: &[u8], offset: u64, length: u32) {
        let Some(OpenHandle::File { path, flags }) = self.handles.get(handle) else {
            return reply.reply_error(StatusCode::Failure, "invalid file handle");
        };
        if !flags.contains(OpenFlags::READ) {
            return reply.reply_error(StatusCode::PermissionDenied, "Bad file descriptor");
        }
        let Some(NodeKind::File(data)) = self.nodes.get(path).map(|n| &n.kind) else {
            return reply.reply_error(StatusCode::NoSuchFile, "No such file or directory");
        };

        let start = offset.min(data.len() as u64) as usize;
        if start >= data.len() {
            return reply.reply_error(StatusCode::Eof, "");
        }
        let end = data.len().min(start.saturating_add(length as usize));
        reply.reply_data(&data[start..end]);
    }

    fn write(&mut self, reply: &mut dyn SftpReplyBuilder, handle: &[u8], offset: u64, data: &[u8]) {
        let Some(OpenHandle::File { path, flags }) = self.handles.get(handle) else {
            return reply.reply_error(StatusCode::Failure, "invalid file handle");
        };
        if !flags.contains(OpenFlags::WRITE) {
            return reply.reply_error(StatusCode::PermissionDenied, "Bad file descriptor");
        }
        let append = flags.contains(OpenFlags::APPEND);
        let Some(NodeKind::File(contents)) = self.nodes.get_mut(path).map(|n| &mut n.kind) else {
            return reply.reply_error(StatusCode::NoSuchFile, "No such file or directory");
        };

        let offset = if append {
            contents.len() as u64
        } else {
            offset
        };
        let Some(end) = checked_end(offset, data.len()) else {
            warn!(offset, len = data.len(), "Refusing write past the file size limit");
            return reply.reply_error(StatusCode::Failure, "File too large");
        };
        let start = end - data.len();
        if contents.len() < end {
            contents.resize(end, 0);
        }
        contents[start..end].copy_from_slice(data);
        reply.reply_ok();
    }

    fn readdir(
        &mut self,
        reply: &mut dyn SftpReplyBuilder,
        handle: &[u8],
        max_entries: u32,
        omit_longname: bool,
    ) {
        let Some(OpenHandle::Dir { entries, position }) = self.handles.get_mut(handle) else {
            return reply.reply_error(StatusCode::Failure, "invalid directory handle");
        };
        if *position >= entries.len() {
            return reply.reply_error(StatusCode::Eof, "");
        }

        let batch = &entries[*position..];
        let batch = &batch[..batch.len().min(max_entries.max(1) as usize)];
        *position += batch.len();

        reply.reply_name_count(batch.len() as u32);
        for name in batch {
            let long = if omit_longname {
                String::new()
            } else {
                longname(&name.filename, &name.attrs)
            };
            reply.reply_full_name(&name.filename, &long, &name.attrs);
        }
    }
}
