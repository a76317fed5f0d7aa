//! Filesystem capability interface
//!
//! Both protocol front ends talk to a backend exclusively through
//! [`SftpServer`]. Every operation shapes its single reply through the
//! [`SftpReplyBuilder`] it is handed.

use bytes::Bytes;
use fxp_common::{FxpError, StatusCode};

use crate::attrs::FileAttributes;
use crate::types::OpenFlags;

/// One directory entry as carried by an `SSH_FXP_NAME` reply.
///
/// Filenames are byte strings on the wire. `filename` is their UTF-8
/// rendering for display and matching; follow-up requests for the entry
/// should send `raw_filename`, which holds the bytes exactly as received.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Name {
    pub filename: String,
    pub raw_filename: Bytes,
    pub longname: String,
    pub attrs: FileAttributes,
}

impl Name {
    pub fn new<S: Into<String>>(filename: S, attrs: FileAttributes) -> Self {
        let filename = filename.into();
        Self {
            raw_filename: Bytes::from(filename.clone().into_bytes()),
            filename,
            longname: String::new(),
            attrs,
        }
    }

    /// Builds an entry from a filename as received off the wire.
    pub fn from_raw(raw_filename: Bytes, longname: String, attrs: FileAttributes) -> Self {
        Self {
            filename: String::from_utf8_lossy(&raw_filename).into_owned(),
            raw_filename,
            longname,
            attrs,
        }
    }
}

/// The fixed set of reply shapes a backend operation may produce.
///
/// A name list is sent as [`reply_name_count`](Self::reply_name_count)
/// followed by exactly that many [`reply_full_name`](Self::reply_full_name)
/// calls.
pub trait SftpReplyBuilder {
    fn reply_ok(&mut self);
    fn reply_error(&mut self, code: StatusCode, message: &str);
    fn reply_name_count(&mut self, count: u32);
    fn reply_full_name(&mut self, name: &str, longname: &str, attrs: &FileAttributes);
    fn reply_handle(&mut self, handle: &[u8]);
    fn reply_data(&mut self, data: &[u8]);
    fn reply_attrs(&mut self, attrs: &FileAttributes);

    fn reply_simple_name(&mut self, name: &str) {
        self.reply_name_count(1);
        self.reply_full_name(name, "", &FileAttributes::default());
    }

    /// Reports a backend failure, mapping non-status errors to `Failure`.
    fn reply_fxp_error(&mut self, error: &FxpError) {
        let code = error.status_code().unwrap_or(StatusCode::Failure);
        self.reply_error(code, &error.to_string());
    }
}

/// A filesystem backend. Each call must invoke exactly one reply method
/// on `reply` before returning.
pub trait SftpServer {
    fn realpath(&mut self, reply: &mut dyn SftpReplyBuilder, path: &str);
    fn open(
        &mut self,
        reply: &mut dyn SftpReplyBuilder,
        path: &str,
        flags: OpenFlags,
        attrs: &FileAttributes,
    );
    fn opendir(&mut self, reply: &mut dyn SftpReplyBuilder, path: &str);
    fn close(&mut self, reply: &mut dyn SftpReplyBuilder, handle: &[u8]);
    fn mkdir(&mut self, reply: &mut dyn SftpReplyBuilder, path: &str, attrs: &FileAttributes);
    fn rmdir(&mut self, reply: &mut dyn SftpReplyBuilder, path: &str);
    fn remove(&mut self, reply: &mut dyn SftpReplyBuilder, path: &str);
    fn rename(&mut self, reply: &mut dyn SftpReplyBuilder, from: &str, to: &str);
    fn stat(&mut self, reply: &mut dyn SftpReplyBuilder, path: &str, follow_symlinks: bool);
    fn fstat(&mut self, reply: &mut dyn SftpReplyBuilder, handle: &[u8]);
    fn setstat(&mut self, reply: &mut dyn SftpReplyBuilder, path: &str, attrs: &FileAttributes);
    fn fsetstat(&mut self, reply: &mut dyn SftpReplyBuilder, handle: &[u8], attrs: &FileAttributes);
    fn read(&mut self, reply: &mut dyn SftpReplyBuilder, handle: &[u8], offset: u64, length: u32);
    fn write(&mut self, reply: &mut dyn SftpReplyBuilder, handle: &[u8], offset: u64, data: &[u8]);
    fn readdir(
        &mut self,
        reply: &mut dyn SftpReplyBuilder,
        handle: &[u8],
        max_entries: u32,
        omit_longname: bool,
    );
}
