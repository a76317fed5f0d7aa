use fxp_common::{FxpError, FxpResult, StatusCode};
use fxp_protocol_sftp::{FileAttributes, Name, OpenFlags, SftpReplyBuilder, SftpServer};

/// The single reply a backend operation produced.
#[derive(Debug, Default)]
pub(crate) enum Reply {
    #[default]
    None,
    Ok,
    Error {
        code: StatusCode,
        message: String,
    },
    Name(Name),
    Handle(Vec<u8>),
    Data(Vec<u8>),
    Attrs(FileAttributes),
}

/// Captures a backend's reply in memory instead of encoding it.
///
/// Name lists keep only their last entry, which is all the scp bridge asks
/// for.
#[derive(Debug, Default)]
pub(crate) struct ScpReplyReceiver {
    reply: Reply,
}

impl ScpReplyReceiver {
    pub fn take(&mut self) -> Reply {
        std::mem::take(&mut self.reply)
    }
}

impl SftpReplyBuilder for ScpReplyReceiver {
    fn reply_ok(&mut self) {
        self.reply = Reply::Ok;
    }

    fn reply_error(&mut self, code: StatusCode, message: &str) {
        self.reply = Reply::Error {
            code,
            message: message.to_string(),
        };
    }

    fn reply_name_count(&mut self, _count: u32) {}

    fn reply_full_name(&mut self, name: &str, longname: &str, attrs: &FileAttributes) {
        self.reply = Reply::Name(Name {
            longname: longname.to_string(),
            ..Name::new(name, *attrs)
        });
    }

    fn reply_handle(&mut self, handle: &[u8]) {
        self.reply = Reply::Handle(handle.to_vec());
    }

    fn reply_data(&mut self, data: &[u8]) {
        self.reply = Reply::Data(data.to_vec());
    }

    fn reply_attrs(&mut self, attrs: &FileAttributes) {
        self.reply = Reply::Attrs(*attrs);
    }
}

/// Calls into a filesystem backend and turns each reply into a `Result`.
pub(crate) struct ScpBackend<S> {
    server: S,
    receiver: ScpReplyReceiver,
}

macro_rules! expect_reply {
    ($reply:expr, $pattern:pat => $value:expr) => {
        match $reply {
            $pattern => Ok($value),
            Reply::Error { code, message } => Err(FxpError::status(code, message)),
            Reply::None => Err(FxpError::status(StatusCode::Failure, "")),
            _ => Err(FxpError::protocol("unexpected reply from backend")),
        }
    };
}

impl<S: SftpServer> ScpBackend<S> {
    pub fn new(server: S) -> Self {
        Self {
            server,
            receiver: ScpReplyReceiver::default(),
        }
    }

    pub fn server(&self) -> &S {
        &self.server
    }

    pub fn into_server(self) -> S {
        self.server
    }

    pub fn stat(&mut self, path: &str) -> FxpResult<FileAttributes> {
        self.server.stat(&mut self.receiver, path, true);
        expect_reply!(self.receiver.take(), Reply::Attrs(attrs) => attrs)
    }

    pub fn fstat(&mut self, handle: &[u8]) -> FxpResult<FileAttributes> {
        self.server.fstat(&mut self.receiver, handle);
        expect_reply!(self.receiver.take(), Reply::Attrs(attrs) => attrs)
    }

    pub fn open(
        &mut self,
        path: &str,
        flags: OpenFlags,
        attrs: &FileAttributes,
    ) -> FxpResult<Vec<u8>> {
        self.server.open(&mut self.receiver, path, flags, attrs);
        expect_reply!(self.receiver.take(), Reply::Handle(handle) => handle)
    }

    pub fn opendir(&mut self, path: &str) -> FxpResult<Vec<u8>> {
        self.server.opendir(&mut self.receiver, path);
        expect_reply!(self.receiver.take(), Reply::Handle(handle) => handle)
    }

    pub fn close(&mut self, handle: &[u8]) -> FxpResult<()> {
        self.server.close(&mut self.receiver, handle);
        expect_reply!(self.receiver.take(), Reply::Ok => ())
    }

    pub fn mkdir(&mut self, path: &str, attrs: &FileAttributes) -> FxpResult<()> {
        self.server.mkdir(&mut self.receiver, path, attrs);
        expect_reply!(self.receiver.take(), Reply::Ok => ())
    }

    pub fn read(&mut self, handle: &[u8], offset: u64, length: u32) -> FxpResult<Vec<u8>> {
        self.server.read(&mut self.receiver, handle, offset, length);
        expect_reply!(self.receiver.take(), Reply::Data(data) => data)
    }

    pub fn write(&mut self, handle: &[u8], offset: u64, data: &[u8]) -> FxpResult<()> {
        self.server.write(&mut self.receiver, handle, offset, data);
        expect_reply!(self.receiver.take(), Reply::Ok => ())
    }

    /// Reads the next single entry of an open directory.
    pub fn readdir_one(&mut self, handle: &[u8]) -> FxpResult<Name> {
        self.server.readdir(&mut self.receiver, handle, 1, true);
        expect_reply!(self.receiver.take(), Reply::Name(name) => name)
    }
}

#[cfg(test)]
mod tests {
    use fxp_protocol_sftp::MemoryFs;

    use super::*;

    #[test]
    fn test_backend_results() {
        let mut fs = MemoryFs::new();
        fs.add_file("dir/a.txt", b"abc");
        let mut backend = ScpBackend::new(fs);

        let attrs = backend.stat("dir/a.txt").unwrap();
        assert_eq!(attrs.size, Some(3));

        let handle = backend
            .open("dir/a.txt", OpenFlags::READ, &FileAttributes::default())
            .unwrap();
        assert_eq!(backend.read(&handle, 0, 10).unwrap(), b"abc");
        assert!(backend.read(&handle, 3, 10).unwrap_err().is_eof());
        backend.close(&handle).unwrap();
        assert_eq!(backend.server().open_handles(), 0);
    }

    #[test]
    fn test_backend_errors_carry_message() {
        let mut backend = ScpBackend::new(MemoryFs::new());

        let err = backend.stat("missing").unwrap_err();
        assert_eq!(err.status_code(), Some(StatusCode::NoSuchFile));
        assert_eq!(err.to_string(), "No such file or directory");
    }

    #[test]
    fn test_readdir_one_entry_at_a_time() {
        let mut fs = MemoryFs::new();
        fs.add_file("d/x", b"");
        let mut backend = ScpBackend::new(fs);

        let handle = backend.opendir("d").unwrap();
        let mut names = Vec::new();
        loop {
            match backend.readdir_one(&handle) {
                Ok(name) => names.push(name.filename),
                Err(e) => {
                    assert!(e.is_eof());
                    break;
                }
            }
        }
        assert_eq!(names, vec![".", "..", "x"]);
    }
}
