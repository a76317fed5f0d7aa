//! SFTP client protocol
//!
//! Requests are sent with a `*_send` call that returns an [`SftpRequest`].
//! Replies may arrive in any order; [`SftpClient::find_request`] matches
//! an incoming packet back to its request, which is then handed to the
//! matching `*_recv` call together with the packet.

use bytes::Bytes;
use fxp_common::{ClientConfig, FxpError, FxpResult, StatusCode};
use tracing::*;

use crate::attrs::FileAttributes;
use crate::codec::{Packet, PacketBuilder};
use crate::server::Name;
use crate::types::{OpenFlags, PacketType, SFTP_PROTO_VERSION};

/// Minimum encoded size of one name entry: empty filename, empty
/// longname, attribute flags.
const MIN_NAME_LEN: usize = 12;

/// The byte pipe a client sends its requests through.
pub trait SftpTransport {
    fn send_data(&mut self, data: Bytes) -> FxpResult<()>;

    /// Bytes accepted by [`send_data`](Self::send_data) but not yet
    /// flushed to the peer.
    fn send_buffer(&self) -> usize;
}

/// An opaque handle to a remote file or directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileHandle(Bytes);

impl FileHandle {
    pub fn new(handle: Bytes) -> Self {
        Self(handle)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// An outstanding request, returned by `*_send` and consumed by the
/// matching `*_recv`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SftpRequest {
    pub id: u32,
    pub kind: PacketType,
    pub userdata: Option<u64>,
}

#[derive(Debug)]
pub struct SftpClient<T: SftpTransport> {
    transport: T,
    /// Outstanding requests, sorted by id
    pending: Vec<SftpRequest>,
    id_offset: u32,
    next_tag: u64,
}

/// Interprets an `SSH_FXP_STATUS` reply. `Ok(())` for `SSH_FX_OK`,
/// otherwise a status error (end of file included).
fn got_status(mut pkt: Packet) -> FxpResult<()> {
    if pkt.kind() != Some(PacketType::Status) {
        return Err(FxpError::protocol("expected FXP_STATUS packet"));
    }
    let code = pkt
        .get_u32()
        .map_err(|_| FxpError::protocol("malformed FXP_STATUS packet"))?;
    let Some(code) = StatusCode::from_u32(code) else {
        return Err(FxpError::status(StatusCode::Failure, "unknown error code"));
    };
    match code {
        StatusCode::Ok => Ok(()),
        code => {
            let message = pkt.get_str_lossy().unwrap_or_default();
            Err(FxpError::status(code, message))
        }
    }
}

/// Turns a status reply that arrived in place of the expected packet
/// type into an error.
fn unexpected(pkt: Packet) -> FxpError {
    match got_status(pkt) {
        Ok(()) => FxpError::status(StatusCode::Ok, ""),
        Err(e) => e,
    }
}

fn got_handle(mut pkt: Packet) -> FxpResult<FileHandle> {
    pkt.get_string()
        .map(FileHandle)
        .map_err(|_| FxpError::protocol("received malformed FXP_HANDLE"))
}

fn got_attrs(mut pkt: Packet) -> FxpResult<FileAttributes> {
    pkt.get_attrs()
        .map_err(|_| FxpError::protocol("malformed SSH_FXP_ATTRS packet"))
}

fn check_kind(req: &SftpRequest, kind: PacketType) -> FxpResult<()> {
    if req.kind != kind {
        return Err(FxpError::protocol(format!(
            "reply for {} handed to {} receiver",
            req.kind, kind
        )));
    }
    Ok(())
}

impl<T: SftpTransport> SftpClient<T> {
    pub fn new(transport: T, config: &ClientConfig) -> Self {
        Self {
            transport,
            pending: Vec::new(),
            id_offset: config.request_id_offset,
            next_tag: 0,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    /// Registers a new request under the lowest identifier not currently
    /// outstanding.
    ///
    /// Every request in the contiguous run starting at the offset has
    /// `id == index + offset`, so a binary search for the end of that run
    /// finds the first gap.
    pub fn allocate_request(&mut self, kind: PacketType) -> SftpRequest {
        let (mut low, mut high) = (0usize, self.pending.len());
        while low < high {
            let mid = (low + high) / 2;
            if self.pending[mid].id == mid as u32 + self.id_offset {
                low = mid + 1;
            } else {
                high = mid;
            }
        }

        let req = SftpRequest {
            id: low as u32 + self.id_offset,
            kind,
            userdata: None,
        };
        self.pending.insert(low, req.clone());
        req
    }

    /// Attaches caller context to an outstanding request.
    pub fn set_userdata(&mut self, req: &mut SftpRequest, userdata: u64) {
        req.userdata = Some(userdata);
        if let Ok(index) = self.pending.binary_search_by_key(&req.id, |r| r.id) {
            self.pending[index].userdata = Some(userdata);
        }
    }

    /// A fresh tag for use as request user data.
    pub fn alloc_tag(&mut self) -> u64 {
        self.next_tag += 1;
        self.next_tag
    }

    /// Reads the request id off a reply and unregisters the matching
    /// request.
    pub fn find_request(&mut self, pkt: &mut Packet) -> FxpResult<SftpRequest> {
        let id = pkt
            .get_u32()
            .map_err(|_| FxpError::protocol("did not receive a valid SFTP packet"))?;
        match self.pending.binary_search_by_key(&id, |r| r.id) {
            Ok(index) => Ok(self.pending.remove(index)),
            Err(_) => {
                warn!(request_id = id, "SFTP reply does not match any request");
                Err(FxpError::protocol("request ID mismatch"))
            }
        }
    }

    fn send(&mut self, kind: PacketType, build: impl FnOnce(&mut PacketBuilder)) -> FxpResult<SftpRequest> {
        let req = self.allocate_request(kind);
        let mut pkt = PacketBuilder::new(kind);
        pkt.put_u32(req.id);
        build(&mut pkt);
        debug!(request_id = req.id, packet_type = %kind, "Sending SFTP request");

        if let Err(e) = self.transport.send_data(pkt.finish()) {
            if let Ok(index) = self.pending.binary_search_by_key(&req.id, |r| r.id) {
                self.pending.remove(index);
            }
            return Err(e);
        }
        Ok(req)
    }

    pub fn init_send(&mut self) -> FxpResult<()> {
        let mut pkt = PacketBuilder::new(PacketType::Init);
        pkt.put_u32(SFTP_PROTO_VERSION);
        self.transport.send_data(pkt.finish())
    }

    /// Checks the server's `SSH_FXP_VERSION`, returning its version.
    /// Extension pairs are ignored.
    pub fn init_recv(&mut self, mut pkt: Packet) -> FxpResult<u32> {
        if pkt.kind() != Some(PacketType::Version) {
            return Err(FxpError::protocol("did not receive FXP_VERSION"));
        }
        let version = pkt
            .get_u32()
            .map_err(|_| FxpError::protocol("malformed FXP_VERSION packet"))?;
        if version > SFTP_PROTO_VERSION {
            return Err(FxpError::protocol(
                "remote protocol is more advanced than we support",
            ));
        }
        info!(version, "SFTP session initialised");
        Ok(version)
    }

    pub fn realpath_send(&mut self, path: impl AsRef<[u8]>) -> FxpResult<SftpRequest> {
        self.send(PacketType::Realpath, |pkt| pkt.put_string(path.as_ref()))
    }

    pub fn realpath_recv(&mut self, mut pkt: Packet, req: SftpRequest) -> FxpResult<String> {
        check_kind(&req, PacketType::Realpath)?;
        if pkt.kind() != Some(PacketType::Name) {
            return Err(unexpected(pkt));
        }
        match pkt.get_u32() {
            Ok(1) => {}
            _ => return Err(FxpError::protocol("REALPATH did not return name count of 1")),
        }
        pkt.get_str_lossy()
            .map_err(|_| FxpError::protocol("REALPATH returned malformed FXP_NAME"))
    }

    pub fn open_send(
        &mut self,
        path: impl AsRef<[u8]>,
        flags: OpenFlags,
        attrs: Option<&FileAttributes>,
    ) -> FxpResult<SftpRequest> {
        let attrs = attrs.copied().unwrap_or_default();
        self.send(PacketType::Open, |pkt| {
            pkt.put_string(path.as_ref());
            pkt.put_u32(flags.bits());
            pkt.put_attrs(&attrs);
        })
    }

    pub fn open_recv(&mut self, pkt: Packet, req: SftpRequest) -> FxpResult<FileHandle> {
        check_kind(&req, PacketType::Open)?;
        match pkt.kind() {
            Some(PacketType::Handle) => got_handle(pkt),
            _ => Err(unexpected(pkt)),
        }
    }

    pub fn opendir_send(&mut self, path: impl AsRef<[u8]>) -> FxpResult<SftpRequest> {
        self.send(PacketType::Opendir, |pkt| pkt.put_string(path.as_ref()))
    }

    pub fn opendir_recv(&mut self, pkt: Packet, req: SftpRequest) -> FxpResult<FileHandle> {
        check_kind(&req, PacketType::Opendir)?;
        match pkt.kind() {
            Some(PacketType::Handle) => got_handle(pkt),
            _ => Err(unexpected(pkt)),
        }
    }

    /// Closing consumes the handle whatever the server replies.
    pub fn close_send(&mut self, handle: FileHandle) -> FxpResult<SftpRequest> {
        self.send(PacketType::Close, |pkt| pkt.put_string(handle.as_bytes()))
    }

    pub fn close_recv(&mut self, pkt: Packet, req: SftpRequest) -> FxpResult<()> {
        check_kind(&req, PacketType::Close)?;
        got_status(pkt)
    }

    pub fn mkdir_send(&mut self, path: impl AsRef<[u8]>, attrs: Option<&FileAttributes>) -> FxpResult<SftpRequest> {
        let attrs = attrs.copied().unwrap_or_default();
        self.send(PacketType::Mkdir, |pkt| {
            pkt.put_string(path.as_ref());
            pkt.put_attrs(&attrs);
        })
    }

    pub fn mkdir_recv(&mut self, pkt: Packet, req: SftpRequest) -> FxpResult<()> {
        check_kind(&req, PacketType::Mkdir)?;
        got_status(pkt)
    }

    pub fn rmdir_send(&mut self, path: impl AsRef<[u8]>) -> FxpResult<SftpRequest> {
        self.send(PacketType::Rmdir, |pkt| pkt.put_string(path.as_ref()))
    }

    pub fn rmdir_recv(&mut self, pkt: Packet, req: SftpRequest) -> FxpResult<()> {
        check_kind(&req, PacketType::Rmdir)?;
        got_status(pkt)
    }

    pub fn remove_send(&mut self, path: impl AsRef<[u8]>) -> FxpResult<SftpRequest> {
        self.send(PacketType::Remove, |pkt| pkt.put_string(path.as_ref()))
    }

    pub fn remove_recv(&mut self, pkt: Packet, req: SftpRequest) -> FxpResult<()> {
        check_kind(&req, PacketType::Remove)?;
        got_status(pkt)
    }

    pub fn rename_send(&mut self, from: impl AsRef<[u8]>, to: impl AsRef<[u8]>) -> FxpResult<SftpRequest> {
        self.send(PacketType::Rename, |pkt| {
            pkt.put_string(from.as_ref());
            pkt.put_string(to.as_ref());
        })
    }

    pub fn rename_recv(&mut self, pkt: Packet, req: SftpRequest) -> FxpResult<()> {
        check_kind(&req, PacketType::Rename)?;
        got_status(pkt)
    }

    pub fn stat_send(&mut self, path: impl AsRef<[u8]>) -> FxpResult<SftpRequest> {
        self.send(PacketType::Stat, |pkt| pkt.put_string(path.as_ref()))
    }

    pub fn stat_recv(&mut self, pkt: Packet, req: SftpRequest) -> FxpResult<FileAttributes> {
        check_kind(&req, PacketType::Stat)?;
        match pkt.kind() {
            Some(PacketType::Attrs) => got_attrs(pkt),
            _ => Err(unexpected(pkt)),
        }
    }

    pub fn fstat_send(&mut self, handle: &FileHandle) -> FxpResult<SftpRequest> {
        self.send(PacketType::Fstat, |pkt| pkt.put_string(handle.as_bytes()))
    }

    pub fn fstat_recv(&mut self, pkt: Packet, req: SftpRequest) -> FxpResult<FileAttributes> {
        check_kind(&req, PacketType::Fstat)?;
        match pkt.kind() {
            Some(PacketType::Attrs) => got_attrs(pkt),
            _ => Err(unexpected(pkt)),
        }
    }

    pub fn setstat_send(&mut self, path: impl AsRef<[u8]>, attrs: &FileAttributes) -> FxpResult<SftpRequest> {
        self.send(PacketType::Setstat, |pkt| {
            pkt.put_string(path.as_ref());
            pkt.put_attrs(attrs);
        })
    }

    pub fn setstat_recv(&mut self, pkt: Packet, req: SftpRequest) -> FxpResult<()> {
        check_kind(&req, PacketType::Setstat)?;
        got_status(pkt)
    }

    pub fn fsetstat_send(&mut self, handle: &FileHandle, attrs: &FileAttributes) -> FxpResult<SftpRequest> {
        self.send(PacketType::Fsetstat, |pkt| {
            pkt.put_string(handle.as_bytes());
            pkt.put_attrs(attrs);
        })
    }

    pub fn fsetstat_recv(&mut self, pkt: Packet, req: SftpRequest) -> FxpResult<()> {
        check_kind(&req, PacketType::Fsetstat)?;
        got_status(pkt)
    }

    pub fn read_send(&mut self, handle: &FileHandle, offset: u64, len: u32) -> FxpResult<SftpRequest> {
        self.send(PacketType::Read, |pkt| {
            pkt.put_string(handle.as_bytes());
            pkt.put_u64(offset);
            pkt.put_u32(len);
        })
    }

    /// Returns the data read, or `None` at end of file. `len` is the
    /// length that was requested.
    pub fn read_recv(&mut self, mut pkt: Packet, req: SftpRequest, len: u32) -> FxpResult<Option<Bytes>> {
        check_kind(&req, PacketType::Read)?;
        if pkt.kind() != Some(PacketType::Data) {
            return match unexpected(pkt) {
                e if e.is_eof() => Ok(None),
                e => Err(e),
            };
        }
        let data = pkt
            .get_string()
            .map_err(|_| FxpError::protocol("READ returned malformed SSH_FXP_DATA packet"))?;
        if data.len() > len as usize {
            return Err(FxpError::protocol("READ returned more bytes than requested"));
        }
        Ok(Some(data))
    }

    pub fn readdir_send(&mut self, handle: &FileHandle) -> FxpResult<SftpRequest> {
        self.send(PacketType::Readdir, |pkt| pkt.put_string(handle.as_bytes()))
    }

    /// Returns the next batch of names, or `None` at end of directory.
    pub fn readdir_recv(&mut self, mut pkt: Packet, req: SftpRequest) -> FxpResult<Option<Vec<Name>>> {
        check_kind(&req, PacketType::Readdir)?;
        if pkt.kind() != Some(PacketType::Name) {
            return match unexpected(pkt) {
                e if e.is_eof() => Ok(None),
                e => Err(e),
            };
        }

        let count = pkt.get_u32()? as usize;
        if count > pkt.remaining() / MIN_NAME_LEN {
            return Err(FxpError::MalformedPacket("malformed FXP_NAME packet"));
        }
        let mut names = Vec::with_capacity(count);
        for _ in 0..count {
            let filename = pkt.get_string()?;
            let longname = pkt.get_str_lossy()?;
            names.push(Name::from_raw(filename, longname, pkt.get_attrs()?));
        }
        Ok(Some(names))
    }

    pub fn write_send(&mut self, handle: &FileHandle, offset: u64, data: &[u8]) -> FxpResult<SftpRequest> {
        self.send(PacketType::Write, |pkt| {
            pkt.put_string(handle.as_bytes());
            pkt.put_u64(offset);
            pkt.put_string(data);
        })
    }

    pub fn write_recv(&mut self, pkt: Packet, req: SftpRequest) -> FxpResult<()> {
        check_kind(&req, PacketType::Write)?;
        got_status(pkt)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Records every packet sent; the send buffer size is set by hand.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingTransport {
        pub sent: Vec<Bytes>,
        pub buffered: usize,
    }

    impl SftpTransport for RecordingTransport {
        fn send_data(&mut self, data: Bytes) -> FxpResult<()> {
            self.sent.push(data);
            Ok(())
        }

        fn send_buffer(&self) -> usize {
            self.buffered
        }
    }

    pub(crate) fn client() -> SftpClient<RecordingTransport> {
        SftpClient::new(RecordingTransport::default(), &ClientConfig::default())
    }

    fn reply(packet_type: PacketType, id: u32, build: impl FnOnce(&mut PacketBuilder)) -> Packet {
        let mut pkt = PacketBuilder::new(packet_type);
        pkt.put_u32(id);
        build(&mut pkt);
        pkt.into_packet()
    }

    pub(crate) fn status(id: u32, code: StatusCode) -> Packet {
        reply(PacketType::Status, id, |pkt| {
            pkt.put_u32(code.as_u32());
            pkt.put_str("");
            pkt.put_str("");
        })
    }

    pub(crate) fn data(id: u32, payload: &[u8]) -> Packet {
        reply(PacketType::Data, id, |pkt| pkt.put_string(payload))
    }

    #[test]
    fn test_allocation_is_lowest_free() {
        let mut client = client();
        let ids: Vec<u32> = (0..4)
            .map(|_| client.allocate_request(PacketType::Stat).id)
            .collect();
        assert_eq!(ids, vec![256, 257, 258, 259]);

        let mut pkt = status(256, StatusCode::Ok);
        assert_eq!(client.find_request(&mut pkt).unwrap().id, 256);
        assert_eq!(client.allocate_request(PacketType::Stat).id, 256);

        let mut pkt = status(258, StatusCode::Ok);
        client.find_request(&mut pkt).unwrap();
        assert_eq!(client.allocate_request(PacketType::Stat).id, 258);
        assert_eq!(client.allocate_request(PacketType::Stat).id, 260);
        assert_eq!(client.outstanding(), 5);
    }

    #[test]
    fn test_find_request_is_at_most_once() {
        let mut client = client();
        let mut req = client.stat_send("a").unwrap();
        let tag = client.alloc_tag();
        client.set_userdata(&mut req, tag);

        let mut pkt = status(req.id, StatusCode::NoSuchFile);
        let found = client.find_request(&mut pkt).unwrap();
        assert_eq!(found.userdata, Some(tag));

        let mut pkt = status(req.id, StatusCode::NoSuchFile);
        assert!(matches!(
            client.find_request(&mut pkt),
            Err(FxpError::ProtocolError(_))
        ));
    }

    #[test]
    fn test_init_handshake() {
        let mut client = client();
        client.init_send().unwrap();
        let sent = &client.transport().sent[0];
        assert_eq!(&sent[..], &[0, 0, 0, 5, 1, 0, 0, 0, 3]);

        let mut version = PacketBuilder::new(PacketType::Version);
        version.put_u32(3);
        version.put_str("ext@example.com");
        version.put_str("1");
        assert_eq!(client.init_recv(version.into_packet()).unwrap(), 3);

        let mut version = PacketBuilder::new(PacketType::Version);
        version.put_u32(6);
        assert!(client.init_recv(version.into_packet()).is_err());
        assert!(client.init_recv(status(0, StatusCode::Ok)).is_err());
    }

    #[test]
    fn test_open_read_close() {
        let mut client = client();
        let req = client
            .open_send("/etc/motd", OpenFlags::READ, None)
            .unwrap();
        let mut pkt = reply(PacketType::Handle, req.id, |pkt| pkt.put_string(b"h7"));
        let req = client.find_request(&mut pkt).unwrap();
        let handle = client.open_recv(pkt, req).unwrap();
        assert_eq!(handle.as_bytes(), b"h7");

        let req = client.read_send(&handle, 0, 4).unwrap();
        let mut pkt = data(req.id, b"toolong");
        let req = client.find_request(&mut pkt).unwrap();
        assert!(matches!(
            client.read_recv(pkt, req, 4),
            Err(FxpError::ProtocolError(_))
        ));

        let req = client.read_send(&handle, 4, 4).unwrap();
        let mut pkt = status(req.id, StatusCode::Eof);
        let req = client.find_request(&mut pkt).unwrap();
        assert_eq!(client.read_recv(pkt, req, 4).unwrap(), None);

        let req = client.close_send(handle).unwrap();
        let mut pkt = status(req.id, StatusCode::Ok);
        let req = client.find_request(&mut pkt).unwrap();
        client.close_recv(pkt, req).unwrap();
        assert_eq!(client.outstanding(), 0);
    }

    #[test]
    fn test_status_errors_carry_messages() {
        let mut client = client();
        let req = client.opendir_send("/root").unwrap();
        let mut pkt = reply(PacketType::Status, req.id, |pkt| {
            pkt.put_u32(StatusCode::PermissionDenied.as_u32());
            pkt.put_str("no access to /root");
            pkt.put_str("en");
        });
        let req = client.find_request(&mut pkt).unwrap();
        let err = client.opendir_recv(pkt, req).unwrap_err();
        assert_eq!(err.status_code(), Some(StatusCode::PermissionDenied));
        assert_eq!(err.to_string(), "no access to /root");

        // OK where a handle was expected
        let req = client.open_send("x", OpenFlags::READ, None).unwrap();
        let mut pkt = status(req.id, StatusCode::Ok);
        let req = client.find_request(&mut pkt).unwrap();
        let err = client.open_recv(pkt, req).unwrap_err();
        assert_eq!(err.to_string(), "unexpected OK response");

        let req = client.rmdir_send("d").unwrap();
        let mut pkt = status(req.id, StatusCode::ConnectionLost);
        let req = client.find_request(&mut pkt).unwrap();
        assert_eq!(
            client.rmdir_recv(pkt, req).unwrap_err().to_string(),
            "connection lost"
        );

        let req = client.remove_send("f").unwrap();
        let mut pkt = reply(PacketType::Status, req.id, |pkt| pkt.put_u32(42));
        let req = client.find_request(&mut pkt).unwrap();
        assert_eq!(
            client.remove_recv(pkt, req).unwrap_err().to_string(),
            "unknown error code"
        );
    }

    #[test]
    fn test_realpath_requires_single_name() {
        let mut client = client();
        let req = client.realpath_send(".").unwrap();
        let mut pkt = reply(PacketType::Name, req.id, |pkt| {
            pkt.put_u32(2);
            pkt.put_str("/a");
            pkt.put_str("");
            pkt.put_attrs(&FileAttributes::default());
        });
        let req = client.find_request(&mut pkt).unwrap();
        assert!(client.realpath_recv(pkt, req).is_err());

        let req = client.realpath_send(".").unwrap();
        let mut pkt = reply(PacketType::Name, req.id, |pkt| {
            pkt.put_u32(1);
            pkt.put_str("/home/user");
            pkt.put_str("");
            pkt.put_attrs(&FileAttributes::default());
        });
        let req = client.find_request(&mut pkt).unwrap();
        assert_eq!(client.realpath_recv(pkt, req).unwrap(), "/home/user");
    }

    #[test]
    fn test_readdir_names_and_sanity_check() {
        let mut client = client();
        let handle = FileHandle::new(Bytes::from_static(b"d0"));

        let req = client.readdir_send(&handle).unwrap();
        let mut pkt = reply(PacketType::Name, req.id, |pkt| {
            pkt.put_u32(2);
            for name in ["a.txt", "b.txt"] {
                pkt.put_str(name);
                pkt.put_str("");
                pkt.put_attrs(&FileAttributes {
                    size: Some(3),
                    ..Default::default()
                });
            }
        });
        let req = client.find_request(&mut pkt).unwrap();
        let names = client.readdir_recv(pkt, req).unwrap().unwrap();
        assert_eq!(names.len(), 2);
        assert_eq!(names[1].filename, "b.txt");
        assert_eq!(names[1].attrs.size, Some(3));

        let req = client.readdir_send(&handle).unwrap();
        let mut pkt = reply(PacketType::Name, req.id, |pkt| {
            pkt.put_u32(1000);
            pkt.put_str("x");
        });
        let req = client.find_request(&mut pkt).unwrap();
        assert!(matches!(
            client.readdir_recv(pkt, req),
            Err(FxpError::MalformedPacket(_))
        ));

        let req = client.readdir_send(&handle).unwrap();
        let mut pkt = status(req.id, StatusCode::Eof);
        let req = client.find_request(&mut pkt).unwrap();
        assert_eq!(client.readdir_recv(pkt, req).unwrap(), None);
    }

    #[test]
    fn test_readdir_keeps_non_utf8_names() {
        let mut client = client();
        let handle = FileHandle::new(Bytes::from_static(b"d0"));

        let req = client.readdir_send(&handle).unwrap();
        let mut pkt = reply(PacketType::Name, req.id, |pkt| {
            pkt.put_u32(2);
            for name in [&b"ok.txt"[..], &b"caf\xe9.txt"[..]] {
                pkt.put_string(name);
                pkt.put_string(b"-rw-r--r-- caf\xe9");
                pkt.put_attrs(&FileAttributes::default());
            }
        });
        let req = client.find_request(&mut pkt).unwrap();
        let names = client.readdir_recv(pkt, req).unwrap().unwrap();
        assert_eq!(names.len(), 2);
        assert_eq!(names[0].filename, "ok.txt");
        assert_eq!(names[1].filename, "caf\u{fffd}.txt");
        assert_eq!(&names[1].raw_filename[..], b"caf\xe9.txt");

        // The raw bytes go back out unchanged.
        client.transport_mut().sent.clear();
        client.stat_send(&names[1].raw_filename).unwrap();
        let sent = &client.transport().sent[0];
        assert!(sent.ends_with(b"\0\0\0\x08caf\xe9.txt"));
    }

    #[test]
    fn test_mismatched_receiver() {
        let mut client = client();
        let req = client.mkdir_send("d", None).unwrap();
        let mut pkt = status(req.id, StatusCode::Ok);
        let req = client.find_request(&mut pkt).unwrap();
        assert!(client.rename_recv(pkt, req).is_err());
    }
}
