//! SFTP request dispatcher (server side)
//!
//! Decodes a single request, hands it to the backend and returns the
//! encoded reply. Holds no state between requests.

use fxp_common::{FxpResult, ServerConfig, StatusCode};
use tracing::*;

use crate::attrs::FileAttributes;
use crate::codec::{Packet, PacketBuilder};
use crate::server::{SftpReplyBuilder, SftpServer};
use crate::types::{OpenFlags, PacketType, SFTP_PROTO_VERSION};

/// Reply builder that encodes straight into a reply packet carrying the
/// request id.
#[derive(Debug)]
pub struct DefaultReplyBuilder {
    pkt: PacketBuilder,
    replied: bool,
}

impl DefaultReplyBuilder {
    pub fn new(request_id: u32) -> Self {
        let mut pkt = PacketBuilder::new(PacketType::Status);
        pkt.put_u32(request_id);
        Self {
            pkt,
            replied: false,
        }
    }

    pub fn has_replied(&self) -> bool {
        self.replied
    }

    pub fn into_packet(self) -> PacketBuilder {
        self.pkt
    }

    fn start(&mut self, packet_type: PacketType) -> &mut PacketBuilder {
        self.replied = true;
        self.pkt.set_type(packet_type);
        &mut self.pkt
    }
}

impl SftpReplyBuilder for DefaultReplyBuilder {
    fn reply_ok(&mut self) {
        self.reply_error(StatusCode::Ok, "");
    }

    fn reply_error(&mut self, code: StatusCode, message: &str) {
        let pkt = self.start(PacketType::Status);
        pkt.put_u32(code.as_u32());
        pkt.put_str(message);
        // language tag
        pkt.put_str("");
    }

    fn reply_name_count(&mut self, count: u32) {
        self.start(PacketType::Name).put_u32(count);
    }

    fn reply_full_name(&mut self, name: &str, longname: &str, attrs: &FileAttributes) {
        let pkt = self.start(PacketType::Name);
        pkt.put_str(name);
        pkt.put_str(longname);
        pkt.put_attrs(attrs);
    }

    fn reply_handle(&mut self, handle: &[u8]) {
        self.start(PacketType::Handle).put_string(handle);
    }

    fn reply_data(&mut self, data: &[u8]) {
        self.start(PacketType::Data).put_string(data);
    }

    fn reply_attrs(&mut self, attrs: &FileAttributes) {
        self.start(PacketType::Attrs).put_attrs(attrs);
    }
}

/// Handles one request packet and returns the reply to send back.
///
/// Decode failures are answered with `SSH_FX_BAD_MESSAGE` and unknown
/// request types with `SSH_FX_OP_UNSUPPORTED`; nothing here is fatal to
/// the session. Paths that are not valid UTF-8 reach the backend with
/// the offending bytes replaced.
pub fn handle_request(
    srv: &mut dyn SftpServer,
    mut req: Packet,
    config: &ServerConfig,
) -> PacketBuilder {
    if req.kind() == Some(PacketType::Init) {
        // Only the lowest version is supported, so the client's own
        // version need not be read.
        let mut reply = PacketBuilder::new(PacketType::Version);
        reply.put_u32(SFTP_PROTO_VERSION);
        return reply;
    }

    let request_id = req.get_u32();
    let mut reply = DefaultReplyBuilder::new(*request_id.as_ref().unwrap_or(&0));
    let result = request_id.and_then(|_| dispatch(srv, &mut reply, &mut req, config));

    if let Err(error) = result {
        debug!(packet_type = req.raw_type(), error = %error, "Unable to decode SFTP request");
        reply.reply_error(StatusCode::BadMessage, "Unable to decode request");
    } else if !reply.has_replied() {
        warn!(packet_type = req.raw_type(), "SFTP backend produced no reply");
        reply.reply_error(StatusCode::Failure, "");
    }
    reply.into_packet()
}

fn dispatch(
    srv: &mut dyn SftpServer,
    reply: &mut DefaultReplyBuilder,
    req: &mut Packet,
    config: &ServerConfig,
) -> FxpResult<()> {
    let Some(packet_type) = req.kind() else {
        reply.reply_error(StatusCode::OpUnsupported, "Unrecognised request type");
        return Ok(());
    };

    match packet_type {
        PacketType::Realpath => {
            let path = req.get_str_lossy()?;
            srv.realpath(reply, &path);
        }
        PacketType::Open => {
            let path = req.get_str_lossy()?;
            let flags = OpenFlags::from_bits_retain(req.get_u32()?);
            let attrs = req.get_attrs()?;
            if !flags.intersects(OpenFlags::READ | OpenFlags::WRITE) {
                reply.reply_error(StatusCode::BadMessage, "open without READ or WRITE flag");
            } else if flags.contains(OpenFlags::TRUNC) && !flags.contains(OpenFlags::CREAT) {
                reply.reply_error(StatusCode::BadMessage, "open with TRUNC but not CREAT");
            } else if flags.contains(OpenFlags::EXCL) && !flags.contains(OpenFlags::CREAT) {
                reply.reply_error(StatusCode::BadMessage, "open with EXCL but not CREAT");
            } else {
                srv.open(reply, &path, flags, &attrs);
            }
        }
        PacketType::Opendir => {
            let path = req.get_str_lossy()?;
            srv.opendir(reply, &path);
        }
        PacketType::Close => {
            let handle = req.get_string()?;
            srv.close(reply, &handle);
        }
        PacketType::Mkdir => {
            let path = req.get_str_lossy()?;
            let attrs = req.get_attrs()?;
            srv.mkdir(reply, &path, &attrs);
        }
        PacketType::Rmdir => {
            let path = req.get_str_lossy()?;
            srv.rmdir(reply, &path);
        }
        PacketType::Remove => {
            let path = req.get_str_lossy()?;
            srv.remove(reply, &path);
        }
        PacketType::Rename => {
            let from = req.get_str_lossy()?;
            let to = req.get_str_lossy()?;
            srv.rename(reply, &from, &to);
        }
        PacketType::Stat => {
            let path = req.get_str_lossy()?;
            srv.stat(reply, &path, true);
        }
        PacketType::Lstat => {
            let path = req.get_str_lossy()?;
            srv.stat(reply, &path, false);
        }
        PacketType::Fstat => {
            let handle = req.get_string()?;
            srv.fstat(reply, &handle);
        }
        PacketType::Setstat => {
            let path = req.get_str_lossy()?;
            let attrs = req.get_attrs()?;
            srv.setstat(reply, &path, &attrs);
        }
        PacketType::Fsetstat => {
            let handle = req.get_string()?;
            let attrs = req.get_attrs()?;
            srv.fsetstat(reply, &handle, &attrs);
        }
        PacketType::Read => {
            let handle = req.get_string()?;
            let offset = req.get_u64()?;
            let length = req.get_u32()?;
            srv.read(reply, &handle, offset, length);
        }
        PacketType::Readdir => {
            let handle = req.get_string()?;
            srv.readdir(reply, &handle, config.max_readdir_entries, false);
        }
        PacketType::Write => {
            let handle = req.get_string()?;
            let offset = req.get_u64()?;
            let data = req.get_string()?;
            srv.write(reply, &handle, offset, &data);
        }
        _ => reply.reply_error(StatusCode::OpUnsupported, "Unrecognised request type"),
    }
    Ok(())
}
