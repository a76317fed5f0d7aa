use fxp_common::FxpResult;

use crate::codec::{Packet, PacketBuilder};
use crate::types::{AttrFlags, PERMS_DIRECTORY};

/// Sparse file attribute record. Only the fields that are `Some` go on
/// the wire, in the fixed order size, uid/gid, permissions, times.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileAttributes {
    pub size: Option<u64>,
    pub uid_gid: Option<(u32, u32)>,
    pub permissions: Option<u32>,
    /// `(atime, mtime)`
    pub times: Option<(u32, u32)>,
}

impl FileAttributes {
    pub fn flags(&self) -> AttrFlags {
        let mut flags = AttrFlags::empty();
        flags.set(AttrFlags::SIZE, self.size.is_some());
        flags.set(AttrFlags::UIDGID, self.uid_gid.is_some());
        flags.set(AttrFlags::PERMISSIONS, self.permissions.is_some());
        flags.set(AttrFlags::ACMODTIME, self.times.is_some());
        flags
    }

    pub fn is_dir(&self) -> bool {
        self.permissions
            .is_some_and(|perms| perms & PERMS_DIRECTORY != 0)
    }

    pub fn encode(&self, pkt: &mut PacketBuilder) {
        pkt.put_u32(self.flags().bits());
        if let Some(size) = self.size {
            pkt.put_u64(size);
        }
        if let Some((uid, gid)) = self.uid_gid {
            pkt.put_u32(uid);
            pkt.put_u32(gid);
        }
        if let Some(permissions) = self.permissions {
            pkt.put_u32(permissions);
        }
        if let Some((atime, mtime)) = self.times {
            pkt.put_u32(atime);
            pkt.put_u32(mtime);
        }
    }

    pub fn decode(pkt: &mut Packet) -> FxpResult<Self> {
        let flags = AttrFlags::from_bits_retain(pkt.get_u32()?);
        let mut attrs = Self::default();

        if flags.contains(AttrFlags::SIZE) {
            attrs.size = Some(pkt.get_u64()?);
        }
        if flags.contains(AttrFlags::UIDGID) {
            attrs.uid_gid = Some((pkt.get_u32()?, pkt.get_u32()?));
        }
        if flags.contains(AttrFlags::PERMISSIONS) {
            attrs.permissions = Some(pkt.get_u32()?);
        }
        if flags.contains(AttrFlags::ACMODTIME) {
            attrs.times = Some((pkt.get_u32()?, pkt.get_u32()?));
        }
        if flags.contains(AttrFlags::EXTENDED) {
            let count = pkt.get_u32()?;
            for _ in 0..count {
                pkt.get_string()?;
                pkt.get_string()?;
            }
        }
        Ok(attrs)
    }
}
