//! SFTP protocol types and constants.

use std::fmt::Display;

use bitflags::bitflags;

/// The only protocol version spoken, in either direction.
pub const SFTP_PROTO_VERSION: u32 = 3;

/// Directory bit of the POSIX permissions word.
pub const PERMS_DIRECTORY: u32 = 0o040000;

/// SFTP packet types (`SSH_FXP_*`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Init = 1,
    Version = 2,
    Open = 3,
    Close = 4,
    Read = 5,
    Write = 6,
    Lstat = 7,
    Fstat = 8,
    Setstat = 9,
    Fsetstat = 10,
    Opendir = 11,
    Readdir = 12,
    Remove = 13,
    Mkdir = 14,
    Rmdir = 15,
    Realpath = 16,
    Stat = 17,
    Rename = 18,
    Status = 101,
    Handle = 102,
    Data = 103,
    Name = 104,
    Attrs = 105,
    Extended = 200,
    ExtendedReply = 201,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => Self::Init,
            2 => Self::Version,
            3 => Self::Open,
            4 => Self::Close,
            5 => Self::Read,
            6 => Self::Write,
            7 => Self::Lstat,
            8 => Self::Fstat,
            9 => Self::Setstat,
            10 => Self::Fsetstat,
            11 => Self::Opendir,
            12 => Self::Readdir,
            13 => Self::Remove,
            14 => Self::Mkdir,
            15 => Self::Rmdir,
            16 => Self::Realpath,
            17 => Self::Stat,
            18 => Self::Rename,
            101 => Self::Status,
            102 => Self::Handle,
            103 => Self::Data,
            104 => Self::Name,
            105 => Self::Attrs,
            200 => Self::Extended,
            201 => Self::ExtendedReply,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl Display for PacketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SSH_FXP_{}", format!("{self:?}").to_uppercase())
    }
}

bitflags! {
    /// `SSH_FXF_*` open flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: u32 {
        const READ = 0x00000001;
        const WRITE = 0x00000002;
        const APPEND = 0x00000004;
        const CREAT = 0x00000008;
        const TRUNC = 0x00000010;
        const EXCL = 0x00000020;
    }
}

bitflags! {
    /// `SSH_FILEXFER_ATTR_*` presence flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AttrFlags: u32 {
        const SIZE = 0x00000001;
        const UIDGID = 0x00000002;
        const PERMISSIONS = 0x00000004;
        const ACMODTIME = 0x00000008;
        const EXTENDED = 0x80000000;
    }
}
