//! SCP protocol types and constants.

use std::fmt;

/// Mask applied to permissions before they are put on a `C`/`D` line.
pub const SCP_MODE_MASK: u32 = 0o7777;

/// Options accepted ahead of `-t`/`-f` in an scp invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScpOptions {
    /// `-r`
    pub recursive: bool,
    /// `-p`
    pub preserve_times: bool,
    /// `-d`
    pub target_is_dir: bool,
}

/// SCP command parsed from exec request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScpCommand {
    /// scp -t (to/upload)
    Sink { path: String, options: ScpOptions },
    /// scp -f (from/download)
    Source { path: String, options: ScpOptions },
    /// Started with `scp ` but did not match the grammar
    Invalid { command: String },
}

/// One newline-terminated command record of the scp stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScpRecord {
    /// `T<mtime> 0 <atime> 0`
    Times { mtime: u32, atime: u32 },
    /// `C<mode> <size> <name>`
    File { mode: u32, size: u64, name: String },
    /// `D<mode> 0 <name>`
    Dir { mode: u32, name: String },
    /// `E`
    EndDir,
}

impl ScpRecord {
    /// Renders the record including its trailing newline.
    pub fn to_line(&self) -> Vec<u8> {
        format!("{self}\n").into_bytes()
    }
}

impl fmt::Display for ScpRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Times { mtime, atime } => write!(f, "T{mtime} 0 {atime} 0"),
            Self::File { mode, size, name } => {
                write!(f, "C{:04o} {size} {name}", mode & SCP_MODE_MASK)
            }
            Self::Dir { mode, name } => write!(f, "D{:04o} 0 {name}", mode & SCP_MODE_MASK),
            Self::EndDir => write!(f, "E"),
        }
    }
}

/// Single-byte responses the client sends after each command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ScpAck {
    Ok = 0,
    /// Followed by a message line; the transfer continues.
    Warning = 1,
    Fatal = 2,
}

impl ScpAck {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Ok),
            1 => Some(Self::Warning),
            2 => Some(Self::Fatal),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_lines() {
        let file = ScpRecord::File {
            mode: 0o100644,
            size: 1234,
            name: "test.txt".into(),
        };
        assert_eq!(file.to_line(), b"C0644 1234 test.txt\n");

        let dir = ScpRecord::Dir {
            mode: 0o40755,
            name: "sub".into(),
        };
        assert_eq!(dir.to_string(), "D0755 0 sub");
        assert_eq!(ScpRecord::EndDir.to_line(), b"E\n");
        assert_eq!(
            ScpRecord::Times {
                mtime: 200,
                atime: 100
            }
            .to_string(),
            "T200 0 100 0"
        );
    }

    #[test]
    fn test_ack_bytes() {
        assert_eq!(ScpAck::from_u8(0), Some(ScpAck::Ok));
        assert_eq!(ScpAck::from_u8(2), Some(ScpAck::Fatal));
        assert_eq!(ScpAck::from_u8(b'x'), None);
    }
}
