use std::fmt::Display;

/// SFTP status codes (`SSH_FX_*`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum StatusCode {
    Ok = 0,
    Eof = 1,
    NoSuchFile = 2,
    PermissionDenied = 3,
    Failure = 4,
    BadMessage = 5,
    NoConnection = 6,
    ConnectionLost = 7,
    OpUnsupported = 8,
}

impl StatusCode {
    pub fn from_u32(code: u32) -> Option<Self> {
        Some(match code {
            0 => Self::Ok,
            1 => Self::Eof,
            2 => Self::NoSuchFile,
            3 => Self::PermissionDenied,
            4 => Self::Failure,
            5 => Self::BadMessage,
            6 => Self::NoConnection,
            7 => Self::ConnectionLost,
            8 => Self::OpUnsupported,
            _ => return None,
        })
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

impl Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The OK text only ever shows up when something other than a
        // status reply was expected.
        match self {
            Self::Ok => write!(f, "unexpected OK response"),
            Self::Eof => write!(f, "end of file"),
            Self::NoSuchFile => write!(f, "no such file or directory"),
            Self::PermissionDenied => write!(f, "permission denied"),
            Self::Failure => write!(f, "failure"),
            Self::BadMessage => write!(f, "bad message"),
            Self::NoConnection => write!(f, "no connection"),
            Self::ConnectionLost => write!(f, "connection lost"),
            Self::OpUnsupported => write!(f, "operation unsupported"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_mapping() {
        for code in 0..=8 {
            let status = StatusCode::from_u32(code).unwrap();
            assert_eq!(status.as_u32(), code);
        }
        assert!(StatusCode::from_u32(9).is_none());
        assert_eq!(StatusCode::OpUnsupported.to_string(), "operation unsupported");
    }
}
