//! SFTP protocol engine: packet codec, capability interface, request
//! dispatcher, client protocol and windowed transfers.

mod attrs;
pub mod client;
pub mod codec;
pub mod dispatcher;
mod listing;
pub mod memfs;
pub mod server;
pub mod types;
pub mod xfer;

pub use attrs::FileAttributes;
pub use client::{FileHandle, SftpClient, SftpRequest, SftpTransport};
pub use codec::{parse_all_packets, read_packet, write_packet, Packet, PacketBuilder};
pub use dispatcher::{handle_request, DefaultReplyBuilder};
pub use listing::DirectoryListing;
pub use memfs::MemoryFs;
pub use server::{Name, SftpReplyBuilder, SftpServer};
pub use types::*;
pub use xfer::Transfer;
