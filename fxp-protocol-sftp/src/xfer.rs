//! Windowed transfer manager
//!
//! Keeps several reads (or writes) in flight at once on top of
//! [`SftpClient`]. Replies may complete in any order; downloaded data is
//! handed back strictly in offset order.

use std::collections::VecDeque;

use bytes::Bytes;
use fxp_common::{FxpError, FxpResult, TransferConfig};
use tracing::*;

use crate::client::{FileHandle, SftpClient, SftpRequest, SftpTransport};
use crate::codec::Packet;

#[derive(Debug, Clone, PartialEq, Eq)]
enum RequestState {
    Pending,
    Complete(Bytes),
    /// End of file or a failed read; dropped without being delivered
    Discarded,
}

#[derive(Debug)]
struct TransferRequest {
    id: u32,
    offset: u64,
    len: u32,
    state: RequestState,
}

#[derive(Debug)]
pub struct Transfer {
    handle: FileHandle,
    tag: u64,
    offset: u64,
    furthest_data: u64,
    file_size: u64,
    in_flight: u64,
    window_size: u64,
    chunk_size: u32,
    eof: bool,
    err: bool,
    queue: VecDeque<TransferRequest>,
}

impl Transfer {
    fn new<T: SftpTransport>(
        client: &mut SftpClient<T>,
        handle: FileHandle,
        offset: u64,
        config: &TransferConfig,
    ) -> Self {
        // The window always admits at least one non-empty read.
        let chunk_size = config.read_chunk_size.max(1);
        Self {
            handle,
            tag: client.alloc_tag(),
            offset,
            furthest_data: 0,
            file_size: u64::MAX,
            in_flight: 0,
            window_size: config.window_size.max(chunk_size as u64),
            chunk_size,
            eof: false,
            err: false,
            queue: VecDeque::new(),
        }
    }

    /// Starts a download from `offset` and fills the read window.
    pub fn download_init<T: SftpTransport>(
        client: &mut SftpClient<T>,
        handle: FileHandle,
        offset: u64,
        config: &TransferConfig,
    ) -> FxpResult<Self> {
        let mut xfer = Self::new(client, handle, offset, config);
        xfer.download_queue(client)?;
        Ok(xfer)
    }

    /// Tops the read window back up.
    pub fn download_queue<T: SftpTransport>(&mut self, client: &mut SftpClient<T>) -> FxpResult<()> {
        while self.in_flight < self.window_size && !self.eof && !self.err {
            if self.offset >= self.file_size {
                // A short read already marked the end of the file.
                self.eof = true;
                break;
            }

            let mut req = client.read_send(&self.handle, self.offset, self.chunk_size)?;
            client.set_userdata(&mut req, self.tag);
            debug!(request_id = req.id, offset = self.offset, "Queueing read request");
            self.queue.push_back(TransferRequest {
                id: req.id,
                offset: self.offset,
                len: self.chunk_size,
                state: RequestState::Pending,
            });
            self.offset += self.chunk_size as u64;
            self.in_flight += self.chunk_size as u64;
        }
        Ok(())
    }

    fn claim<T: SftpTransport>(
        &self,
        client: &mut SftpClient<T>,
        pkt: &mut Packet,
        direction: &str,
    ) -> FxpResult<(SftpRequest, usize)> {
        let req = client.find_request(pkt)?;
        let index = self
            .queue
            .iter()
            .position(|r| r.id == req.id)
            .filter(|_| req.userdata == Some(self.tag));
        match index {
            Some(index) => Ok((req, index)),
            None => Err(FxpError::protocol(format!(
                "request ID is not part of the current {direction}"
            ))),
        }
    }

    /// Handles the reply to one of this download's reads.
    pub fn download_gotpkt<T: SftpTransport>(
        &mut self,
        client: &mut SftpClient<T>,
        mut pkt: Packet,
    ) -> FxpResult<()> {
        let (req, index) = self.claim(client, &mut pkt, "download")?;
        let (offset, len) = (self.queue[index].offset, self.queue[index].len);

        let returned = match client.read_recv(pkt, req, len) {
            Ok(Some(data)) if !data.is_empty() => {
                let returned = data.len() as u64;
                self.queue[index].state = RequestState::Complete(data);
                returned
            }
            Ok(_) => {
                debug!(offset, "Setting eof");
                self.eof = true;
                self.queue[index].state = RequestState::Discarded;
                0
            }
            Err(e) => {
                warn!(offset, error = %e, "Read request failed");
                self.err = true;
                self.queue[index].state = RequestState::Discarded;
                return Err(e);
            }
        };

        if returned > 0 && self.furthest_data < offset {
            self.furthest_data = offset;
        }
        if returned < len as u64 {
            // Provisional end of file; only legal if nothing past it
            // ever returns data.
            let file_size = offset + returned;
            if self.file_size > file_size {
                debug!(file_size, "Short block, narrowing file size");
                self.file_size = file_size;
            }
        }
        if self.furthest_data > self.file_size {
            self.err = true;
            return Err(FxpError::ShortReadInconsistency);
        }
        Ok(())
    }

    /// Pops the next in-order block of downloaded data, if the head of
    /// the window has completed.
    pub fn download_data(&mut self) -> Option<Bytes> {
        while let Some(head) = self.queue.front() {
            if head.state == RequestState::Pending {
                break;
            }
            let head = self.queue.pop_front()?;
            self.in_flight -= head.len as u64;
            match head.state {
                RequestState::Complete(data) => return Some(data),
                _ => debug!(offset = head.offset, "Skipping failed read request"),
            }
        }
        None
    }

    /// Starts an upload at `offset`. The caller decides when all data has
    /// been supplied, so [`done`](Self::done) only waits for the writes.
    pub fn upload_init<T: SftpTransport>(
        client: &mut SftpClient<T>,
        handle: FileHandle,
        offset: u64,
        config: &TransferConfig,
    ) -> Self {
        let mut xfer = Self::new(client, handle, offset, config);
        xfer.eof = true;
        xfer
    }

    pub fn upload_ready<T: SftpTransport>(&self, client: &SftpClient<T>) -> bool {
        client.transport().send_buffer() == 0
    }

    pub fn upload_data<T: SftpTransport>(&mut self, client: &mut SftpClient<T>, data: &[u8]) -> FxpResult<()> {
        let mut req = client.write_send(&self.handle, self.offset, data)?;
        client.set_userdata(&mut req, self.tag);
        debug!(request_id = req.id, offset = self.offset, len = data.len(), "Queueing write request");
        self.queue.push_back(TransferRequest {
            id: req.id,
            offset: self.offset,
            len: data.len() as u32,
            state: RequestState::Pending,
        });
        self.offset += data.len() as u64;
        self.in_flight += data.len() as u64;
        Ok(())
    }

    /// Handles the reply to one of this upload's writes.
    pub fn upload_gotpkt<T: SftpTransport>(&mut self, client: &mut SftpClient<T>, mut pkt: Packet) -> FxpResult<()> {
        let (req, index) = self.claim(client, &mut pkt, "upload")?;
        if let Some(done) = self.queue.remove(index) {
            self.in_flight -= done.len as u64;
        }
        client.write_recv(pkt, req)
    }

    pub fn done(&self) -> bool {
        (self.eof || self.err) && self.queue.is_empty()
    }

    pub fn set_error(&mut self) {
        self.err = true;
    }

    /// The file size implied by a short read, once one has been seen.
    pub fn file_size(&self) -> Option<u64> {
        (self.file_size != u64::MAX).then_some(self.file_size)
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Bytes requested but not yet handed back.
    pub fn in_flight(&self) -> u64 {
        self.in_flight
    }

    /// Gives the handle back for closing. Requests still in flight are
    /// forgotten.
    pub fn into_handle(self) -> FileHandle {
        self.handle
    }
}
