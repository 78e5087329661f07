// Client-side packet processing.
//
// A download sends RRQ, then consumes DATA packets and answers each with an ACK. An upload sends
// WRQ, then consumes ACKs and answers each with the next DATA packet. In both directions the
// processor only decides what to do next; the session owns the socket and does the sending.

use crate::error::TransferError;
use crate::tftp;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{self, AsyncReadExt, AsyncWriteExt};

/// Where a transfer stands. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    AwaitingFirstReply,
    Transferring,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Download,
    Upload,
}

/// What a finished (or abandoned) transfer moved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSummary {
    pub direction: Direction,
    pub state: TransferState,
    pub bytes: u64,
    pub blocks: u64,
}

#[derive(Debug)]
pub enum PacketProcessor {
    Download(DownloadProcessor),
    Upload(UploadProcessor),
}

/// An entity that can process packets and produce a response.
impl PacketProcessor {
    /// Creates (or truncates) the local file the download is written to.
    pub async fn new_for_download(path: &Path) -> Result<PacketProcessor, io::Error> {
        log::info!("Downloading into {:#?}", path);
        if tokio::fs::metadata(path).await.is_ok() {
            log::warn!("Overwriting existing file {:#?} before the server has answered", path);
        }
        let f = File::create(path).await?;
        Ok(PacketProcessor::Download(DownloadProcessor::new(f)))
    }

    pub async fn new_for_upload(path: &Path) -> Result<PacketProcessor, io::Error> {
        log::info!("Uploading from {:#?}", path);
        let f = File::open(path).await?;
        Ok(PacketProcessor::Upload(UploadProcessor::new(f)))
    }

    pub fn direction(&self) -> Direction {
        match self {
            PacketProcessor::Download(_) => Direction::Download,
            PacketProcessor::Upload(_) => Direction::Upload,
        }
    }

    /// The request that opens the transfer. Always octet mode.
    pub fn request(&self, path: &str) -> tftp::Packet {
        let path = path.to_string();
        let mode = tftp::FileMode::Octet;
        match self {
            PacketProcessor::Download(_) => tftp::Packet::ReadReq { path, mode },
            PacketProcessor::Upload(_) => tftp::Packet::WriteReq { path, mode },
        }
    }

    pub fn state(&self) -> TransferState {
        match self {
            PacketProcessor::Download(p) => p.state,
            PacketProcessor::Upload(p) => p.state,
        }
    }

    /// Marks the transfer failed for reasons outside the processor (timeouts, socket errors).
    pub fn fail(&mut self) {
        match self {
            PacketProcessor::Download(p) => p.state = TransferState::Failed,
            PacketProcessor::Upload(p) => p.state = TransferState::Failed,
        }
    }

    pub fn summary(&self) -> TransferSummary {
        let (bytes, blocks) = match self {
            PacketProcessor::Download(p) => (p.bytes, p.blocks),
            PacketProcessor::Upload(p) => (p.bytes, p.blocks),
        };
        TransferSummary {
            direction: self.direction(),
            state: self.state(),
            bytes,
            blocks,
        }
    }

    /// Given an incoming packet, processes it and describes the action the caller should take.
    pub async fn process_packet(&mut self, packet: &tftp::Packet) -> ResultAction {
        match self {
            PacketProcessor::Download(p) => p.process_data(packet).await,
            PacketProcessor::Upload(p) => p.process_ack(packet).await,
        }
    }
}

/// Represents an action that the caller of PacketProcessor should take in
/// response to processing a packet.
#[derive(Debug)]
pub enum ResultAction {
    /// Caller should send the packet and await a response.
    SendPacketAndAwait(tftp::Packet),

    /// Caller should drop the packet and keep waiting for the expected one.
    RetryRecv(TransferError),

    /// Transfer is complete once the packet is sent.
    TerminateWithPacket(tftp::Packet),

    /// Transfer is complete, nothing left to send.
    CloseConnection,

    /// Transfer failed. The caller should send `notify` to the peer, if present, as a courtesy.
    Abort {
        notify: Option<tftp::Packet>,
        error: TransferError,
    },
}

fn peer_error(code: tftp::ErrorCode, message: &str) -> ResultAction {
    ResultAction::Abort {
        notify: None,
        error: TransferError::Peer {
            code,
            message: message.to_string(),
        },
    }
}

fn unexpected_packet(packet: &tftp::Packet, expected: &str) -> ResultAction {
    let opcode = packet.opcode();
    ResultAction::Abort {
        notify: Some(tftp::Packet::Error {
            code: tftp::ErrorCode::Illegal,
            message: format!("Expected to receive {expected} packet, but got {:?} instead", opcode),
        }),
        error: TransferError::UnexpectedOpcode(opcode as u16),
    }
}

fn local_file_failure(e: io::Error, action: &str) -> ResultAction {
    ResultAction::Abort {
        notify: Some(tftp::Packet::Error {
            code: e.kind().into(),
            message: format!("Client failed to {action} its local file: {e}"),
        }),
        error: TransferError::Resource(e),
    }
}

#[derive(Debug)]
pub struct DownloadProcessor {
    f: File,
    expected_block: u16,
    bytes: u64,
    blocks: u64,
    state: TransferState,
}

impl DownloadProcessor {
    fn new(f: File) -> DownloadProcessor {
        DownloadProcessor {
            f,
            expected_block: 1,
            bytes: 0,
            blocks: 0,
            state: TransferState::AwaitingFirstReply,
        }
    }

    async fn process_data(&mut self, packet: &tftp::Packet) -> ResultAction {
        match packet {
            tftp::Packet::Data { block, data } if *block == self.expected_block => {
                if let Err(e) = self.f.write_all(data).await {
                    self.state = TransferState::Failed;
                    return local_file_failure(e, "write");
                }
                self.bytes += data.len() as u64;
                self.blocks += 1;

                let ack = tftp::Packet::Ack { block: *block };
                if data.len() < tftp::DATA_BUFFER_SIZE {
                    if let Err(e) = self.f.flush().await {
                        self.state = TransferState::Failed;
                        return local_file_failure(e, "flush");
                    }
                    log::info!("Received final block {block}, {} bytes in total", self.bytes);
                    self.state = TransferState::Completed;
                    ResultAction::TerminateWithPacket(ack)
                } else {
                    // Wraps 65535 -> 0, as most servers do.
                    self.expected_block = self.expected_block.wrapping_add(1);
                    self.state = TransferState::Transferring;
                    ResultAction::SendPacketAndAwait(ack)
                }
            }
            tftp::Packet::Data { block, .. } => ResultAction::RetryRecv(TransferError::SequenceMismatch {
                expected: self.expected_block,
                received: *block,
            }),
            tftp::Packet::Error { code, message } => {
                self.state = TransferState::Failed;
                peer_error(*code, message)
            }
            _ => {
                self.state = TransferState::Failed;
                unexpected_packet(packet, "a Data")
            }
        }
    }
}

#[derive(Debug)]
pub struct UploadProcessor {
    f: File,
    curr_block: u16,
    awaiting_final_ack: bool,
    bytes: u64,
    blocks: u64,
    state: TransferState,
}

impl UploadProcessor {
    fn new(f: File) -> UploadProcessor {
        UploadProcessor {
            f,
            curr_block: 0,
            awaiting_final_ack: false,
            bytes: 0,
            blocks: 0,
            state: TransferState::AwaitingFirstReply,
        }
    }

    async fn process_ack(&mut self, packet: &tftp::Packet) -> ResultAction {
        match packet {
            tftp::Packet::Ack { block } if *block == self.curr_block => {
                if self.awaiting_final_ack {
                    log::info!("Final block {block} acknowledged, {} bytes in total", self.bytes);
                    self.state = TransferState::Completed;
                    return ResultAction::CloseConnection;
                }

                match read_block_from_file(&mut self.f).await {
                    Ok(data) => {
                        self.curr_block = self.curr_block.wrapping_add(1);
                        // A short block, possibly empty, is the last one.
                        if data.len() < tftp::DATA_BUFFER_SIZE {
                            self.awaiting_final_ack = true;
                        }
                        self.bytes += data.len() as u64;
                        self.blocks += 1;
                        self.state = TransferState::Transferring;
                        ResultAction::SendPacketAndAwait(tftp::Packet::Data {
                            block: self.curr_block,
                            data,
                        })
                    }
                    Err(e) => {
                        self.state = TransferState::Failed;
                        local_file_failure(e, "read")
                    }
                }
            }
            tftp::Packet::Ack { block } => ResultAction::RetryRecv(TransferError::SequenceMismatch {
                expected: self.curr_block,
                received: *block,
            }),
            tftp::Packet::Error { code, message } => {
                self.state = TransferState::Failed;
                peer_error(*code, message)
            }
            _ => {
                self.state = TransferState::Failed;
                unexpected_packet(packet, "an Ack")
            }
        }
    }
}

async fn read_block_from_file(f: &mut File) -> Result<Vec<u8>, io::Error> {
    let mut buf = Vec::with_capacity(tftp::DATA_BUFFER_SIZE);
    // A single read may come back short, so keep reading until the block is full or the file
    // runs out.
    f.take(tftp::DATA_BUFFER_SIZE as u64).read_to_end(&mut buf).await?;
    Ok(buf)
}
