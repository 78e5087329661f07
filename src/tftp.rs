use async_io::Async;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::error;
use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;
use tokio::time::error::Elapsed;
use tokio::time::timeout;

/// Largest payload carried by a single DATA packet. A shorter payload ends the transfer.
pub const DATA_BUFFER_SIZE: usize = 512;

/// Opcode plus the block number (or error code) that follows it.
pub const HEADER_SIZE: usize = 4;

// One byte of slack so an oversized DATA packet is seen as such instead of being truncated.
const RECV_BUFFER_SIZE: usize = HEADER_SIZE + DATA_BUFFER_SIZE + 1;

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Represents an error returned from the TFTP Socket handler
#[derive(Debug)]
pub enum SocketError {
    IO(io::Error),
    /// The datagram could not be parsed into a packet.
    Malformed(String),
    /// The first two bytes did not name one of the five TFTP opcodes.
    UnknownOpcode(u16),
    /// A packet could not be serialized.
    Encode(String),
    Timeout(Elapsed),
}

impl error::Error for SocketError {}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SocketError::IO(e) => write!(f, "Socket IO error: {}", e),
            SocketError::Malformed(e) => write!(f, "Packet parsing error: {}", e),
            SocketError::UnknownOpcode(op) => write!(f, "Unknown opcode retrieved: {}", op),
            SocketError::Encode(e) => write!(f, "Packet encoding error: {}", e),
            SocketError::Timeout(e) => write!(f, "Socket IO timeout: {}", e),
        }
    }
}

impl From<io::Error> for SocketError {
    fn from(e: io::Error) -> Self {
        SocketError::IO(e)
    }
}

impl From<Elapsed> for SocketError {
    fn from(e: Elapsed) -> Self {
        SocketError::Timeout(e)
    }
}

pub type TftpResult<T> = Result<T, SocketError>;

/// Represents the transfer mode named in a read or write request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    NetAscii,
    Octet,
}

impl FileMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileMode::NetAscii => "netascii",
            FileMode::Octet => "octet",
        }
    }
}

/// Represents a TFTP Error code surfaced by a TFTP Error packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Undefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    DiskFull = 3,
    Illegal = 4,
    UnknownTid = 5,
    FileAlreadyExists = 6,
    NoSuchUser = 7,
}

impl From<u16> for ErrorCode {
    fn from(raw: u16) -> Self {
        match raw {
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::Illegal,
            5 => ErrorCode::UnknownTid,
            6 => ErrorCode::FileAlreadyExists,
            7 => ErrorCode::NoSuchUser,
            _ => ErrorCode::Undefined,
        }
    }
}

impl From<io::ErrorKind> for ErrorCode {
    fn from(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::NotFound => ErrorCode::FileNotFound,
            io::ErrorKind::PermissionDenied => ErrorCode::AccessViolation,
            io::ErrorKind::AlreadyExists => ErrorCode::FileAlreadyExists,
            io::ErrorKind::WriteZero | io::ErrorKind::OutOfMemory => ErrorCode::DiskFull,
            _ => ErrorCode::Undefined,
        }
    }
}

/// The five TFTP opcodes, as they appear in the first two bytes of every packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Rrq = 1,
    Wrq = 2,
    Data = 3,
    Ack = 4,
    Error = 5,
}

impl OpCode {
    pub fn from_u16(raw: u16) -> Option<OpCode> {
        match raw {
            1 => Some(OpCode::Rrq),
            2 => Some(OpCode::Wrq),
            3 => Some(OpCode::Data),
            4 => Some(OpCode::Ack),
            5 => Some(OpCode::Error),
            _ => None,
        }
    }
}

/// An enum representing a TFTP packet and its associated data.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// A read request packet
    ReadReq {
        /// The file path the client wants to read.
        path: String,

        /// The file mode.
        mode: FileMode,
    },

    /// A write request packet
    WriteReq {
        path: String,
        mode: FileMode,
    },

    /// A data packet
    Data {
        /// The block number for this data packet.
        block: u16,

        /// The contents of the data itself.
        data: Vec<u8>,
    },

    /// An acknowledgment packet
    Ack {
        /// The block being acknowledged.
        block: u16,
    },

    /// An error packet.
    Error {
        code: ErrorCode,
        message: String,
    },
}

///////////////////////////////////////////////////////////////
// Encoding

fn put_cstr(buf: &mut BytesMut, s: &str) -> TftpResult<()> {
    if s.as_bytes().contains(&0x00) {
        return Err(SocketError::Encode(format!("String {:?} contains a NUL byte", s)));
    }
    buf.put_slice(s.as_bytes());
    buf.put_u8(0x00);
    Ok(())
}

/// Builds a read or write request: `opcode | path | 0x00 | mode | 0x00`.
pub fn encode_request(opcode: OpCode, path: &str, mode: FileMode) -> TftpResult<Bytes> {
    if !matches!(opcode, OpCode::Rrq | OpCode::Wrq) {
        return Err(SocketError::Encode(format!("{:?} is not a request opcode", opcode)));
    }
    if path.is_empty() {
        return Err(SocketError::Encode("Request path must not be empty".to_string()));
    }

    let mode = mode.as_str();
    let mut buf = BytesMut::with_capacity(2 + path.len() + mode.len() + 2);
    buf.put_u16(opcode as u16);
    put_cstr(&mut buf, path)?;
    put_cstr(&mut buf, mode)?;
    Ok(buf.freeze())
}

pub fn encode_ack(block: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE);
    buf.put_u16(OpCode::Ack as u16);
    buf.put_u16(block);
    buf.freeze()
}

pub fn encode_data(block: u16, data: &[u8]) -> TftpResult<Bytes> {
    if data.len() > DATA_BUFFER_SIZE {
        return Err(SocketError::Encode(format!(
            "Data payload of {} bytes exceeds the {DATA_BUFFER_SIZE} byte block size",
            data.len()
        )));
    }

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + data.len());
    buf.put_u16(OpCode::Data as u16);
    buf.put_u16(block);
    buf.put_slice(data);
    Ok(buf.freeze())
}

pub fn encode_error(code: ErrorCode, message: &str) -> TftpResult<Bytes> {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + message.len() + 1);
    buf.put_u16(OpCode::Error as u16);
    buf.put_u16(code as u16);
    put_cstr(&mut buf, message)?;
    Ok(buf.freeze())
}

///////////////////////////////////////////////////////////////
// Decoding

/// Reads the opcode and the 16-bit field after it (block number or error code).
///
/// The opcode is returned raw; mapping it onto [`OpCode`] is up to the caller.
pub fn decode_header(buf: &[u8]) -> TftpResult<(u16, u16)> {
    if buf.len() < HEADER_SIZE {
        return Err(SocketError::Malformed(format!(
            "Packet too short! Got {} bytes, need at least {HEADER_SIZE}",
            buf.len()
        )));
    }

    let mut header = &buf[..HEADER_SIZE];
    Ok((header.get_u16(), header.get_u16()))
}

/// Given a buffer, assumes the string begins at the beginning of the buffer and runs until the
/// first 0 byte.
///
/// Returns the string as well as the position of the 0 byte in the buffer it was given (or the
/// size of the buffer, if no 0 byte was encountered)
fn string_from_buffer(buf: &[u8]) -> (String, usize) {
    let end = buf.iter().position(|&c| c == 0x00).unwrap_or(buf.len());
    (String::from_utf8_lossy(&buf[..end]).into_owned(), end)
}

fn parse_path_and_mode(buf: &[u8]) -> TftpResult<(String, FileMode)> {
    let (path, path_end) = string_from_buffer(buf);

    if path_end == buf.len() {
        return Err(SocketError::Malformed("Request does not contain a mode, but it needs to!".to_string()));
    }

    let (raw_mode, mode_end) = string_from_buffer(&buf[path_end + 1..]);

    if path_end + 1 + mode_end >= buf.len() {
        return Err(SocketError::Malformed("Mode must be terminated with a null byte!".to_string()));
    }

    let mode = match raw_mode.to_lowercase().as_str() {
        "netascii" => FileMode::NetAscii,
        "octet" => FileMode::Octet,
        _ => return Err(SocketError::Malformed(format!("Unknown file mode: '{raw_mode}'"))),
    };

    Ok((path, mode))
}

fn parse_data(block: u16, payload: &[u8]) -> TftpResult<Packet> {
    if payload.len() > DATA_BUFFER_SIZE {
        return Err(SocketError::Malformed(format!(
            "Data block {block} carries more than {DATA_BUFFER_SIZE} bytes"
        )));
    }
    Ok(Packet::Data { block, data: payload.to_vec() })
}

impl Packet {
    pub fn opcode(&self) -> OpCode {
        match self {
            Packet::ReadReq { .. } => OpCode::Rrq,
            Packet::WriteReq { .. } => OpCode::Wrq,
            Packet::Data { .. } => OpCode::Data,
            Packet::Ack { .. } => OpCode::Ack,
            Packet::Error { .. } => OpCode::Error,
        }
    }

    pub fn to_bytes(&self) -> TftpResult<Bytes> {
        match self {
            Packet::ReadReq { path, mode } => encode_request(OpCode::Rrq, path, *mode),
            Packet::WriteReq { path, mode } => encode_request(OpCode::Wrq, path, *mode),
            Packet::Data { block, data } => encode_data(*block, data),
            Packet::Ack { block } => Ok(encode_ack(*block)),
            Packet::Error { code, message } => encode_error(*code, message),
        }
    }

    pub fn parse_from_buf(buf: &[u8]) -> TftpResult<Packet> {
        let (raw_opcode, field) = decode_header(buf)?;
        let opcode = OpCode::from_u16(raw_opcode).ok_or(SocketError::UnknownOpcode(raw_opcode))?;

        match opcode {
            OpCode::Rrq => {
                let (path, mode) = parse_path_and_mode(&buf[2..])?;
                Ok(Packet::ReadReq { path, mode })
            }
            OpCode::Wrq => {
                let (path, mode) = parse_path_and_mode(&buf[2..])?;
                Ok(Packet::WriteReq { path, mode })
            }
            OpCode::Data => parse_data(field, &buf[HEADER_SIZE..]),
            OpCode::Ack => Ok(Packet::Ack { block: field }),
            OpCode::Error => {
                let (message, _) = string_from_buffer(&buf[HEADER_SIZE..]);
                Ok(Packet::Error { code: field.into(), message })
            }
        }
    }
}

///////////////////////////////////////////////////////////////
/// Wrapper around a UDP socket that parses TFTP headers and
/// returns the packets in a more structured format.
pub struct TftpSocket {
    sock: Async<UdpSocket>,
}

impl TftpSocket {
    pub fn bind(addr: SocketAddr) -> TftpResult<TftpSocket> {
        Ok(TftpSocket {
            sock: Async::<UdpSocket>::bind(addr)?,
        })
    }

    pub fn local_addr(&self) -> TftpResult<SocketAddr> {
        Ok(self.sock.get_ref().local_addr()?)
    }

    pub async fn send(&self, packet: &Packet, dst: SocketAddr) -> TftpResult<()> {
        let bytes = packet.to_bytes()?;
        self.sock.send_to(&bytes, dst).await?;
        Ok(())
    }

    /// Blocks until a datagram arrives, with no deadline.
    ///
    /// The outer result carries socket failures. The inner one is the parse of the datagram, kept
    /// apart so the caller still learns who sent a packet it cannot read.
    pub async fn recv(&self) -> TftpResult<(TftpResult<Packet>, SocketAddr)> {
        let mut buf = [0; RECV_BUFFER_SIZE];
        let (total_written, src) = self.sock.recv_from(&mut buf).await?;

        Ok((Packet::parse_from_buf(&buf[..total_written]), src))
    }

    pub async fn recv_with_timeout(&self, ttl: Duration) -> TftpResult<(TftpResult<Packet>, SocketAddr)> {
        timeout(ttl, self.recv()).await?
    }
}
