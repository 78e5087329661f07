use crate::tftp;
use std::error;
use std::fmt;
use std::io;

/// Every way a transfer can go wrong, from argument resolution to the last ack.
#[derive(Debug)]
pub enum TransferError {
    /// Bad arguments, an invalid address or an unresolvable service.
    Configuration(String),

    /// The socket or the local file could not be opened, read or written.
    Resource(io::Error),

    /// A datagram too short or too inconsistent to be a TFTP packet.
    MalformedFrame(String),

    /// A packet whose opcode makes no sense at this point of the transfer.
    UnexpectedOpcode(u16),

    /// A block number other than the one expected. Recoverable.
    SequenceMismatch { expected: u16, received: u16 },

    /// The server ended the transfer with an Error packet.
    Peer { code: tftp::ErrorCode, message: String },

    /// Sending or receiving on the socket failed.
    Transport(io::Error),

    /// The server stayed silent through every retransmission.
    Timeout { attempts: usize },
}

impl error::Error for TransferError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            TransferError::Resource(e) | TransferError::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            Self::Resource(e) => write!(f, "Resource error: {}", e),
            Self::MalformedFrame(msg) => write!(f, "Malformed packet: {}", msg),
            Self::UnexpectedOpcode(op) => write!(f, "Unexpected opcode: {}", op),
            Self::SequenceMismatch { expected, received } => write!(
                f,
                "Sequence mismatch: expected block {}, received block {}",
                expected, received
            ),
            Self::Peer { code, message } => {
                write!(f, "Server error {} ({:?}): {}", *code as u16, code, message)
            }
            Self::Transport(e) => write!(f, "Transport error: {}", e),
            Self::Timeout { attempts } => {
                write!(f, "Timed out waiting for the server after {} attempts", attempts)
            }
        }
    }
}

impl From<tftp::SocketError> for TransferError {
    fn from(e: tftp::SocketError) -> TransferError {
        match e {
            tftp::SocketError::IO(e) => TransferError::Transport(e),
            tftp::SocketError::Malformed(msg) | tftp::SocketError::Encode(msg) => {
                TransferError::MalformedFrame(msg)
            }
            tftp::SocketError::UnknownOpcode(op) => TransferError::UnexpectedOpcode(op),
            tftp::SocketError::Timeout(_) => TransferError::Timeout { attempts: 1 },
        }
    }
}
