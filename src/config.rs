//! Command-line surface of the client and its resolution into a transfer configuration.

use crate::error::TransferError;
use clap::{ArgGroup, Parser};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Services database entry naming the server port.
pub const SERVICE_NAME: &str = "tftp";
pub const SERVICE_PROTO: &str = "udp";

pub const DEFAULT_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_MAX_RETRIES: usize = 5;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(version, about = "Uploads or downloads a single file over TFTP (RFC 1350)")]
#[command(group(ArgGroup::new("operation").required(true).args(["read", "write"])))]
pub struct Args {
    /// IP address of the TFTP server
    pub server: IpAddr,

    /// Download <FILENAME> from the server
    #[arg(short = 'r')]
    pub read: bool,

    /// Upload <FILENAME> to the server
    #[arg(short = 'w')]
    pub write: bool,

    /// Remote file name, also used as the local path
    pub filename: String,

    /// Server port (defaults to the "tftp" service entry)
    #[arg(long)]
    pub port: Option<u16>,

    /// Seconds to wait for each reply before retransmitting (0 waits forever)
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECS)]
    pub timeout: u64,

    /// Retransmissions of the last packet before giving up
    #[arg(long, default_value_t = DEFAULT_MAX_RETRIES)]
    pub retries: usize,
}

pub fn usage(program: &str) -> String {
    format!("Usage: {program} <IP address> {{-r|-w}} <file>")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write,
}

/// Receive deadline and retransmission budget for one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferConfig {
    /// `None` blocks on every receive indefinitely.
    pub timeout: Option<Duration>,
    pub max_retries: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(DEFAULT_TIMEOUT_SECS)),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server: SocketAddr,
    pub operation: Operation,
    pub filename: String,
    pub transfer: TransferConfig,
}

impl ClientConfig {
    pub fn from_args(args: Args) -> Result<ClientConfig, TransferError> {
        if args.filename.is_empty() {
            return Err(TransferError::Configuration("File name must not be empty".to_string()));
        }
        if args.filename.contains('\0') {
            return Err(TransferError::Configuration(format!(
                "File name {:?} contains a NUL byte",
                args.filename
            )));
        }

        let port = match args.port {
            Some(port) => port,
            None => lookup_service_port(SERVICE_NAME, SERVICE_PROTO).ok_or_else(|| {
                TransferError::Configuration(format!(
                    "Could not resolve service '{SERVICE_NAME}/{SERVICE_PROTO}', pass --port"
                ))
            })?,
        };

        let operation = if args.read { Operation::Read } else { Operation::Write };

        let timeout = match args.timeout {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        Ok(ClientConfig {
            server: SocketAddr::new(args.server, port),
            operation,
            filename: args.filename,
            transfer: TransferConfig {
                timeout,
                max_retries: args.retries,
            },
        })
    }

    /// The local file sits in the working directory under the remote name.
    pub fn local_path(&self) -> &Path {
        Path::new(&self.filename)
    }
}

/// Looks up a port in the system services database.
#[cfg(unix)]
pub fn lookup_service_port(name: &str, proto: &str) -> Option<u16> {
    use std::ffi::CString;

    let name = CString::new(name).ok()?;
    let proto = CString::new(proto).ok()?;
    // SAFETY: getservbyname is not thread-safe. Its result points into static storage that the
    // next lookup overwrites. It is only called from main while resolving the configuration,
    // before the session or any other task runs, and the entry is copied out immediately.
    unsafe {
        let entry = libc::getservbyname(name.as_ptr(), proto.as_ptr());
        if entry.is_null() {
            return None;
        }
        Some(u16::from_be((*entry).s_port as u16))
    }
}

/// Without a services database only the IANA assignment is known.
#[cfg(not(unix))]
pub fn lookup_service_port(name: &str, proto: &str) -> Option<u16> {
    (name == SERVICE_NAME && proto == SERVICE_PROTO).then_some(69)
}
