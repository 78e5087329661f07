// This is an implementation of a TFTP client compliant with RFC 1350
//
//
// A transfer begins with a request to read or write a file, sent to the server's well-known port
// (the "tftp" service, 69 by IANA assignment). The file then moves in blocks of 512 bytes; each
// DATA packet carries one block and must be acknowledged before the next one is sent.
//
// Read (download):  client sends RRQ, server answers with DATA 1, client ACKs 1, and so on.
// Write (upload):   client sends WRQ, server answers with ACK 0, client sends DATA 1, and so on.
//
// A DATA packet with fewer than 512 bytes (possibly zero) ends the transfer. The side receiving
// it sends one last ACK and is done.
//
// Each end picks a transfer ID (TID) which becomes its UDP port. The client chooses its own at
// random; the server answers from a port of its own, and all further packets of the transfer go
// to that port rather than to the well-known one. Packets arriving from any other port are
// answered with an ERROR (unknown TID) and otherwise ignored.
//
// -------------------------------
// TFTP Packets
//
// opcode   operation
// 1        Read req (RRQ)
// 2        Write req (WRQ)
// 3        Data (DATA)
// 4        ACK
// 5        ERROR
//
// RRQ/WRQ packet format:
// 0x01/0x02 | Filename | 0x00 | Mode | 0x00
//
// This client always requests "octet" mode: bytes go over the wire untouched.
//
// DATA packet:
// 0x03 | Block # (2 bytes) | Data (0-512 bytes)
//
// ACK packet format:
// 0x04 | Block # (2 bytes)
//
// ERROR packet format:
// 0x05 | ErrorCode (2 bytes) | ErrMsg | 0x00
//
// All 2-byte fields are big-endian.
//
// ----------------------------
// Errors and loss
//
// An ERROR packet ends the transfer. It is sent as a courtesy, never acknowledged or
// retransmitted.
//
// Lost packets are detected by timeout: when no reply arrives in time the client resends its last
// packet, and gives up after a bounded number of attempts. Block numbers wrap from 65535 back
// to 0.
//
// ----------------------------
// Error codes
//
// 0    Not defined, see msg
// 1    File not found
// 2    Access violation
// 3    Disk full / alloc exceeded
// 4    Illegal TFTP op
// 5    Unknown TID
// 6    File already exists
// 7    No such user
//

use std::process;

pub mod client_conn;
pub mod config;
pub mod error;
pub mod processor;
pub mod tftp;

use client_conn::TransferSession;
use config::{Args, ClientConfig, Operation};
use error::TransferError;
use processor::{Direction, PacketProcessor};

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => e.exit(),
        Err(e) => {
            log::debug!("Rejected arguments: {e}");
            let program = std::env::args()
                .next()
                .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string());
            println!("{}", config::usage(&program));
            process::exit(1);
        }
    };

    let config = ClientConfig::from_args(args)?;
    log::info!("Binding socket");
    let sock = client_conn::bind_random_socket(config.server)?;

    let processor = match config.operation {
        Operation::Read => PacketProcessor::new_for_download(config.local_path()).await,
        Operation::Write => PacketProcessor::new_for_upload(config.local_path()).await,
    }
    .map_err(TransferError::Resource)
    .with_context(|| format!("Could not open local file '{}'", config.filename))?;

    let summary = TransferSession::new(sock, config.server, processor, config.transfer.clone())
        .run(&config.filename)
        .await
        .with_context(|| format!("Transfer of '{}' with {} failed", config.filename, config.server))?;

    log::info!("Transfer ended {:?} after {} blocks", summary.state, summary.blocks);
    match summary.direction {
        Direction::Download => println!("File received and saved successfully ({} bytes).", summary.bytes),
        Direction::Upload => println!("File sent successfully ({} bytes).", summary.bytes),
    }

    Ok(())
}
