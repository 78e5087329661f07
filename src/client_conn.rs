// This module contains the client-side session driver.
//
// A session starts by sending a RRQ or WRQ to the server's well-known port. The server answers
// from a fresh port of its own (its transfer ID); the first reply locks the session onto that
// address and every later packet is sent there. From then on the session runs the lockstep
// exchange:
//
// 1. Send the current packet (the request, an ACK or a DATA block).
// 2. Wait for the reply. Replies from strangers are refused with an error packet; replies the
//    processor considers out of sequence are dropped.
// 3. Hand the reply to the processor, which either produces the next packet to send or ends the
//    transfer.
//
// If no acceptable reply arrives before the deadline, the current packet is sent again. After
// too many consecutive timeouts the session gives up. The session is consumed when run, so the
// socket and the local file are closed exactly once however the transfer ends.

use crate::config::TransferConfig;
use crate::error::TransferError;
use crate::processor::{PacketProcessor, ResultAction, TransferSummary};
use crate::tftp;
use rand::Rng;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::time::Instant;

const BIND_ATTEMPTS: usize = 16;

/// Attempts to bind a random UDP port for the client's transfer ID, falling back to one chosen
/// by the OS.
pub fn bind_random_socket(server: SocketAddr) -> Result<tftp::TftpSocket, TransferError> {
    let ip = match server.ip() {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };

    let mut rng = rand::thread_rng();
    for _ in 0..BIND_ATTEMPTS {
        let port = rng.gen_range(1024..65535);
        match tftp::TftpSocket::bind(SocketAddr::new(ip, port)) {
            Ok(sock) => return Ok(sock),
            Err(e) => log::warn!("Couldn't bind socket to port {port}: {e}"),
        }
    }

    tftp::TftpSocket::bind(SocketAddr::new(ip, 0)).map_err(|e| match e {
        tftp::SocketError::IO(e) => TransferError::Resource(e),
        other => other.into(),
    })
}

async fn send_error_packet(
    sock: &tftp::TftpSocket,
    dst: SocketAddr,
    code: tftp::ErrorCode,
    message: String,
) {
    // Error packet is sent as a courtesy, a failure only gets logged.
    if let Err(e) = sock.send(&tftp::Packet::Error { code, message }, dst).await {
        log::debug!("Could not send error packet to {dst}: {e}");
    }
}

/// One upload or download, from request to final packet.
pub struct TransferSession {
    /// The TFTP socket used to send and receive packets.
    sock: tftp::TftpSocket,

    /// Where the request goes.
    server: SocketAddr,

    /// The server's transfer ID, known once it first replies.
    peer: Option<SocketAddr>,

    processor: PacketProcessor,

    config: TransferConfig,
}

impl TransferSession {
    pub fn new(
        sock: tftp::TftpSocket,
        server: SocketAddr,
        processor: PacketProcessor,
        config: TransferConfig,
    ) -> TransferSession {
        TransferSession {
            sock,
            server,
            peer: None,
            processor,
            config,
        }
    }

    /// Checks where a reply came from, locking onto the server's transfer ID on the first one.
    async fn accept_source(&mut self, src: SocketAddr) -> bool {
        match self.peer {
            Some(peer) if peer == src => true,
            Some(peer) => {
                log::warn!("Refusing packet from {src}, transfer is bound to {peer}");
                send_error_packet(
                    &self.sock,
                    src,
                    tftp::ErrorCode::UnknownTid,
                    "Unknown transfer ID".to_string(),
                )
                .await;
                false
            }
            None if src.ip() != self.server.ip() => {
                log::warn!("Ignoring reply from {src}, request was sent to {}", self.server);
                false
            }
            None => {
                log::info!("Server answered from {src}");
                self.peer = Some(src);
                true
            }
        }
    }

    fn fail(&mut self, error: TransferError) -> Result<TransferSummary, TransferError> {
        log::error!("Transfer of {:?} failed: {}", self.processor.direction(), error);
        self.processor.fail();
        Err(error)
    }

    /// Does the work of sending and receiving packets until the transfer reaches a terminal
    /// state.
    pub async fn run(mut self, path: &str) -> Result<TransferSummary, TransferError> {
        let mut out_packet = self.processor.request(path);
        let mut attempts = 0;

        log::info!(
            "Requesting {:?} of '{}' from {} via {:?}",
            self.processor.direction(),
            path,
            self.server,
            self.sock.local_addr().ok()
        );

        // This loop is used for message sending as well as retries, depending on whether
        // |out_packet| has been overwritten.
        'send: loop {
            let dst = self.peer.unwrap_or(self.server);
            log::debug!("Sending {:?} to {}", out_packet.opcode(), dst);
            if let Err(e) = self.sock.send(&out_packet, dst).await {
                return self.fail(e.into());
            }

            // A deadline too far out to represent is no deadline at all.
            let deadline = self.config.timeout.and_then(|ttl| Instant::now().checked_add(ttl));
            loop {
                let received = match deadline {
                    Some(d) => {
                        self.sock
                            .recv_with_timeout(d.saturating_duration_since(Instant::now()))
                            .await
                    }
                    None => self.sock.recv().await,
                };

                match received {
                    Ok((parsed, src)) => {
                        if !self.accept_source(src).await {
                            continue;
                        }

                        // A packet from the peer that doesn't parse ends the transfer.
                        let packet = match parsed {
                            Ok(packet) => packet,
                            Err(e) => {
                                send_error_packet(
                                    &self.sock,
                                    src,
                                    tftp::ErrorCode::Illegal,
                                    format!("Error parsing incoming packet: {e}"),
                                )
                                .await;
                                return self.fail(e.into());
                            }
                        };
                        log::debug!("Got packet from {}: {:?}", src, packet.opcode());

                        match self.processor.process_packet(&packet).await {
                            ResultAction::SendPacketAndAwait(p) => {
                                out_packet = p;
                                attempts = 0;
                                continue 'send;
                            }
                            ResultAction::RetryRecv(reason) => {
                                log::warn!("Dropping packet from {src}: {reason}");
                                continue;
                            }
                            ResultAction::TerminateWithPacket(p) => {
                                if let Err(e) = self.sock.send(&p, src).await {
                                    return self.fail(e.into());
                                }
                                log::info!("Closing connection with {}", src);
                                return Ok(self.processor.summary());
                            }
                            ResultAction::CloseConnection => {
                                log::info!("Closing connection with {}", src);
                                return Ok(self.processor.summary());
                            }
                            ResultAction::Abort { notify, error } => {
                                if let Some(tftp::Packet::Error { code, message }) = notify {
                                    send_error_packet(&self.sock, src, code, message).await;
                                }
                                return self.fail(error);
                            }
                        }
                    }
                    // If we timed out, resend the last packet
                    Err(tftp::SocketError::Timeout(_)) => {
                        attempts += 1;
                        if attempts > self.config.max_retries {
                            return self.fail(TransferError::Timeout { attempts });
                        }
                        log::warn!(
                            "Timed out waiting for {}, retransmitting ({}/{})",
                            dst,
                            attempts,
                            self.config.max_retries
                        );
                        continue 'send;
                    }
                    Err(e) => return self.fail(e.into()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::{Direction, TransferState};
    use std::path::PathBuf;
    use std::time::Duration;
    use tempdir::TempDir;
    use tokio::net::UdpSocket;
    use tokio::task::JoinHandle;
    use tokio_test::{assert_err, assert_ok};

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    fn quick_config() -> TransferConfig {
        TransferConfig {
            timeout: Some(Duration::from_secs(2)),
            max_retries: 2,
        }
    }

    async fn fake_server() -> (UdpSocket, SocketAddr) {
        let sock = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = sock.local_addr().unwrap();
        (sock, addr)
    }

    async fn recv_packet(sock: &UdpSocket) -> (tftp::Packet, SocketAddr) {
        let mut buf = [0u8; 1024];
        let (len, src) = tokio::time::timeout(TEST_TIMEOUT, sock.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        (tftp::Packet::parse_from_buf(&buf[..len]).unwrap(), src)
    }

    async fn send_packet(sock: &UdpSocket, packet: tftp::Packet, dst: SocketAddr) {
        sock.send_to(&packet.to_bytes().unwrap(), dst).await.unwrap();
    }

    async fn download_session(server: SocketAddr, config: TransferConfig) -> (TempDir, PathBuf, TransferSession) {
        let tmpdir = TempDir::new("scratch").unwrap();
        let path = tmpdir.path().join("download.bin");
        let processor = PacketProcessor::new_for_download(&path).await.unwrap();
        let sock = bind_random_socket(server).unwrap();
        (tmpdir, path, TransferSession::new(sock, server, processor, config))
    }

    async fn upload_session(
        server: SocketAddr,
        contents: &[u8],
        config: TransferConfig,
    ) -> (TempDir, TransferSession) {
        let tmpdir = TempDir::new("scratch").unwrap();
        let path = tmpdir.path().join("upload.bin");
        tokio::fs::write(&path, contents).await.unwrap();
        let processor = PacketProcessor::new_for_upload(&path).await.unwrap();
        let sock = bind_random_socket(server).unwrap();
        (tmpdir, TransferSession::new(sock, server, processor, config))
    }

    fn spawn_run(session: TransferSession, path: &str) -> JoinHandle<Result<TransferSummary, TransferError>> {
        let path = path.to_string();
        tokio::spawn(async move { session.run(&path).await })
    }

    #[test]
    fn test_bind_random_socket_matches_family() {
        let v4 = assert_ok!(bind_random_socket((Ipv4Addr::LOCALHOST, 69).into()));
        assert!(assert_ok!(v4.local_addr()).is_ipv4());
    }

    #[tokio::test]
    async fn test_download_single_block() {
        let (server, server_addr) = fake_server().await;
        let (_tmpdir, path, session) = download_session(server_addr, quick_config()).await;
        let handle = spawn_run(session, "hello.txt");

        let (request, client) = recv_packet(&server).await;
        assert_eq!(
            request,
            tftp::Packet::ReadReq { path: "hello.txt".to_string(), mode: tftp::FileMode::Octet }
        );

        send_packet(&server, tftp::Packet::Data { block: 1, data: vec![0x61; 300] }, client).await;
        assert_eq!(recv_packet(&server).await.0, tftp::Packet::Ack { block: 1 });

        let summary = assert_ok!(handle.await.unwrap());
        assert_eq!(
            summary,
            TransferSummary { direction: Direction::Download, state: TransferState::Completed, bytes: 300, blocks: 1 }
        );
        assert_eq!(tokio::fs::read(&path).await.unwrap(), vec![0x61; 300]);
    }

    #[tokio::test]
    async fn test_download_two_blocks_from_transfer_port() {
        let (server, server_addr) = fake_server().await;
        // Real servers answer from a fresh port; the session has to follow it.
        let (transfer, _) = fake_server().await;
        let (_tmpdir, path, session) = download_session(server_addr, quick_config()).await;
        let handle = spawn_run(session, "two.bin");

        let (_, client) = recv_packet(&server).await;

        send_packet(&transfer, tftp::Packet::Data { block: 1, data: vec![0x01; 512] }, client).await;
        assert_eq!(recv_packet(&transfer).await.0, tftp::Packet::Ack { block: 1 });

        send_packet(&transfer, tftp::Packet::Data { block: 2, data: vec![0x02; 10] }, client).await;
        assert_eq!(recv_packet(&transfer).await.0, tftp::Packet::Ack { block: 2 });

        let summary = assert_ok!(handle.await.unwrap());
        assert_eq!(summary.bytes, 522);
        assert_eq!(summary.blocks, 2);

        let written = tokio::fs::read(&path).await.unwrap();
        assert_eq!(written.len(), 522);
        assert_eq!(&written[512..], &[0x02; 10]);
    }

    #[tokio::test]
    async fn test_download_server_error() {
        let (server, server_addr) = fake_server().await;
        let (_tmpdir, path, session) = download_session(server_addr, quick_config()).await;
        let handle = spawn_run(session, "missing.txt");

        let (_, client) = recv_packet(&server).await;
        send_packet(
            &server,
            tftp::Packet::Error { code: tftp::ErrorCode::FileNotFound, message: "File not found".to_string() },
            client,
        )
        .await;

        match handle.await.unwrap() {
            Err(TransferError::Peer { code, message }) => {
                assert_eq!(code, tftp::ErrorCode::FileNotFound);
                assert_eq!(message, "File not found");
            }
            other => panic!("Unexpected result: {:#?}", other),
        }
        assert!(tokio::fs::read(&path).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upload_empty_file() {
        let (server, server_addr) = fake_server().await;
        let (_tmpdir, session) = upload_session(server_addr, b"", quick_config()).await;
        let handle = spawn_run(session, "empty.bin");

        let (request, client) = recv_packet(&server).await;
        assert_eq!(
            request,
            tftp::Packet::WriteReq { path: "empty.bin".to_string(), mode: tftp::FileMode::Octet }
        );

        send_packet(&server, tftp::Packet::Ack { block: 0 }, client).await;
        assert_eq!(recv_packet(&server).await.0, tftp::Packet::Data { block: 1, data: vec![] });

        // Nothing is finished until the empty block is acknowledged.
        assert!(!handle.is_finished());
        send_packet(&server, tftp::Packet::Ack { block: 1 }, client).await;

        let summary = assert_ok!(handle.await.unwrap());
        assert_eq!(summary.direction, Direction::Upload);
        assert_eq!(summary.state, TransferState::Completed);
        assert_eq!(summary.bytes, 0);
    }

    #[tokio::test]
    async fn test_upload_ignores_stale_ack() {
        let (server, server_addr) = fake_server().await;
        let (_tmpdir, session) = upload_session(server_addr, &[0x55; 700], quick_config()).await;
        let handle = spawn_run(session, "data.bin");

        let (_, client) = recv_packet(&server).await;
        send_packet(&server, tftp::Packet::Ack { block: 0 }, client).await;
        assert!(matches!(recv_packet(&server).await.0, tftp::Packet::Data { block: 1, ref data } if data.len() == 512));

        send_packet(&server, tftp::Packet::Ack { block: 0 }, client).await;
        send_packet(&server, tftp::Packet::Ack { block: 1 }, client).await;
        assert!(matches!(recv_packet(&server).await.0, tftp::Packet::Data { block: 2, ref data } if data.len() == 188));

        send_packet(&server, tftp::Packet::Ack { block: 2 }, client).await;
        assert_eq!(assert_ok!(handle.await.unwrap()).bytes, 700);
    }

    #[tokio::test]
    async fn test_unknown_transfer_id_is_refused() {
        let (server, server_addr) = fake_server().await;
        let (stranger, _) = fake_server().await;
        let (_tmpdir, path, session) = download_session(server_addr, quick_config()).await;
        let handle = spawn_run(session, "hello.txt");

        let (_, client) = recv_packet(&server).await;
        send_packet(&server, tftp::Packet::Data { block: 1, data: vec![0x01; 512] }, client).await;
        assert_eq!(recv_packet(&server).await.0, tftp::Packet::Ack { block: 1 });

        send_packet(&stranger, tftp::Packet::Data { block: 2, data: vec![0xFF; 4] }, client).await;
        assert!(matches!(
            recv_packet(&stranger).await.0,
            tftp::Packet::Error { code: tftp::ErrorCode::UnknownTid, .. }
        ));

        send_packet(&server, tftp::Packet::Data { block: 2, data: vec![0x02; 4] }, client).await;
        assert_eq!(recv_packet(&server).await.0, tftp::Packet::Ack { block: 2 });

        assert_ok!(handle.await.unwrap());
        let written = tokio::fs::read(&path).await.unwrap();
        assert_eq!(&written[512..], &[0x02; 4]);
    }

    #[tokio::test]
    async fn test_unexpected_opcode_fails_transfer() {
        let (server, server_addr) = fake_server().await;
        let (_tmpdir, _path, session) = download_session(server_addr, quick_config()).await;
        let handle = spawn_run(session, "hello.txt");

        let (_, client) = recv_packet(&server).await;
        send_packet(&server, tftp::Packet::Data { block: 1, data: vec![0x01; 512] }, client).await;
        assert_eq!(recv_packet(&server).await.0, tftp::Packet::Ack { block: 1 });

        server.send_to(&[0x00, 0x09, 0x00, 0x02], client).await.unwrap();

        assert!(matches!(handle.await.unwrap(), Err(TransferError::UnexpectedOpcode(9))));
        assert!(matches!(
            recv_packet(&server).await.0,
            tftp::Packet::Error { code: tftp::ErrorCode::Illegal, .. }
        ));
    }

    #[tokio::test]
    async fn test_timeout_retransmits_then_fails() {
        let (server, server_addr) = fake_server().await;
        let config = TransferConfig {
            timeout: Some(Duration::from_millis(50)),
            max_retries: 2,
        };
        let (_tmpdir, _path, session) = download_session(server_addr, config).await;

        let result = session.run("silent.txt").await;
        assert!(matches!(assert_err!(result), TransferError::Timeout { attempts: 3 }));

        // The request and both retransmissions are all identical.
        for _ in 0..3 {
            assert_eq!(
                recv_packet(&server).await.0,
                tftp::Packet::ReadReq { path: "silent.txt".to_string(), mode: tftp::FileMode::Octet }
            );
        }
    }

    #[tokio::test]
    async fn test_lost_ack_is_recovered_by_retransmission() {
        let (server, server_addr) = fake_server().await;
        let config = TransferConfig {
            timeout: Some(Duration::from_millis(200)),
            max_retries: 3,
        };
        let (_tmpdir, session) = upload_session(server_addr, b"short", config).await;
        let handle = spawn_run(session, "short.txt");

        let (_, client) = recv_packet(&server).await;
        send_packet(&server, tftp::Packet::Ack { block: 0 }, client).await;

        // Pretend the first Ack for block 1 went missing: the block comes again.
        let first = recv_packet(&server).await.0;
        let again = recv_packet(&server).await.0;
        assert_eq!(first, again);
        assert_eq!(first, tftp::Packet::Data { block: 1, data: b"short".to_vec() });

        send_packet(&server, tftp::Packet::Ack { block: 1 }, client).await;
        assert_ok!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn test_garbage_from_stranger_is_refused() {
        let (server, server_addr) = fake_server().await;
        let (stranger, _) = fake_server().await;
        let (_tmpdir, path, session) = download_session(server_addr, quick_config()).await;
        let handle = spawn_run(session, "hello.txt");

        let (_, client) = recv_packet(&server).await;
        send_packet(&server, tftp::Packet::Data { block: 1, data: vec![0x01; 512] }, client).await;
        assert_eq!(recv_packet(&server).await.0, tftp::Packet::Ack { block: 1 });

        stranger.send_to(&[0xde, 0xad], client).await.unwrap();
        assert!(matches!(
            recv_packet(&stranger).await.0,
            tftp::Packet::Error { code: tftp::ErrorCode::UnknownTid, .. }
        ));

        send_packet(&server, tftp::Packet::Data { block: 2, data: vec![0x02; 4] }, client).await;
        assert_eq!(recv_packet(&server).await.0, tftp::Packet::Ack { block: 2 });

        assert_eq!(assert_ok!(handle.await.unwrap()).bytes, 516);
        assert_eq!(tokio::fs::read(&path).await.unwrap().len(), 516);
    }

    #[tokio::test]
    async fn test_unrepresentable_timeout_waits_without_deadline() {
        let (server, server_addr) = fake_server().await;
        let config = TransferConfig {
            timeout: Some(Duration::from_secs(u64::MAX)),
            max_retries: 1,
        };
        let (_tmpdir, path, session) = download_session(server_addr, config).await;
        let handle = spawn_run(session, "hello.txt");

        let (_, client) = recv_packet(&server).await;
        send_packet(&server, tftp::Packet::Data { block: 1, data: vec![0x61; 20] }, client).await;
        assert_eq!(recv_packet(&server).await.0, tftp::Packet::Ack { block: 1 });

        assert_eq!(assert_ok!(handle.await.unwrap()).state, TransferState::Completed);
        assert_eq!(tokio::fs::read(&path).await.unwrap(), vec![0x61; 20]);
    }

    #[tokio::test]
    async fn test_stale_acks_do_not_extend_deadline() {
        let (server, server_addr) = fake_server().await;
        let config = TransferConfig {
            timeout: Some(Duration::from_millis(300)),
            max_retries: 0,
        };
        let (_tmpdir, session) = upload_session(server_addr, &[0x55; 700], config).await;
        let handle = spawn_run(session, "data.bin");

        let (_, client) = recv_packet(&server).await;
        send_packet(&server, tftp::Packet::Ack { block: 0 }, client).await;
        assert!(matches!(recv_packet(&server).await.0, tftp::Packet::Data { block: 1, .. }));

        // Keep the socket busy with acks it has to drop, well past the deadline.
        let started = Instant::now();
        while !handle.is_finished() && started.elapsed() < Duration::from_secs(3) {
            send_packet(&server, tftp::Packet::Ack { block: 0 }, client).await;
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        assert!(handle.is_finished());
        assert!(matches!(handle.await.unwrap(), Err(TransferError::Timeout { attempts: 1 })));
    }

    // The whole of 127.0.0.0/8 is bound to the loopback interface on Linux.
    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_reply_from_other_ip_is_ignored_before_lock() {
        let (server, server_addr) = fake_server().await;
        let other = UdpSocket::bind((Ipv4Addr::new(127, 0, 0, 2), 0)).await.unwrap();
        let (_tmpdir, path, session) = download_session(server_addr, quick_config()).await;
        let handle = spawn_run(session, "hello.txt");

        let (_, client) = recv_packet(&server).await;
        send_packet(&other, tftp::Packet::Data { block: 1, data: vec![0xFF; 3] }, client).await;
        send_packet(&server, tftp::Packet::Data { block: 1, data: vec![0x61; 30] }, client).await;
        assert_eq!(recv_packet(&server).await.0, tftp::Packet::Ack { block: 1 });

        assert_ok!(handle.await.unwrap());
        assert_eq!(tokio::fs::read(&path).await.unwrap(), vec![0x61; 30]);

        // No ack and no error went back to the other address.
        let mut buf = [0u8; 64];
        assert!(tokio::time::timeout(Duration::from_millis(200), other.recv_from(&mut buf))
            .await
            .is_err());
    }
}
