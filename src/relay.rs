use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use log::{debug, error, info, warn};
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use crate::config::{FallbackPolicy, RelayConfig};
use crate::error::{ParseError, RelayError};
use crate::graceful::{shutdown_without_rst, ConnectionRecovery, GracefulShutdown};
use crate::strategy::Strategy;
use crate::tls::{ClientHello, RECORD_HEADER_LEN, TLS_HANDSHAKE};

const BUFFER_SIZE: usize = 65536;
const KEEPALIVE_TIME: Duration = Duration::from_secs(60);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Terminating TCP relay: reads the client's first TLS record, rewrites the
/// ClientHello and forwards everything else unchanged.
pub struct RelayServer {
    config: Arc<RelayConfig>,
    strategy: Arc<dyn Strategy>,
    shutdown: Arc<GracefulShutdown>,
}

impl RelayServer {
    pub fn new(config: RelayConfig, strategy: Arc<dyn Strategy>, shutdown: Arc<GracefulShutdown>) -> Self {
        Self {
            config: Arc::new(config),
            strategy,
            shutdown,
        }
    }

    /// Accepts until shutdown. Each connection runs on its own task.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!("Relay listening on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                _ = self.shutdown.wait_for_shutdown() => {
                    info!("Relay accept loop stopping");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            error!("Accept failed: {}", e);
                            continue;
                        }
                    };
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream, peer).await {
                            match e.downcast_ref::<RelayError>() {
                                Some(RelayError::NotInterceptable(_)) => {
                                    debug!("Connection from {} dropped: {}", peer, e)
                                }
                                Some(_) => warn!("Connection from {} closed: {}", peer, e),
                                None => error!("Connection from {} failed: {:#}", peer, e),
                            }
                        }
                    });
                }
            }
        }
    }

    pub async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let conn_id = self.shutdown.register_connection(peer);

        let result = self.process_connection(stream, peer, conn_id).await;

        if let Some(state) = self.shutdown.unregister_connection(conn_id) {
            debug!(
                "Connection {} from {} to {} closed after {:?}",
                state.id,
                state.peer,
                state.destination.as_deref().unwrap_or("-"),
                state.established_at.elapsed()
            );
        }
        result
    }

    async fn process_connection(&self, mut client: TcpStream, peer: SocketAddr, conn_id: u64) -> Result<()> {
        if let Err(e) = client.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }

        let limit = self.config.first_record_timeout();
        let first = match timeout(limit, read_first_record(&mut client, self.config.max_record_len)).await {
            Ok(read) => read.with_context(|| format!("reading first record from {}", peer))?,
            Err(_) => return Err(RelayError::FirstRecordTimeout(limit.as_secs()).into()),
        };

        let mut hello = match ClientHello::parse_record(&first, self.config.max_record_len) {
            Ok((hello, _)) => hello,
            Err(e) => return self.fallback(client, &first, e, conn_id).await,
        };

        let server_name = hello.server_name().to_string();
        if server_name.is_empty() {
            return Err(RelayError::DestinationUnresolved.into());
        }

        self.strategy.apply(&mut hello);
        let mutated = hello.serialize()?;

        let target = format!("{}:{}", server_name, self.config.upstream_port);
        self.shutdown.set_destination(conn_id, &target);
        let mut upstream = self.connect_to_target(&target).await?;
        upstream.write_all(&mutated).await?;

        info!(
            "Relaying {} to {} ({}, ClientHello {} -> {} bytes)",
            peer,
            target,
            self.strategy.name(),
            first.len(),
            mutated.len()
        );

        self.proxy_bidirectional(client, upstream, conn_id).await
    }

    async fn fallback(&self, client: TcpStream, first: &[u8], err: ParseError, conn_id: u64) -> Result<()> {
        match &self.config.fallback {
            FallbackPolicy::Drop => Err(RelayError::NotInterceptable(err).into()),
            FallbackPolicy::Relay { address } => {
                debug!("Connection {} not interceptable ({}), relaying raw to {}", conn_id, err, address);
                self.shutdown.set_destination(conn_id, address);
                let mut upstream = self.connect_to_target(address).await?;
                upstream.write_all(first).await?;
                self.proxy_bidirectional(client, upstream, conn_id).await
            }
        }
    }

    async fn connect_to_target(&self, target: &str) -> Result<TcpStream> {
        let connect_timeout = self.config.connect_timeout();
        let recovery = ConnectionRecovery::new();

        let stream = recovery
            .retry_with_backoff(move || async move {
                match timeout(connect_timeout, TcpStream::connect(target)).await {
                    Ok(conn) => conn.with_context(|| format!("connecting to {}", target)),
                    Err(_) => Err(anyhow!("connecting to {} timed out", target)),
                }
            })
            .await?;

        if let Err(e) = configure_upstream(&stream) {
            warn!("Failed to configure upstream socket for {}: {}", target, e);
        }
        Ok(stream)
    }

    /// Copies both directions until each side has sent EOF, either side
    /// fails, or shutdown begins.
    async fn proxy_bidirectional(&self, client: TcpStream, upstream: TcpStream, conn_id: u64) -> Result<()> {
        debug!("Starting bidirectional relay for connection {}", conn_id);

        let (mut client_read, mut client_write) = client.into_split();
        let (mut upstream_read, mut upstream_write) = upstream.into_split();

        let upload = pipe(&mut client_read, &mut upstream_write, &self.shutdown, conn_id);
        let download = pipe(&mut upstream_read, &mut client_write, &self.shutdown, conn_id);

        tokio::select! {
            result = async { tokio::try_join!(upload, download) } => {
                let (sent, received) = result?;
                debug!(
                    "Relay for connection {} ended: {} bytes up, {} bytes down",
                    conn_id, sent, received
                );
            }
            _ = self.shutdown.wait_for_shutdown() => {
                debug!("Shutdown detected for connection {}", conn_id);
            }
        }

        Ok(())
    }
}

/// Reads the 5-byte record header and, for a handshake record within the
/// size limit, exactly the body it declares. Nothing past the record is
/// consumed. Foreign headers come back alone for the caller to classify.
async fn read_first_record<R>(reader: &mut R, max_record_len: usize) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut record = vec![0u8; RECORD_HEADER_LEN];
    reader.read_exact(&mut record).await?;

    if record[0] != TLS_HANDSHAKE {
        return Ok(record);
    }
    let len = u16::from_be_bytes([record[3], record[4]]) as usize;
    if len > max_record_len {
        return Ok(record);
    }

    record.resize(RECORD_HEADER_LEN + len, 0);
    reader.read_exact(&mut record[RECORD_HEADER_LEN..]).await?;
    Ok(record)
}

async fn pipe<R, W>(reader: &mut R, writer: &mut W, registry: &GracefulShutdown, conn_id: u64) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            // peer finished sending; pass the FIN on
            if let Err(e) = shutdown_without_rst(writer).await {
                debug!("Half-close for connection {} failed: {}", conn_id, e);
            }
            return Ok(total);
        }
        writer.write_all(&buffer[..n]).await?;
        total += n as u64;
        registry.mark_activity(conn_id);
    }
}

fn configure_upstream(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let keepalive = TcpKeepalive::new()
        .with_time(KEEPALIVE_TIME)
        .with_interval(KEEPALIVE_INTERVAL);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy;
    use crate::tls::tests::{sample_hello, sample_random};
    use crate::tls::EXT_PADDING;
    use tokio::task::JoinHandle;

    const WAIT: Duration = Duration::from_secs(5);

    struct Harness {
        addr: SocketAddr,
        upstream: TcpListener,
        shutdown: Arc<GracefulShutdown>,
        server: JoinHandle<Result<()>>,
    }

    async fn start(configure: impl FnOnce(&mut RelayConfig, SocketAddr)) -> Harness {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();

        let mut config = RelayConfig::default();
        config.upstream_port = upstream_addr.port();
        configure(&mut config, upstream_addr);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = Arc::new(GracefulShutdown::new());
        let relay = Arc::new(RelayServer::new(config, Arc::new(strategy::basic()), shutdown.clone()));
        let server = tokio::spawn(relay.serve(listener));

        Harness {
            addr,
            upstream,
            shutdown,
            server,
        }
    }

    async fn read_record(stream: &mut TcpStream) -> Vec<u8> {
        let mut record = vec![0u8; RECORD_HEADER_LEN];
        stream.read_exact(&mut record).await.unwrap();
        let len = u16::from_be_bytes([record[3], record[4]]) as usize;
        record.resize(RECORD_HEADER_LEN + len, 0);
        stream.read_exact(&mut record[RECORD_HEADER_LEN..]).await.unwrap();
        record
    }

    async fn assert_closed(stream: &mut TcpStream) {
        let mut buf = [0u8; 16];
        let read = timeout(WAIT, stream.read(&mut buf)).await.expect("client was not closed");
        assert!(matches!(read, Ok(0) | Err(_)));
    }

    #[tokio::test]
    async fn test_relays_rewritten_hello_then_data() {
        let h = start(|_, _| {}).await;

        let mut client = TcpStream::connect(h.addr).await.unwrap();
        let hello = sample_hello("127.0.0.1").serialize().unwrap();
        client.write_all(&hello).await.unwrap();
        client.write_all(b"early data").await.unwrap();

        let (mut server, _) = timeout(WAIT, h.upstream.accept()).await.unwrap().unwrap();
        let record = read_record(&mut server).await;
        let forwarded = ClientHello::parse(&record).unwrap();
        assert_eq!(forwarded.server_name(), "");
        assert_eq!(forwarded.extensions().get(EXT_PADDING).unwrap().len(), 256);
        assert_eq!(forwarded.cipher_suites, vec![0x1301, 0x1302, 0xc02f]);

        let mut buf = [0u8; 10];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"early data");

        server.write_all(b"server hello").await.unwrap();
        let mut buf = [0u8; 12];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"server hello");

        // half-close travels through
        client.shutdown().await.unwrap();
        let mut rest = Vec::new();
        timeout(WAIT, server.read_to_end(&mut rest)).await.unwrap().unwrap();
        assert!(rest.is_empty());

        server.write_all(b"bye").await.unwrap();
        drop(server);
        let mut tail = Vec::new();
        timeout(WAIT, client.read_to_end(&mut tail)).await.unwrap().unwrap();
        assert_eq!(tail, b"bye");
    }

    #[tokio::test]
    async fn test_missing_server_name_closes_client() {
        let h = start(|_, _| {}).await;

        let mut client = TcpStream::connect(h.addr).await.unwrap();
        let hello = ClientHello::new(0x0303, sample_random(), vec![], vec![0x1301]);
        client.write_all(&hello.serialize().unwrap()).await.unwrap();

        assert_closed(&mut client).await;
        assert!(timeout(Duration::from_millis(200), h.upstream.accept()).await.is_err());
    }

    #[tokio::test]
    async fn test_non_tls_dropped_by_default() {
        let h = start(|_, _| {}).await;

        let mut client = TcpStream::connect(h.addr).await.unwrap();
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

        assert_closed(&mut client).await;
        assert!(timeout(Duration::from_millis(200), h.upstream.accept()).await.is_err());
    }

    #[tokio::test]
    async fn test_fallback_relays_raw_bytes() {
        let h = start(|config, upstream| {
            config.fallback = FallbackPolicy::Relay {
                address: upstream.to_string(),
            };
        })
        .await;

        let request = b"GET / HTTP/1.1\r\nHost: a\r\n\r\n";
        let mut client = TcpStream::connect(h.addr).await.unwrap();
        client.write_all(request).await.unwrap();

        let (mut server, _) = timeout(WAIT, h.upstream.accept()).await.unwrap().unwrap();
        let mut buf = vec![0u8; request.len()];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, request);
    }

    #[tokio::test]
    async fn test_handshake_that_is_not_a_client_hello_is_dropped() {
        let h = start(|_, _| {}).await;

        let mut record = sample_hello("a.example").serialize().unwrap().to_vec();
        record[5] = 0x02;
        let mut client = TcpStream::connect(h.addr).await.unwrap();
        client.write_all(&record).await.unwrap();

        assert_closed(&mut client).await;
        assert!(timeout(Duration::from_millis(200), h.upstream.accept()).await.is_err());
    }

    #[tokio::test]
    async fn test_oversized_record_goes_to_fallback_unchanged() {
        let h = start(|config, upstream| {
            config.max_record_len = 16;
            config.fallback = FallbackPolicy::Relay {
                address: upstream.to_string(),
            };
        })
        .await;

        let hello = sample_hello("a.example").serialize().unwrap();
        let mut client = TcpStream::connect(h.addr).await.unwrap();
        client.write_all(&hello).await.unwrap();

        let (mut server, _) = timeout(WAIT, h.upstream.accept()).await.unwrap().unwrap();
        let mut buf = vec![0u8; hello.len()];
        timeout(WAIT, server.read_exact(&mut buf)).await.unwrap().unwrap();
        assert_eq!(buf, hello.to_vec());
        assert_eq!(ClientHello::parse(&buf).unwrap().server_name(), "a.example");
    }

    #[tokio::test]
    async fn test_incomplete_first_record_times_out() {
        let h = start(|config, _| config.first_record_timeout_secs = 1).await;

        let mut client = TcpStream::connect(h.addr).await.unwrap();
        client.write_all(&[0x16, 0x03, 0x01]).await.unwrap();

        assert_closed(&mut client).await;
        assert_eq!(h.shutdown.graceful_close_all(WAIT).await, 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_pipes_and_accept_loop() {
        let h = start(|_, _| {}).await;

        let mut client = TcpStream::connect(h.addr).await.unwrap();
        client.write_all(&sample_hello("127.0.0.1").serialize().unwrap()).await.unwrap();
        let (mut server, _) = timeout(WAIT, h.upstream.accept()).await.unwrap().unwrap();
        read_record(&mut server).await;
        assert_eq!(h.shutdown.get_active_connections(), 1);

        h.shutdown.initiate_shutdown();
        assert_closed(&mut client).await;
        timeout(WAIT, h.server).await.unwrap().unwrap().unwrap();
        assert_eq!(h.shutdown.graceful_close_all(WAIT).await, 0);
    }

    #[tokio::test]
    async fn test_first_record_read_stops_at_record_end() {
        let hello = sample_hello("a.example").serialize().unwrap();
        let mut input = hello.to_vec();
        input.extend_from_slice(b"next");

        let mut reader = input.as_slice();
        let record = read_first_record(&mut reader, 64 * 1024).await.unwrap();
        assert_eq!(record, hello.to_vec());
        assert_eq!(reader, b"next");

        let mut foreign: &[u8] = b"SSH-2.0-x\r\n";
        assert_eq!(read_first_record(&mut foreign, 64 * 1024).await.unwrap(), b"SSH-2");
    }
}
