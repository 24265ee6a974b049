//! Timed HTTP GET with a full phase breakdown.
//!
//! No off-the-shelf Rust client exposes per-phase timings, so the tracer
//! drives the request itself: DNS, TCP connect, TLS handshake, request
//! write, first response byte and body drain are each timestamped. Every
//! probe is a cold request — the connection is opened fresh, carries
//! `Connection: close`, and is dropped once the body is drained — so the
//! DNS/connect/TLS phases are measured live on every run.

pub mod transport;

pub use transport::{TlsMeta, Transport, TransportCache};

use rustls::ProtocolVersion;
use rustls_pki_types::ServerName;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpSocket, TcpStream};
use tokio_rustls::TlsConnector;
use url::Url;

use crate::probe::ProbeError;
use crate::probe::http::transport::BoxedStream;
use crate::resolver::Resolver;

/// Everything one traced GET produced.
#[derive(Debug, Clone, Default)]
pub struct HttpResult {
    pub success: bool,
    pub dest_addr: String,
    pub status: u16,
    pub content_length: u64,
    pub dns_lookup: Duration,
    pub tcp_connection: Duration,
    pub tls_handshake: Duration,
    pub server_processing: Duration,
    pub content_transfer: Duration,
    pub total: Duration,
    pub tls_version: String,
    pub tls_earliest_cert_expiry: Option<i64>,
    pub tls_last_chain_expiry: Option<i64>,
}

/// Run one traced GET against `url` through the transport selected by
/// `(src, proxy)`.
pub async fn http_get(
    cache: &TransportCache,
    url: &str,
    src: Option<IpAddr>,
    proxy: Option<&Url>,
    timeout: Duration,
    resolver: &Resolver,
) -> Result<HttpResult, ProbeError> {
    let parsed = Url::parse(url).map_err(|e| ProbeError::Url {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(ProbeError::Url {
            url: url.to_string(),
            reason: format!("unsupported scheme {}", parsed.scheme()),
        });
    }
    if parsed.host_str().is_none() {
        return Err(ProbeError::Url {
            url: url.to_string(),
            reason: "missing host".to_string(),
        });
    }

    let transport = cache.get(src, proxy);
    let start = Instant::now();
    let mut result = tokio::time::timeout(timeout, run_trace(&transport, &parsed, resolver))
        .await
        .map_err(|_| ProbeError::Timeout)??;
    result.total = start.elapsed();
    result.dest_addr = url.to_string();
    result.success = true;
    Ok(result)
}

struct Established {
    stream: BoxedStream,
    tls: Option<TlsMeta>,
    dns_lookup: Duration,
    tcp_connection: Duration,
    tls_handshake: Duration,
}

struct Exchange {
    status: u16,
    content_length: u64,
    server_processing: Duration,
    content_transfer: Duration,
}

async fn run_trace(
    transport: &Transport,
    url: &Url,
    resolver: &Resolver,
) -> Result<HttpResult, ProbeError> {
    let host = url.host_str().unwrap_or_default().to_string();
    let port = url.port_or_known_default().unwrap_or(80);

    let established = establish(transport, url, &host, port, resolver).await?;
    let Established {
        stream,
        tls,
        dns_lookup,
        tcp_connection,
        tls_handshake,
    } = established;
    let exchange = exchange(stream, transport, url, &host, port)
        .await
        .map_err(ProbeError::from)?;

    let tls = tls.unwrap_or_default();
    Ok(HttpResult {
        status: exchange.status,
        content_length: exchange.content_length,
        dns_lookup,
        tcp_connection,
        tls_handshake,
        server_processing: exchange.server_processing,
        content_transfer: exchange.content_transfer,
        tls_version: tls.version,
        tls_earliest_cert_expiry: tls.earliest_cert_expiry,
        tls_last_chain_expiry: tls.last_chain_expiry,
        ..Default::default()
    })
}

/// Open a fresh connection for `url`: resolve, connect, and for https run
/// the TLS handshake (tunnelled through `CONNECT` when a proxy is set).
async fn establish(
    transport: &Transport,
    url: &Url,
    host: &str,
    port: u16,
    resolver: &Resolver,
) -> Result<Established, ProbeError> {
    // The TCP peer is the proxy when one is configured
    let (connect_host, connect_port) = match &transport.proxy {
        Some(proxy) => (
            proxy
                .host_str()
                .ok_or_else(|| ProbeError::Url {
                    url: proxy.as_str().to_string(),
                    reason: "proxy url missing host".to_string(),
                })?
                .to_string(),
            proxy.port_or_known_default().unwrap_or(3128),
        ),
        None => (host.to_string(), port),
    };

    // DNS phase; an IP literal costs nothing
    let mut dns_lookup = Duration::ZERO;
    let remote_ip = match connect_host.parse::<IpAddr>() {
        Ok(ip) => ip,
        Err(_) => {
            let dns_start = Instant::now();
            let ips = resolver
                .dest_addrs(&connect_host)
                .await
                .map_err(|e| ProbeError::Http(format!("resolving {connect_host}: {e}")))?;
            dns_lookup = dns_start.elapsed();
            pick_address(&ips, transport.local_addr).ok_or_else(|| {
                ProbeError::Http(format!("no usable address for {connect_host}"))
            })?
        }
    };

    // TCP connect phase
    let connect_start = Instant::now();
    let socket = if remote_ip.is_ipv6() {
        TcpSocket::new_v6()?
    } else {
        TcpSocket::new_v4()?
    };
    if let Some(local) = transport.local_addr {
        if local.is_ipv4() != remote_ip.is_ipv4() {
            return Err(ProbeError::InvalidSource {
                src: local.to_string(),
                target: connect_host.clone(),
            });
        }
        socket.bind(std::net::SocketAddr::new(local, 0))?;
    }
    let mut tcp = socket
        .connect(std::net::SocketAddr::new(remote_ip, connect_port))
        .await?;
    let tcp_connection = connect_start.elapsed();

    if url.scheme() != "https" {
        return Ok(Established {
            stream: Box::new(tcp),
            tls: None,
            dns_lookup,
            tcp_connection,
            tls_handshake: Duration::ZERO,
        });
    }

    // https through a proxy tunnels before the handshake
    if transport.proxy.is_some() {
        connect_tunnel(&mut tcp, host, port).await?;
    }

    // TLS phase
    let tls_start = Instant::now();
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| ProbeError::Tls(format!("invalid server name {host}: {e}")))?;
    let connector = TlsConnector::from(Arc::clone(&transport.tls_config));
    let tls_stream = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| ProbeError::Tls(e.to_string()))?;
    let tls_handshake = tls_start.elapsed();

    let meta = tls_metadata(tls_stream.get_ref().1);
    Ok(Established {
        stream: Box::new(tls_stream),
        tls: Some(meta),
        dns_lookup,
        tcp_connection,
        tls_handshake,
    })
}

/// Prefer an address in the same family as the egress bind.
fn pick_address(ips: &[IpAddr], local: Option<IpAddr>) -> Option<IpAddr> {
    match local {
        Some(l) => ips
            .iter()
            .find(|ip| ip.is_ipv4() == l.is_ipv4())
            .copied()
            .or_else(|| ips.first().copied()),
        None => ips.first().copied(),
    }
}

/// `CONNECT host:port` handshake on a fresh proxy connection.
async fn connect_tunnel(tcp: &mut TcpStream, host: &str, port: u16) -> Result<(), ProbeError> {
    let request = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n");
    tcp.write_all(request.as_bytes()).await?;
    tcp.flush().await?;

    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() > 16 * 1024 {
            return Err(ProbeError::Http("oversized CONNECT response".to_string()));
        }
        let n = tcp.read(&mut byte).await?;
        if n == 0 {
            return Err(ProbeError::Http(
                "proxy closed connection during CONNECT".to_string(),
            ));
        }
        head.push(byte[0]);
    }
    let status = parse_status_line(&head)?;
    if !(200..300).contains(&status) {
        return Err(ProbeError::Http(format!("proxy CONNECT failed: {status}")));
    }
    Ok(())
}

fn tls_metadata(conn: &rustls::ClientConnection) -> TlsMeta {
    let version = match conn.protocol_version() {
        Some(ProtocolVersion::TLSv1_2) => "TLS 1.2",
        Some(ProtocolVersion::TLSv1_3) => "TLS 1.3",
        _ => "unknown",
    }
    .to_string();

    let mut earliest: Option<i64> = None;
    let mut chain_min: Option<i64> = None;
    if let Some(certs) = conn.peer_certificates() {
        for cert in certs {
            let Ok((_, parsed)) = x509_parser::prelude::parse_x509_certificate(cert.as_ref())
            else {
                continue;
            };
            let not_after = parsed.validity().not_after.timestamp();
            if earliest.is_none_or(|cur| not_after < cur) {
                earliest = Some(not_after);
            }
            if chain_min.is_none_or(|cur| not_after < cur) {
                chain_min = Some(not_after);
            }
        }
    }

    TlsMeta {
        version,
        earliest_cert_expiry: earliest,
        // Only the presented chain is visible here, so the max-over-chains
        // of per-chain minima collapses to this chain's minimum
        last_chain_expiry: chain_min,
    }
}

/// Write the request and read the response through to the end of the body.
/// The stream is dropped (closed) on return.
async fn exchange(
    stream: BoxedStream,
    transport: &Transport,
    url: &Url,
    host: &str,
    port: u16,
) -> std::io::Result<Exchange> {
    let mut reader = BufReader::new(stream);

    let request = build_request(transport, url, host, port);
    reader.get_mut().write_all(request.as_bytes()).await?;
    reader.get_mut().flush().await?;

    let ready = Instant::now();
    let first = reader.fill_buf().await?;
    if first.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed before response",
        ));
    }
    let first_byte = Instant::now();

    let mut line = Vec::with_capacity(128);
    reader.read_until(b'\n', &mut line).await?;
    let status = parse_status_line(&line)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;

    // Headers
    let mut content_length: Option<u64> = None;
    let mut chunked = false;
    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed inside response header",
            ));
        }
        let text = String::from_utf8_lossy(&line);
        let text = text.trim();
        if text.is_empty() {
            break;
        }
        let Some((name, value)) = text.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match name.to_ascii_lowercase().as_str() {
            "content-length" => content_length = value.parse().ok(),
            "transfer-encoding" => chunked = value.eq_ignore_ascii_case("chunked"),
            _ => {}
        }
    }

    // Drain the body so content_transfer covers the full payload
    let body_bytes = if status == 204 || status == 304 {
        0
    } else if chunked {
        drain_chunked(&mut reader).await?
    } else if let Some(n) = content_length {
        tokio::io::copy(&mut (&mut reader).take(n), &mut tokio::io::sink()).await?
    } else {
        // Close-delimited body
        tokio::io::copy(&mut reader, &mut tokio::io::sink()).await?
    };
    let done = Instant::now();

    Ok(Exchange {
        status,
        content_length: content_length.unwrap_or(body_bytes),
        server_processing: first_byte - ready,
        content_transfer: done - first_byte,
    })
}

fn build_request(transport: &Transport, url: &Url, host: &str, port: u16) -> String {
    // Through a proxy, plain-http requests use the absolute form
    let target = if transport.proxy.is_some() && url.scheme() == "http" {
        url.as_str().to_string()
    } else {
        let mut t = url.path().to_string();
        if let Some(q) = url.query() {
            t.push('?');
            t.push_str(q);
        }
        t
    };
    let host_header = match (url.scheme(), port) {
        ("http", 80) | ("https", 443) => host.to_string(),
        _ => format!("{host}:{port}"),
    };
    // One request per connection; the close keeps the measurement honest
    format!(
        "GET {target} HTTP/1.1\r\nHost: {host_header}\r\nUser-Agent: netprobe/{}\r\nAccept: */*\r\nConnection: close\r\n\r\n",
        env!("CARGO_PKG_VERSION")
    )
}

fn parse_status_line(line: &[u8]) -> Result<u16, ProbeError> {
    let text = String::from_utf8_lossy(line);
    let mut parts = text.split_whitespace();
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        return Err(ProbeError::Http(format!("bad status line: {text}")));
    }
    parts
        .next()
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| ProbeError::Http(format!("bad status line: {text}")))
}

/// Consume a chunked body, returning the number of payload bytes.
async fn drain_chunked<R: tokio::io::AsyncBufRead + Unpin>(reader: &mut R) -> std::io::Result<u64> {
    let mut total = 0u64;
    let mut line = Vec::with_capacity(32);
    loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed inside chunked body",
            ));
        }
        let text = String::from_utf8_lossy(&line);
        let size_part = text.trim().split(';').next().unwrap_or_default().to_string();
        if size_part.is_empty() {
            // Tolerate a stray CRLF between chunks
            continue;
        }
        let size = u64::from_str_radix(&size_part, 16).map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("bad chunk size: {size_part}"),
            )
        })?;
        if size == 0 {
            // Trailers run until an empty line
            loop {
                line.clear();
                let n = reader.read_until(b'\n', &mut line).await?;
                if n == 0 || line == b"\r\n" || line == b"\n" {
                    break;
                }
            }
            return Ok(total);
        }
        tokio::io::copy(&mut (&mut *reader).take(size), &mut tokio::io::sink()).await?;
        total += size;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn test_resolver() -> Resolver {
        // Never queried in these tests; all hosts are IP literals
        Resolver::custom("127.0.0.1:53".parse().unwrap(), Duration::from_millis(250), true)
    }

    async fn serve_once(response: &'static [u8]) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2048];
            // Read the request head before answering
            let _ = socket.read(&mut buf).await;
            socket.write_all(response).await.unwrap();
            socket.flush().await.unwrap();
            // Keep the socket alive until the client has drained the body
            tokio::time::sleep(Duration::from_millis(200)).await;
        });
        port
    }

    #[tokio::test]
    async fn test_get_with_content_length() {
        let port = serve_once(
            b"HTTP/1.1 200 OK\r\nContent-Length: 11\r\nContent-Type: text/plain\r\n\r\nhello world",
        )
        .await;
        let cache = TransportCache::new();
        let resolver = test_resolver();

        let url = format!("http://127.0.0.1:{port}/probe");
        let out = http_get(&cache, &url, None, None, Duration::from_secs(2), &resolver)
            .await
            .unwrap();

        assert!(out.success);
        assert_eq!(out.status, 200);
        assert_eq!(out.content_length, 11);
        assert_eq!(out.dns_lookup, Duration::ZERO);
        assert!(out.tcp_connection > Duration::ZERO);
        assert_eq!(out.tls_handshake, Duration::ZERO);
        assert!(out.total > Duration::ZERO);
        assert!(out.tls_earliest_cert_expiry.is_none());
    }

    #[tokio::test]
    async fn test_get_with_chunked_body() {
        let port = serve_once(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
        )
        .await;
        let cache = TransportCache::new();
        let resolver = test_resolver();

        let url = format!("http://127.0.0.1:{port}/");
        let out = http_get(&cache, &url, None, None, Duration::from_secs(2), &resolver)
            .await
            .unwrap();

        assert_eq!(out.status, 200);
        assert_eq!(out.content_length, 11);
    }

    #[tokio::test]
    async fn test_invalid_url_is_rejected() {
        let cache = TransportCache::new();
        let resolver = test_resolver();
        let err = http_get(
            &cache,
            "not a url",
            None,
            None,
            Duration::from_secs(1),
            &resolver,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProbeError::Url { .. }));

        let err = http_get(
            &cache,
            "ftp://example.com/",
            None,
            None,
            Duration::from_secs(1),
            &resolver,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProbeError::Url { .. }));
    }

    #[tokio::test]
    async fn test_unreachable_server_times_out() {
        let cache = TransportCache::new();
        let resolver = test_resolver();
        // TEST-NET-1 black hole
        let err = http_get(
            &cache,
            "http://192.0.2.1/",
            None,
            None,
            Duration::from_millis(200),
            &resolver,
        )
        .await
        .unwrap_err();
        // A black-holed SYN times out; some environments answer with an
        // unreachable error instead
        assert!(matches!(err, ProbeError::Timeout | ProbeError::Socket(_)));
    }

    #[tokio::test]
    async fn test_mixed_family_source_is_rejected() {
        let port = serve_once(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await;
        let cache = TransportCache::new();
        let resolver = test_resolver();

        let url = format!("http://127.0.0.1:{port}/");
        let src: IpAddr = "::1".parse().unwrap();
        let err = http_get(
            &cache,
            &url,
            Some(src),
            None,
            Duration::from_secs(1),
            &resolver,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProbeError::InvalidSource { .. }));
    }

    #[test]
    fn test_parse_status_line() {
        assert_eq!(parse_status_line(b"HTTP/1.1 200 OK\r\n").unwrap(), 200);
        assert_eq!(parse_status_line(b"HTTP/1.0 404 Not Found\r\n").unwrap(), 404);
        assert!(parse_status_line(b"SSH-2.0-OpenSSH\r\n").is_err());
    }

    #[test]
    fn test_request_form() {
        let cache = TransportCache::new();
        let direct = cache.get(None, None);
        let url = Url::parse("http://example.com/a/b?x=1").unwrap();
        let req = build_request(&direct, &url, "example.com", 80);
        assert!(req.starts_with("GET /a/b?x=1 HTTP/1.1\r\n"));
        assert!(req.contains("Host: example.com\r\n"));
        // No reuse across probes
        assert!(req.contains("Connection: close\r\n"));

        let proxy = Url::parse("http://proxy.local:3128").unwrap();
        let proxied = cache.get(None, Some(&proxy));
        let req = build_request(&proxied, &url, "example.com", 80);
        assert!(req.starts_with("GET http://example.com/a/b?x=1 HTTP/1.1\r\n"));
        assert!(req.contains("Connection: close\r\n"));
    }

    #[test]
    fn test_address_preference_follows_bind_family() {
        let v4: IpAddr = "93.184.216.34".parse().unwrap();
        let v6: IpAddr = "2606:2800:220:1::1".parse().unwrap();
        let local4: IpAddr = "192.168.1.2".parse().unwrap();

        assert_eq!(pick_address(&[v6, v4], Some(local4)), Some(v4));
        assert_eq!(pick_address(&[v6, v4], None), Some(v6));
        assert_eq!(pick_address(&[], None), None);
    }
}
