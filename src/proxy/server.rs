//! HTTP(S) forward proxy with CONNECT interception.
//!
//! Plain requests are forwarded and recorded as flows. CONNECT tunnels are
//! hijacked when HTTPS interception is enabled: the client gets a leaf
//! certificate minted from the local root, and the decrypted requests flow
//! through the same recording path with scheme `https`. With interception
//! off, CONNECT degrades to a raw byte splice.

use chrono::Utc;
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::{ring, CryptoProvider};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{
    ClientConfig, DigitallySignedStruct, ProtocolVersion, ServerConfig, SignatureScheme,
};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::models::flow::{
    CertificateInfo, ErrorInfo, Flow, FlowCompletion, HttpRequestInfo, HttpResponseInfo,
    NetworkInfo, TlsInfo,
};
use crate::models::stats::NetworkStats;
use crate::proxy::ca;
use crate::proxy::content::analyze_content;
use crate::proxy::monitor::{GeoLocationService, NetworkMonitor};
use crate::proxy::perf::{ErrorCollector, PerformanceCollector, TimedResolver};
use crate::proxy::signer::LeafSigner;
use crate::storage::FlowStorage;
use crate::utils::error::{AppError, AppResult};

/// Deadline for the upstream TCP connect
const UPSTREAM_DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on a request or response head
const MAX_HEAD_BYTES: usize = 64 * 1024;

struct ProxyState {
    flow_store: Arc<dyn FlowStorage>,
    perf: PerformanceCollector,
    monitor: NetworkMonitor,
    errors: ErrorCollector,
    geo: GeoLocationService,
    resolver: TimedResolver,
    signer: RwLock<Option<Arc<LeafSigner>>>,
    https: bool,
}

/// The interception proxy server.
pub struct ProxyServer {
    addr: String,
    state: Arc<ProxyState>,
    running: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    conn_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl ProxyServer {
    /// Create a proxy bound to `addr` once started. `https` enables
    /// CONNECT interception via the local root CA.
    pub fn new(addr: &str, https: bool, flow_store: Arc<dyn FlowStorage>) -> AppResult<Self> {
        Ok(Self {
            addr: normalize_addr(addr),
            state: Arc::new(ProxyState {
                flow_store,
                perf: PerformanceCollector::new(),
                monitor: NetworkMonitor::new(),
                errors: ErrorCollector::new(),
                geo: GeoLocationService::new(),
                resolver: TimedResolver::system()?,
                signer: RwLock::new(None),
                https,
            }),
            running: AtomicBool::new(false),
            local_addr: Mutex::new(None),
            accept_task: Mutex::new(None),
            conn_tasks: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Bind the listener and start accepting. A second call fails with
    /// `AlreadyRunning`.
    pub async fn start(&self) -> AppResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(AppError::AlreadyRunning("proxy"));
        }

        if self.state.https {
            let material = ca::ensure_ca()?;
            let signer = LeafSigner::new(&material)?;
            *self.state.signer.write() = Some(Arc::new(signer));
        }

        let listener = match TcpListener::bind(&self.addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(AppError::Io(e));
            }
        };
        let local = listener.local_addr()?;
        *self.local_addr.lock() = Some(local);
        info!(
            "proxy listening on {} (interception {})",
            local,
            if self.state.https { "on" } else { "off" }
        );

        let state = self.state.clone();
        let conn_tasks = self.conn_tasks.clone();
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let state = state.clone();
                        let task = tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, peer, state).await {
                                debug!("connection from {} ended: {}", peer, e);
                            }
                        });
                        let mut tasks = conn_tasks.lock();
                        tasks.retain(|t| !t.is_finished());
                        tasks.push(task);
                    }
                    Err(e) => {
                        error!("accept failed: {}", e);
                    }
                }
            }
        });
        *self.accept_task.lock() = Some(handle);
        Ok(())
    }

    /// Stop accepting and drop in-flight connections.
    pub fn stop(&self) -> AppResult<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(AppError::NotRunning("proxy"));
        }
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
        for task in self.conn_tasks.lock().drain(..) {
            task.abort();
        }
        *self.local_addr.lock() = None;
        info!("proxy stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Address actually bound, once running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn network_stats(&self) -> HashMap<String, NetworkStats> {
        self.state.monitor.get_all_stats()
    }

    pub fn performance_stats(
        &self,
    ) -> HashMap<String, crate::models::flow::PerformanceMetrics> {
        self.state.perf.get_all_metrics()
    }
}

fn normalize_addr(addr: &str) -> String {
    if let Some(port) = addr.strip_prefix(':') {
        format!("0.0.0.0:{}", port)
    } else {
        addr.to_string()
    }
}

/// One parsed request or response head
#[derive(Debug, Clone)]
struct MessageHead {
    start_line: String,
    headers: Vec<(String, String)>,
}

impl MessageHead {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn header_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::with_capacity(self.headers.len());
        for (k, v) in &self.headers {
            map.entry(k.clone()).or_insert_with(|| v.clone());
        }
        map
    }

    fn wants_close(&self) -> bool {
        self.header("Connection")
            .map(|v| v.eq_ignore_ascii_case("close"))
            .unwrap_or(false)
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: Arc<ProxyState>,
) -> AppResult<()> {
    let mut reader = BufReader::new(stream);
    let Some(head) = read_head(&mut reader).await? else {
        return Ok(());
    };

    let (method, target, _version) = parse_request_line(&head.start_line)?;

    if method == "CONNECT" {
        let mut stream = reader.into_inner();
        let signer = state.signer.read().clone();
        match signer {
            Some(signer) if state.https => {
                intercept_tls(&mut stream, &target, peer, signer, state).await
            }
            _ => tunnel(stream, &target).await,
        }
    } else {
        serve_requests(reader, Some(head), "http", None, peer, state).await
    }
}

/// Hijack a CONNECT tunnel: acknowledge, present a minted leaf, then serve
/// the decrypted requests like plain ones with scheme `https`.
async fn intercept_tls(
    stream: &mut TcpStream,
    target: &str,
    peer: SocketAddr,
    signer: Arc<LeafSigner>,
    state: Arc<ProxyState>,
) -> AppResult<()> {
    stream
        .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
        .await?;
    stream.flush().await?;

    let host = target.split(':').next().unwrap_or(target);
    let leaf = signer.sign_host(host)?;

    let mut chain_pem = leaf.cert_pem.clone();
    chain_pem.push_str(signer.ca_cert_pem());
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut chain_pem.as_bytes())
        .collect::<Result<_, _>>()
        .map_err(|e| AppError::MalformedPem(format!("leaf chain: {}", e)))?;
    let key = rustls_pemfile::private_key(&mut leaf.key_pem.as_bytes())
        .map_err(|e| AppError::MalformedPem(format!("leaf key: {}", e)))?
        .ok_or_else(|| AppError::MalformedPem("no key in leaf PEM".to_string()))?;

    let config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| AppError::TlsHandshakeFailed(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| AppError::TlsHandshakeFailed(e.to_string()))?;

    let acceptor = TlsAcceptor::from(Arc::new(config));
    let tls_stream = acceptor
        .accept(stream)
        .await
        .map_err(|e| AppError::TlsHandshakeFailed(e.to_string()))?;

    let reader = BufReader::new(tls_stream);
    serve_requests(reader, None, "https", Some(target.to_string()), peer, state).await
}

/// Raw CONNECT tunnel without interception.
async fn tunnel(mut client: TcpStream, target: &str) -> AppResult<()> {
    let (host, port) = split_host_port(target, 443);
    let addr = format!("{}:{}", host, port);

    let mut upstream = tokio::time::timeout(UPSTREAM_DIAL_TIMEOUT, TcpStream::connect(&addr))
        .await
        .map_err(|_| AppError::Timeout(format!("connect to {}", addr)))?
        .map_err(|e| AppError::UpstreamDialFailed(format!("{}: {}", addr, e)))?;

    client
        .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
        .await?;

    let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
    Ok(())
}

/// Serve sequential requests from one (possibly decrypted) client stream.
async fn serve_requests<S>(
    mut reader: BufReader<S>,
    first: Option<MessageHead>,
    scheme: &str,
    authority: Option<String>,
    peer: SocketAddr,
    state: Arc<ProxyState>,
) -> AppResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut pending = first;
    loop {
        let head = match pending.take() {
            Some(head) => head,
            None => match read_head(&mut reader).await {
                Ok(Some(head)) => head,
                Ok(None) => break,
                Err(e) => {
                    debug!("client stream from {} ended: {}", peer, e);
                    break;
                }
            },
        };

        let client_wants_close = head.wants_close();
        let body = read_message_body(&mut reader, &head, false).await?;

        let keep_going =
            handle_http(reader.get_mut(), &head, body, scheme, authority.as_deref(), peer, &state)
                .await;

        if !keep_going || client_wants_close {
            break;
        }
    }
    Ok(())
}

/// Forward one request, recording the full flow. Returns false when the
/// connection should close.
async fn handle_http<W>(
    writer: &mut W,
    head: &MessageHead,
    body: Vec<u8>,
    scheme: &str,
    authority: Option<&str>,
    peer: SocketAddr,
    state: &Arc<ProxyState>,
) -> bool
where
    W: AsyncWrite + Unpin,
{
    let Ok((method, target, version)) = parse_request_line(&head.start_line) else {
        let _ = writer.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await;
        return false;
    };

    let (host, origin_target) = resolve_target(&target, head.header("Host"), authority);
    if host.is_empty() {
        let _ = writer.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await;
        return false;
    }

    let flow_id = uuid::Uuid::new_v4().to_string();
    let start = Utc::now();
    state.perf.start_collecting(&flow_id);
    let (path, query) = split_path_query(&origin_target);
    let url = format!("{}://{}{}", scheme, host, origin_target);

    let headers = head.header_map();
    let declared_length = head
        .header("Content-Length")
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(body.len() as i64);

    let flow = Flow {
        id: flow_id.clone(),
        scheme: scheme.to_string(),
        remote_addr: peer.to_string(),
        start_at: start,
        end_at: None,
        latency_ms: None,
        request: HttpRequestInfo {
            method: method.clone(),
            url,
            path,
            query,
            host: host.clone(),
            headers: headers.clone(),
            body: body.clone(),
            proto: version.clone(),
            length: declared_length,
        },
        response: None,
        performance: Some(state.perf.get_metrics(&flow_id).unwrap_or_default()),
        tls: None,
        error: None,
        content: Some(analyze_content(&body, &headers)),
        network: Some(build_network_info(peer, &host, state)),
    };
    state.flow_store.add(flow);

    spawn_dns_timing(state.clone(), flow_id.clone(), host.clone());

    let default_port = if scheme == "https" { 443 } else { 80 };
    let result = forward_upstream(
        state,
        &flow_id,
        scheme,
        &host,
        default_port,
        &method,
        &origin_target,
        &head.headers,
        &body,
    )
    .await;

    match result {
        Ok(upstream) => {
            let end = Utc::now();
            let latency = (end - start).num_milliseconds();
            state.perf.record_total_time(&flow_id, latency);

            let response_headers = upstream.head.header_map();
            let content = analyze_content(&upstream.body, &response_headers);
            let response = HttpResponseInfo {
                status: format_status(&upstream.head.start_line),
                status_code: upstream.status_code,
                headers: response_headers,
                body: upstream.body.clone(),
                proto: upstream.proto.clone(),
                length: upstream.body.len() as i64,
            };

            let success = upstream.status_code < 400;
            state
                .monitor
                .record_request(&host, success, latency, upstream.body.len() as i64);

            state.flow_store.complete(
                &flow_id,
                FlowCompletion {
                    end_at: Some(end),
                    latency_ms: Some(latency),
                    response: Some(response),
                    performance: state.perf.get_metrics(&flow_id),
                    tls: upstream.tls.clone(),
                    error: None,
                    content: Some(content),
                },
            );
            state.perf.cleanup(&flow_id);
            state.errors.cleanup(&flow_id);

            let close = upstream.head.wants_close();
            if let Err(e) = write_response(writer, &upstream).await {
                debug!("client write failed: {}", e);
                return false;
            }
            !close
        }
        Err((kind, err)) => {
            warn!("flow {} aborted: {}", flow_id, err);
            let end = Utc::now();
            let latency = (end - start).num_milliseconds();
            state
                .errors
                .record_error(&flow_id, kind, err.to_string(), err.is_timeout());

            state.monitor.record_request(&host, false, latency, 0);
            state.flow_store.complete(
                &flow_id,
                FlowCompletion {
                    end_at: Some(end),
                    latency_ms: Some(latency),
                    response: None,
                    performance: state.perf.get_metrics(&flow_id),
                    tls: None,
                    error: state
                        .errors
                        .get_error(&flow_id)
                        .or_else(|| Some(ErrorInfo::new(kind, err.to_string(), err.is_timeout()))),
                    content: None,
                },
            );
            state.perf.cleanup(&flow_id);
            state.errors.cleanup(&flow_id);

            let _ = writer.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await;
            false
        }
    }
}

struct UpstreamResponse {
    head: MessageHead,
    status_code: u16,
    proto: String,
    body: Vec<u8>,
    tls: Option<TlsInfo>,
}

#[allow(clippy::too_many_arguments)]
async fn forward_upstream(
    state: &Arc<ProxyState>,
    flow_id: &str,
    scheme: &str,
    host: &str,
    default_port: u16,
    method: &str,
    origin_target: &str,
    headers: &[(String, String)],
    body: &[u8],
) -> Result<UpstreamResponse, (&'static str, AppError)> {
    let (host_name, port) = split_host_port(host, default_port);
    let addr = format!("{}:{}", host_name, port);

    let dial_started = Instant::now();
    let tcp = tokio::time::timeout(UPSTREAM_DIAL_TIMEOUT, TcpStream::connect(&addr))
        .await
        .map_err(|_| {
            (
                "network",
                AppError::Timeout(format!("connect to {}", addr)),
            )
        })?
        .map_err(|e| {
            (
                "network",
                AppError::UpstreamDialFailed(format!("{}: {}", addr, e)),
            )
        })?;
    state.perf.record_tcp_connect(flow_id, dial_started.elapsed());

    let request_bytes = serialize_request(method, origin_target, headers, &host_name, port, default_port, body);

    if scheme == "https" {
        let connector = TlsConnector::from(upstream_tls_config());
        let server_name = ServerName::try_from(host_name.clone())
            .map_err(|_| ("tls", AppError::TlsHandshakeFailed(format!("bad SNI {}", host_name))))?;

        let tls_started = Instant::now();
        let tls_stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| ("tls", AppError::TlsHandshakeFailed(e.to_string())))?;
        state.perf.record_tls_handshake(flow_id, tls_started.elapsed());

        let tls_info = collect_tls_info(tls_stream.get_ref().1);
        let mut response = exchange(state, flow_id, tls_stream, &request_bytes).await?;
        response.tls = Some(tls_info);
        Ok(response)
    } else {
        exchange(state, flow_id, tcp, &request_bytes).await
    }
}

/// Write the serialized request, then read the full response with TTFB and
/// transfer timing.
async fn exchange<S>(
    state: &Arc<ProxyState>,
    flow_id: &str,
    stream: S,
    request_bytes: &[u8],
) -> Result<UpstreamResponse, (&'static str, AppError)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = BufReader::new(stream);
    stream
        .get_mut()
        .write_all(request_bytes)
        .await
        .map_err(|e| ("network", AppError::Io(e)))?;

    let sent_at = Instant::now();
    let head = read_head(&mut stream)
        .await
        .map_err(|e| ("network", e))?
        .ok_or((
            "network",
            AppError::ReadBodyFailed("upstream closed before responding".to_string()),
        ))?;
    state.perf.record_ttfb(flow_id, sent_at.elapsed());

    let (proto, status_code) = parse_status_line(&head.start_line)
        .map_err(|e| ("network", e))?;

    let transfer_started = Instant::now();
    let body = read_message_body(&mut stream, &head, true)
        .await
        .map_err(|e| ("network", e))?;
    state
        .perf
        .record_content_transfer(flow_id, transfer_started.elapsed());

    Ok(UpstreamResponse {
        head,
        status_code,
        proto,
        body,
        tls: None,
    })
}

fn spawn_dns_timing(state: Arc<ProxyState>, flow_id: String, host: String) {
    tokio::spawn(async move {
        match state.resolver.resolve_with_timing(&host).await {
            Ok((_, elapsed)) => state.perf.record_dns_lookup(&flow_id, elapsed),
            Err(e) => {
                state
                    .errors
                    .record_error(&flow_id, "dns", e.to_string(), e.is_timeout());
            }
        }
    });
}

/// Read a start line plus headers, bounded by `MAX_HEAD_BYTES`.
async fn read_head<R>(reader: &mut R) -> AppResult<Option<MessageHead>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    let start_line = line.trim_end().to_string();
    if start_line.is_empty() {
        return Err(AppError::InvalidRequest("empty start line".to_string()));
    }

    let mut headers = Vec::new();
    let mut total = start_line.len();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            break;
        }
        total += n;
        if total > MAX_HEAD_BYTES {
            return Err(AppError::InvalidRequest("head too large".to_string()));
        }
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            break;
        }
        if let Some(idx) = trimmed.find(':') {
            let (key, value) = trimmed.split_at(idx);
            headers.push((key.trim().to_string(), value[1..].trim().to_string()));
        }
    }

    Ok(Some(MessageHead {
        start_line,
        headers,
    }))
}

/// Read a message body: chunked when declared, otherwise by Content-Length,
/// otherwise (responses only) to EOF.
async fn read_message_body<R>(
    reader: &mut R,
    head: &MessageHead,
    allow_read_to_end: bool,
) -> AppResult<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    if head
        .header("Transfer-Encoding")
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false)
    {
        return read_chunked_body(reader).await;
    }

    if let Some(length) = head.header("Content-Length").and_then(|v| v.parse::<usize>().ok()) {
        let mut body = vec![0u8; length];
        reader
            .read_exact(&mut body)
            .await
            .map_err(|e| AppError::ReadBodyFailed(e.to_string()))?;
        return Ok(body);
    }

    if allow_read_to_end {
        let mut body = Vec::new();
        reader
            .read_to_end(&mut body)
            .await
            .map_err(|e| AppError::ReadBodyFailed(e.to_string()))?;
        return Ok(body);
    }

    Ok(Vec::new())
}

async fn read_chunked_body<R>(reader: &mut R) -> AppResult<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut body = Vec::new();
    loop {
        let mut size_line = String::new();
        if reader.read_line(&mut size_line).await? == 0 {
            return Err(AppError::ReadBodyFailed(
                "connection closed mid-chunk".to_string(),
            ));
        }
        let size_token = size_line.trim().split(';').next().unwrap_or_default();
        let size = usize::from_str_radix(size_token, 16)
            .map_err(|_| AppError::ReadBodyFailed(format!("bad chunk size {:?}", size_token)))?;

        if size == 0 {
            // drain trailers up to the final empty line
            loop {
                let mut trailer = String::new();
                let n = reader.read_line(&mut trailer).await?;
                if n == 0 || trailer.trim_end().is_empty() {
                    break;
                }
            }
            return Ok(body);
        }

        let start = body.len();
        body.resize(start + size, 0);
        reader
            .read_exact(&mut body[start..])
            .await
            .map_err(|e| AppError::ReadBodyFailed(e.to_string()))?;

        let mut crlf = [0u8; 2];
        reader
            .read_exact(&mut crlf)
            .await
            .map_err(|e| AppError::ReadBodyFailed(e.to_string()))?;
    }
}

/// Rebuild the request for the upstream hop. The buffered body is
/// substituted back unchanged; framing headers are normalized to match it.
fn serialize_request(
    method: &str,
    origin_target: &str,
    headers: &[(String, String)],
    host_name: &str,
    port: u16,
    default_port: u16,
    body: &[u8],
) -> Vec<u8> {
    let mut out = format!("{} {} HTTP/1.1\r\n", method, origin_target).into_bytes();

    let mut saw_host = false;
    for (key, value) in headers {
        let lower = key.to_ascii_lowercase();
        if matches!(
            lower.as_str(),
            "proxy-connection" | "connection" | "content-length" | "transfer-encoding"
        ) {
            continue;
        }
        if lower == "host" {
            saw_host = true;
        }
        out.extend_from_slice(format!("{}: {}\r\n", key, value).as_bytes());
    }
    if !saw_host {
        let host_header = if port == default_port {
            host_name.to_string()
        } else {
            format!("{}:{}", host_name, port)
        };
        out.extend_from_slice(format!("Host: {}\r\n", host_header).as_bytes());
    }
    out.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    out.extend_from_slice(b"Connection: close\r\n\r\n");
    out.extend_from_slice(body);
    out
}

/// Relay the buffered response to the client, re-framed with an exact
/// Content-Length (chunked bodies were already de-chunked).
async fn write_response<W>(writer: &mut W, upstream: &UpstreamResponse) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut out = format!("{}\r\n", upstream.head.start_line).into_bytes();
    for (key, value) in &upstream.head.headers {
        let lower = key.to_ascii_lowercase();
        if matches!(
            lower.as_str(),
            "content-length" | "transfer-encoding" | "connection"
        ) {
            continue;
        }
        out.extend_from_slice(format!("{}: {}\r\n", key, value).as_bytes());
    }
    out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", upstream.body.len()).as_bytes());
    out.extend_from_slice(&upstream.body);

    writer.write_all(&out).await?;
    writer.flush().await
}

fn parse_request_line(line: &str) -> AppResult<(String, String, String)> {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(target), Some(version)) => Ok((
            method.to_string(),
            target.to_string(),
            version.to_string(),
        )),
        _ => Err(AppError::InvalidRequest(format!(
            "malformed request line {:?}",
            line
        ))),
    }
}

fn parse_status_line(line: &str) -> AppResult<(String, u16)> {
    let mut parts = line.split_whitespace();
    let proto = parts
        .next()
        .filter(|p| p.starts_with("HTTP/"))
        .ok_or_else(|| AppError::InvalidRequest(format!("malformed status line {:?}", line)))?;
    let code = parts
        .next()
        .and_then(|c| c.parse::<u16>().ok())
        .ok_or_else(|| AppError::InvalidRequest(format!("malformed status line {:?}", line)))?;
    Ok((proto.to_string(), code))
}

/// "HTTP/1.1 200 OK" -> "200 OK"
fn format_status(status_line: &str) -> String {
    match status_line.find(' ') {
        Some(idx) => status_line[idx + 1..].to_string(),
        None => status_line.to_string(),
    }
}

/// Work out the request host and the origin-form target to forward.
fn resolve_target(
    target: &str,
    host_header: Option<&str>,
    authority: Option<&str>,
) -> (String, String) {
    if let Some(rest) = target
        .strip_prefix("http://")
        .or_else(|| target.strip_prefix("https://"))
    {
        return match rest.find('/') {
            Some(idx) => (rest[..idx].to_string(), rest[idx..].to_string()),
            None => (rest.to_string(), "/".to_string()),
        };
    }

    let host = host_header
        .map(str::to_string)
        .or_else(|| authority.map(str::to_string))
        .unwrap_or_default();
    let origin = if target.starts_with('/') {
        target.to_string()
    } else {
        format!("/{}", target)
    };
    (host, origin)
}

fn split_host_port(host: &str, default_port: u16) -> (String, u16) {
    match host.rsplit_once(':') {
        Some((name, port)) => match port.parse::<u16>() {
            Ok(port) => (name.to_string(), port),
            Err(_) => (host.to_string(), default_port),
        },
        None => (host.to_string(), default_port),
    }
}

fn split_path_query(target: &str) -> (String, String) {
    match target.split_once('?') {
        Some((path, query)) => (path.to_string(), query.to_string()),
        None => (target.to_string(), String::new()),
    }
}

fn build_network_info(peer: SocketAddr, host: &str, state: &Arc<ProxyState>) -> NetworkInfo {
    let client_ip = peer.ip().to_string();
    let (server_ip, server_port) = split_host_port(host, 0);
    let (country, region, city, isp, asn) = state.geo.location_info(&client_ip);

    NetworkInfo {
        client_ip: client_ip.clone(),
        server_ip,
        client_port: peer.port(),
        server_port,
        is_ipv6: peer.is_ipv6(),
        is_localhost: peer.ip().is_loopback(),
        is_private: state.geo.is_private(&client_ip),
        country,
        region,
        city,
        isp,
        asn,
    }
}

/// TLS session details from the upstream client connection.
fn collect_tls_info(conn: &tokio_rustls::rustls::ClientConnection) -> TlsInfo {
    let version = match conn.protocol_version() {
        Some(ProtocolVersion::TLSv1_2) => "TLS 1.2".to_string(),
        Some(ProtocolVersion::TLSv1_3) => "TLS 1.3".to_string(),
        Some(other) => format!("{:?}", other),
        None => "Unknown".to_string(),
    };
    let cipher_suite = conn
        .negotiated_cipher_suite()
        .map(|suite| format!("{:?}", suite.suite()))
        .unwrap_or_else(|| "Unknown".to_string());

    let certificate = conn
        .peer_certificates()
        .and_then(|certs| certs.first())
        .and_then(|der| certificate_summary(der.as_ref()));

    TlsInfo {
        version,
        cipher_suite,
        certificate,
        is_secure: true,
        protocol: "TLS".to_string(),
    }
}

fn certificate_summary(der: &[u8]) -> Option<CertificateInfo> {
    use x509_parser::prelude::*;

    let (_, cert) = parse_x509_certificate(der).ok()?;
    let subject = cert.subject().to_string();
    let issuer = cert.issuer().to_string();

    let odt_to_chrono = |odt: ::time::OffsetDateTime| {
        chrono::DateTime::<Utc>::from_timestamp(odt.unix_timestamp(), 0)
    };
    let not_before = odt_to_chrono(cert.validity().not_before.to_datetime());
    let not_after = odt_to_chrono(cert.validity().not_after.to_datetime());

    let now = Utc::now();
    let is_valid = match (not_before, not_after) {
        (Some(nb), Some(na)) => now > nb && now < na,
        _ => false,
    };

    let fingerprint: String = cert
        .signature_value
        .data
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect();

    Some(CertificateInfo {
        is_self_signed: subject == issuer,
        subject,
        issuer,
        not_before,
        not_after,
        serial_number: cert.tbs_certificate.serial.to_string(),
        fingerprint,
        is_valid,
    })
}

/// Accept-anything verifier for the upstream hop: the proxy is an
/// observation tool and records the peer certificate instead of failing
/// closed. The recorded summary carries the validity verdict.
#[derive(Debug)]
struct InsecureUpstreamVerifier {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for InsecureUpstreamVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, tokio_rustls::rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

fn upstream_tls_config() -> Arc<ClientConfig> {
    let provider = Arc::new(ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .expect("ring provider supports the default protocol versions")
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(InsecureUpstreamVerifier { provider }))
        .with_no_client_auth();
    Arc::new(config)
}
