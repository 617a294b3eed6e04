use thiserror::Error;

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    /// Capture or proxy started twice
    #[error("{0} is already running")]
    AlreadyRunning(&'static str),

    /// Stop requested while nothing is running
    #[error("{0} is not running")]
    NotRunning(&'static str),

    /// Failed to open the capture interface
    #[error("failed to open interface {iface}: {source}")]
    InterfaceOpenFailed {
        iface: String,
        #[source]
        source: pcap::Error,
    },

    /// Failed to install the BPF capture filter
    #[error("failed to set BPF filter: {0}")]
    BpfFilterFailed(#[source] pcap::Error),

    /// CA files missing or empty on load
    #[error("CA files not found at {0}")]
    CaNotFound(String),

    /// CA material present but not parseable as PEM
    #[error("malformed PEM: {0}")]
    MalformedPem(String),

    /// Private key PEM of a type we do not handle
    #[error("unsupported private key type: {0}")]
    UnsupportedKey(String),

    /// Certificate building or signing failed
    #[error("certificate error: {0}")]
    CertificateError(String),

    /// Could not reach the upstream server
    #[error("upstream dial failed: {0}")]
    UpstreamDialFailed(String),

    /// TLS handshake with client or upstream failed
    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(String),

    /// Request or response body could not be read in full
    #[error("failed to read body: {0}")]
    ReadBodyFailed(String),

    /// Malformed HTTP seen by the proxy
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A network operation exceeded its deadline
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Error from pcap library
    #[error("PCAP error: {0}")]
    Pcap(#[from] pcap::Error),

    /// Error from I/O operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error from JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AppError {
    /// True for error kinds that stem from an expired deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, AppError::Timeout(_))
    }
}

/// Result type for application
pub type AppResult<T> = Result<T, AppError>;
