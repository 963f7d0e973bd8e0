//! Client configuration

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::amf::{AmfValue, ObjectEncoding};
use crate::protocol::constants::{
    CLIENT_CHUNK_SIZE, DEFAULT_FLASH_VERSION, RTMPS_PORT, RTMP_PORT,
};

use super::delegate::ClientDelegate;
use super::transport::CertificateValidator;

/// Client configuration
#[derive(Clone)]
pub struct ClientConfig {
    /// URL to connect to (rtmp[s]://host[:port]/app)
    pub url: String,

    /// Application name sent in connect; defaults to the URL path
    pub app_name: Option<String>,

    /// Page URL to send
    pub page_url: Option<String>,

    /// SWF URL to send
    pub swf_url: Option<String>,

    /// Flash version string to send
    pub flash_ver: String,

    /// Outbound chunk size announced after the handshake
    pub chunk_size: u32,

    /// Encoding of outbound invocation arguments
    pub object_encoding: ObjectEncoding,

    /// Extra values appended to the connect invocation
    pub arguments: Vec<AmfValue>,

    /// Timeout for dialing, TLS and the connect invocation
    pub connect_timeout: Duration,

    /// Enable TCP_NODELAY
    pub tcp_nodelay: bool,

    /// Receive buffer announced before play, in milliseconds
    pub buffer_length: u32,

    /// Required for rtmps
    pub certificate_validator: Option<Arc<dyn CertificateValidator>>,

    /// Receives server-initiated calls without a channel
    pub delegate: Option<Arc<dyn ClientDelegate>>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            app_name: None,
            page_url: None,
            swf_url: None,
            flash_ver: DEFAULT_FLASH_VERSION.to_string(),
            chunk_size: CLIENT_CHUNK_SIZE,
            object_encoding: ObjectEncoding::Amf3,
            arguments: Vec::new(),
            connect_timeout: Duration::from_secs(10),
            tcp_nodelay: true,
            buffer_length: 1000,
            certificate_validator: None,
            delegate: None,
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("url", &self.url)
            .field("app_name", &self.app_name)
            .field("page_url", &self.page_url)
            .field("swf_url", &self.swf_url)
            .field("flash_ver", &self.flash_ver)
            .field("chunk_size", &self.chunk_size)
            .field("object_encoding", &self.object_encoding)
            .field("arguments", &self.arguments)
            .field("connect_timeout", &self.connect_timeout)
            .field("tcp_nodelay", &self.tcp_nodelay)
            .field("buffer_length", &self.buffer_length)
            .field("certificate_validator", &self.certificate_validator)
            .field("delegate", &self.delegate.is_some())
            .finish()
    }
}

impl ClientConfig {
    /// Create a new config with the given URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn app_name(mut self, app: impl Into<String>) -> Self {
        self.app_name = Some(app.into());
        self
    }

    pub fn page_url(mut self, url: impl Into<String>) -> Self {
        self.page_url = Some(url.into());
        self
    }

    pub fn swf_url(mut self, url: impl Into<String>) -> Self {
        self.swf_url = Some(url.into());
        self
    }

    pub fn flash_ver(mut self, version: impl Into<String>) -> Self {
        self.flash_ver = version.into();
        self
    }

    pub fn chunk_size(mut self, size: u32) -> Self {
        self.chunk_size = size;
        self
    }

    pub fn object_encoding(mut self, encoding: ObjectEncoding) -> Self {
        self.object_encoding = encoding;
        self
    }

    /// Append an extra connect argument
    pub fn argument(mut self, value: impl Into<AmfValue>) -> Self {
        self.arguments.push(value.into());
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn tcp_nodelay(mut self, enabled: bool) -> Self {
        self.tcp_nodelay = enabled;
        self
    }

    pub fn buffer_length(mut self, ms: u32) -> Self {
        self.buffer_length = ms;
        self
    }

    pub fn certificate_validator(mut self, validator: Arc<dyn CertificateValidator>) -> Self {
        self.certificate_validator = Some(validator);
        self
    }

    pub fn delegate(mut self, delegate: Arc<dyn ClientDelegate>) -> Self {
        self.delegate = Some(delegate);
        self
    }

    /// Parse URL into components
    pub fn parse_url(&self) -> Option<ParsedUrl> {
        // rtmp[s]://host[:port][/app]
        let (secure, rest) = if let Some(rest) = self.url.strip_prefix("rtmps://") {
            (true, rest)
        } else {
            (false, self.url.strip_prefix("rtmp://")?)
        };

        let (host_port, path) = rest.split_once('/').unwrap_or((rest, ""));
        let default_port = if secure { RTMPS_PORT } else { RTMP_PORT };
        let (host, port) = match host_port.rsplit_once(':') {
            Some((h, p)) => (h.to_string(), p.parse().ok()?),
            None => (host_port.to_string(), default_port),
        };
        if host.is_empty() {
            return None;
        }

        Some(ParsedUrl {
            secure,
            host,
            port,
            app: path.trim_end_matches('/').to_string(),
        })
    }

    /// App name sent in connect
    pub(crate) fn effective_app(&self, parsed: &ParsedUrl) -> String {
        self.app_name.clone().unwrap_or_else(|| parsed.app.clone())
    }
}

/// Parsed RTMP URL components
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedUrl {
    /// rtmps
    pub secure: bool,
    pub host: String,
    pub port: u16,
    /// Everything after the authority, without the leading slash
    pub app: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_parsing() {
        let config = ClientConfig::new("rtmp://localhost/live/room");
        let parsed = config.parse_url().unwrap();
        assert!(!parsed.secure);
        assert_eq!(parsed.host, "localhost");
        assert_eq!(parsed.port, 1935);
        assert_eq!(parsed.app, "live/room");

        let config = ClientConfig::new("rtmps://example.com:2443/app");
        let parsed = config.parse_url().unwrap();
        assert!(parsed.secure);
        assert_eq!(parsed.host, "example.com");
        assert_eq!(parsed.port, 2443);
        assert_eq!(parsed.app, "app");

        let parsed = ClientConfig::new("rtmps://example.com").parse_url().unwrap();
        assert_eq!(parsed.port, 443);
        assert_eq!(parsed.app, "");
    }

    #[test]
    fn test_url_rejects_other_schemes() {
        assert!(ClientConfig::new("http://example.com/app").parse_url().is_none());
        assert!(ClientConfig::new("rtmp://:1935/app").parse_url().is_none());
        assert!(ClientConfig::new("rtmp://host:port/app").parse_url().is_none());
    }

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.flash_ver, "WIN 21,0,0,174");
        assert_eq!(config.chunk_size, 4192);
        assert_eq!(config.object_encoding, ObjectEncoding::Amf3);
        assert!(config.certificate_validator.is_none());
    }

    #[test]
    fn test_builder_and_app_override() {
        let config = ClientConfig::new("rtmp://h/live")
            .app_name("other")
            .page_url("http://page")
            .argument("token")
            .argument(7.0)
            .object_encoding(ObjectEncoding::Amf0);
        let parsed = config.parse_url().unwrap();
        assert_eq!(config.effective_app(&parsed), "other");
        assert_eq!(config.arguments.len(), 2);
        assert_eq!(config.page_url.as_deref(), Some("http://page"));
        assert!(format!("{:?}", config).contains("rtmp://h/live"));
    }
}
