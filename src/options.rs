//! Typed option storage for sockets, endpoints and pipes.
//!
//! Options are name-keyed, typed values, validated on write and copied on
//! read. Names reuse the conventional spelling of the protocol family
//! (`recv-timeout`, `recv-size-max`, `sub:subscribe`, ...). An object asked
//! for an option it does not carry answers `NotSupported`; writing a
//! read-only option answers `ReadOnly`; a value of the wrong type answers
//! `BadType`.

use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::sockaddr::SockAddr;
use crate::tls::{TlsAuthMode, TlsConfig, TlsConfigBuilder, TlsMode};

/// Canonical option names.
pub mod names {
    pub const RECV_TIMEOUT: &str = "recv-timeout";
    pub const SEND_TIMEOUT: &str = "send-timeout";
    pub const RECV_BUFFER: &str = "recv-buffer";
    pub const SEND_BUFFER: &str = "send-buffer";
    pub const RECV_MAX_SIZE: &str = "recv-size-max";
    pub const RECONNECT_TIME_MIN: &str = "reconnect-time-min";
    pub const RECONNECT_TIME_MAX: &str = "reconnect-time-max";
    pub const RAW: &str = "raw";
    pub const PROTOCOL: &str = "protocol";
    pub const PROTOCOL_NAME: &str = "protocol-name";
    pub const PEER: &str = "peer";
    pub const PEER_NAME: &str = "peer-name";
    pub const SOCKET_NAME: &str = "socket-name";
    pub const TCP_NODELAY: &str = "tcp-nodelay";
    pub const TCP_KEEPALIVE: &str = "tcp-keepalive";
    pub const LOCAL_ADDRESS: &str = "local-address";
    pub const PEER_ADDRESS: &str = "peer-address";
    pub const URL: &str = "url";
    pub const TLS_CONFIG: &str = "tls-config";
    pub const TLS_CA_FILE: &str = "tls-ca-file";
    pub const TLS_CA_STRING: &str = "tls-ca-string";
    pub const TLS_CERT_KEY_FILE: &str = "tls-cert-key-file";
    pub const TLS_SERVER_NAME: &str = "tls-server-name";
    pub const TLS_AUTH_MODE: &str = "tls-auth-mode";
    pub const SUB_SUBSCRIBE: &str = "sub:subscribe";
    pub const SUB_UNSUBSCRIBE: &str = "sub:unsubscribe";
    pub const REQ_RESEND_TIME: &str = "req:resend-time";
    pub const SURVEYOR_SURVEY_TIME: &str = "surveyor:survey-time";
    pub const PAIR1_POLYAMOROUS: &str = "pair1:polyamorous";
}

/// A typed option value.
#[derive(Debug, Clone)]
pub enum OptionValue {
    /// Plain 32-bit integer.
    Int(i32),
    /// Size in bytes.
    Size(usize),
    /// Duration in milliseconds; −1 means infinite.
    Ms(i32),
    Bool(bool),
    Str(String),
    /// Raw bytes, for options whose values are not text (binary
    /// subscription prefixes).
    Bytes(Vec<u8>),
    /// Opaque TLS configuration.
    Tls(TlsConfig),
    Addr(SockAddr),
}

impl OptionValue {
    pub fn as_int(&self) -> Result<i32> {
        match self {
            OptionValue::Int(v) => Ok(*v),
            _ => Err(Error::BadType),
        }
    }

    pub fn as_size(&self) -> Result<usize> {
        match self {
            OptionValue::Size(v) => Ok(*v),
            // Accept a non-negative int where a size is expected.
            OptionValue::Int(v) if *v >= 0 => Ok(*v as usize),
            _ => Err(Error::BadType),
        }
    }

    pub fn as_ms(&self) -> Result<i32> {
        match self {
            OptionValue::Ms(v) => Ok(*v),
            OptionValue::Int(v) => Ok(*v),
            _ => Err(Error::BadType),
        }
    }

    pub fn as_bool(&self) -> Result<bool> {
        match self {
            OptionValue::Bool(v) => Ok(*v),
            _ => Err(Error::BadType),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            OptionValue::Str(v) => Ok(v),
            _ => Err(Error::BadType),
        }
    }

    /// Raw byte view; string values are their UTF-8 bytes.
    pub fn as_bytes(&self) -> Result<&[u8]> {
        match self {
            OptionValue::Bytes(v) => Ok(v),
            OptionValue::Str(v) => Ok(v.as_bytes()),
            _ => Err(Error::BadType),
        }
    }

    pub fn as_tls(&self) -> Result<TlsConfig> {
        match self {
            OptionValue::Tls(v) => Ok(v.clone()),
            _ => Err(Error::BadType),
        }
    }
}

/// Turn a millisecond option into a deadline-friendly duration.
/// −1 (infinite) becomes `None`.
pub(crate) fn ms_to_duration(ms: i32) -> Option<Duration> {
    if ms < 0 {
        None
    } else {
        Some(Duration::from_millis(ms as u64))
    }
}

fn validate_ms(ms: i32) -> Result<i32> {
    if ms < -1 {
        Err(Error::InvalidOperation)
    } else {
        Ok(ms)
    }
}

fn validate_buffer(count: i32) -> Result<usize> {
    if (1..=8192).contains(&count) {
        Ok(count as usize)
    } else {
        Err(Error::InvalidOperation)
    }
}

/// TLS-related options shared by sockets and endpoints. Endpoints snapshot
/// the socket's bundle when they are created and may override it later.
#[derive(Debug, Clone, Default)]
pub(crate) struct TlsOptions {
    pub config: Option<TlsConfig>,
    pub ca_file: Option<String>,
    pub ca_string: Option<String>,
    pub cert_key_file: Option<String>,
    pub server_name: Option<String>,
    pub auth_mode: Option<TlsAuthMode>,
}

impl TlsOptions {
    /// The effective config for one side of a handshake: an explicit
    /// `tls-config` wins, otherwise one is assembled from the string options.
    pub fn resolve(&self, mode: TlsMode) -> Result<Option<TlsConfig>> {
        if let Some(config) = &self.config {
            return Ok(Some(config.clone()));
        }
        let any_material = self.ca_file.is_some()
            || self.ca_string.is_some()
            || self.cert_key_file.is_some()
            || self.auth_mode.is_some()
            || self.server_name.is_some();
        if !any_material {
            return Ok(None);
        }
        let mut builder: TlsConfigBuilder = TlsConfig::builder(mode);
        if let Some(path) = &self.ca_file {
            builder = builder.ca_file(path);
        }
        if let Some(pem) = &self.ca_string {
            builder = builder.ca_string(pem);
        }
        if let Some(path) = &self.cert_key_file {
            builder = builder.cert_key_file(path);
        }
        if let Some(name) = &self.server_name {
            builder = builder.server_name(name);
        }
        if let Some(mode) = self.auth_mode {
            builder = builder.auth_mode(mode);
        }
        builder.build().map(Some)
    }

    fn get(&self, name: &str) -> Result<OptionValue> {
        match name {
            names::TLS_CONFIG => self
                .config
                .clone()
                .map(OptionValue::Tls)
                .ok_or(Error::NoEntry),
            names::TLS_CA_FILE => Ok(OptionValue::Str(self.ca_file.clone().unwrap_or_default())),
            names::TLS_CA_STRING => {
                Ok(OptionValue::Str(self.ca_string.clone().unwrap_or_default()))
            }
            names::TLS_CERT_KEY_FILE => Ok(OptionValue::Str(
                self.cert_key_file.clone().unwrap_or_default(),
            )),
            names::TLS_SERVER_NAME => Ok(OptionValue::Str(
                self.server_name.clone().unwrap_or_default(),
            )),
            names::TLS_AUTH_MODE => Ok(OptionValue::Int(
                self.auth_mode.unwrap_or(TlsAuthMode::None).as_i32(),
            )),
            _ => Err(Error::NotSupported),
        }
    }

    fn set(&mut self, name: &str, value: &OptionValue) -> Result<()> {
        match name {
            names::TLS_CONFIG => self.config = Some(value.as_tls()?),
            names::TLS_CA_FILE => self.ca_file = Some(value.as_str()?.to_owned()),
            names::TLS_CA_STRING => self.ca_string = Some(value.as_str()?.to_owned()),
            names::TLS_CERT_KEY_FILE => self.cert_key_file = Some(value.as_str()?.to_owned()),
            names::TLS_SERVER_NAME => self.server_name = Some(value.as_str()?.to_owned()),
            names::TLS_AUTH_MODE => {
                self.auth_mode = Some(TlsAuthMode::from_i32(value.as_int()?)?)
            }
            _ => return Err(Error::NotSupported),
        }
        Ok(())
    }

    fn is_tls_name(name: &str) -> bool {
        matches!(
            name,
            names::TLS_CONFIG
                | names::TLS_CA_FILE
                | names::TLS_CA_STRING
                | names::TLS_CERT_KEY_FILE
                | names::TLS_SERVER_NAME
                | names::TLS_AUTH_MODE
        )
    }
}

struct SocketState {
    name: String,
    recv_timeout_ms: i32,
    send_timeout_ms: i32,
    recv_buffer: usize,
    send_buffer: usize,
    recv_max_size: usize,
    reconnect_min_ms: i32,
    reconnect_max_ms: i32,
    tcp_nodelay: bool,
    tcp_keepalive: bool,
    tls: TlsOptions,
}

/// Option store owned by a socket.
pub(crate) struct SocketOptions {
    state: Mutex<SocketState>,
}

impl SocketOptions {
    pub fn new(socket_id: u32) -> Self {
        SocketOptions {
            state: Mutex::new(SocketState {
                name: socket_id.to_string(),
                recv_timeout_ms: -1,
                send_timeout_ms: -1,
                recv_buffer: crate::defaults::RECV_BUFFER,
                send_buffer: crate::defaults::SEND_BUFFER,
                recv_max_size: 0,
                reconnect_min_ms: crate::defaults::RECONNECT_TIME_MIN_MS,
                reconnect_max_ms: 0,
                tcp_nodelay: true,
                tcp_keepalive: false,
                tls: TlsOptions::default(),
            }),
        }
    }

    pub fn get(&self, name: &str) -> Result<OptionValue> {
        let state = self.state.lock();
        match name {
            names::SOCKET_NAME => Ok(OptionValue::Str(state.name.clone())),
            names::RECV_TIMEOUT => Ok(OptionValue::Ms(state.recv_timeout_ms)),
            names::SEND_TIMEOUT => Ok(OptionValue::Ms(state.send_timeout_ms)),
            names::RECV_BUFFER => Ok(OptionValue::Int(state.recv_buffer as i32)),
            names::SEND_BUFFER => Ok(OptionValue::Int(state.send_buffer as i32)),
            names::RECV_MAX_SIZE => Ok(OptionValue::Size(state.recv_max_size)),
            names::RECONNECT_TIME_MIN => Ok(OptionValue::Ms(state.reconnect_min_ms)),
            names::RECONNECT_TIME_MAX => Ok(OptionValue::Ms(state.reconnect_max_ms)),
            names::TCP_NODELAY => Ok(OptionValue::Bool(state.tcp_nodelay)),
            names::TCP_KEEPALIVE => Ok(OptionValue::Bool(state.tcp_keepalive)),
            names::RAW => Ok(OptionValue::Bool(false)),
            _ if TlsOptions::is_tls_name(name) => state.tls.get(name),
            _ => Err(Error::NotSupported),
        }
    }

    pub fn set(&self, name: &str, value: &OptionValue) -> Result<()> {
        let mut state = self.state.lock();
        match name {
            names::SOCKET_NAME => state.name = value.as_str()?.to_owned(),
            names::RECV_TIMEOUT => state.recv_timeout_ms = validate_ms(value.as_ms()?)?,
            names::SEND_TIMEOUT => state.send_timeout_ms = validate_ms(value.as_ms()?)?,
            names::RECV_BUFFER => state.recv_buffer = validate_buffer(value.as_int()?)?,
            names::SEND_BUFFER => state.send_buffer = validate_buffer(value.as_int()?)?,
            names::RECV_MAX_SIZE => state.recv_max_size = value.as_size()?,
            names::RECONNECT_TIME_MIN => {
                let ms = value.as_ms()?;
                if ms < 0 {
                    return Err(Error::InvalidOperation);
                }
                state.reconnect_min_ms = ms;
            }
            names::RECONNECT_TIME_MAX => {
                let ms = value.as_ms()?;
                if ms < 0 {
                    return Err(Error::InvalidOperation);
                }
                state.reconnect_max_ms = ms;
            }
            names::TCP_NODELAY => state.tcp_nodelay = value.as_bool()?,
            names::TCP_KEEPALIVE => state.tcp_keepalive = value.as_bool()?,
            names::RAW | names::PROTOCOL | names::PROTOCOL_NAME | names::PEER
            | names::PEER_NAME => return Err(Error::ReadOnly),
            _ if TlsOptions::is_tls_name(name) => state.tls.set(name, value)?,
            _ => return Err(Error::NotSupported),
        }
        Ok(())
    }

    pub fn socket_name(&self) -> String {
        self.state.lock().name.clone()
    }

    pub fn recv_timeout(&self) -> Option<Duration> {
        ms_to_duration(self.state.lock().recv_timeout_ms)
    }

    pub fn send_timeout(&self) -> Option<Duration> {
        ms_to_duration(self.state.lock().send_timeout_ms)
    }

    pub fn recv_buffer(&self) -> usize {
        self.state.lock().recv_buffer
    }

    pub fn send_buffer(&self) -> usize {
        self.state.lock().send_buffer
    }

    pub fn recv_max_size(&self) -> usize {
        self.state.lock().recv_max_size
    }

    /// Snapshot taken by a new endpoint: everything a transport attempt needs.
    pub fn endpoint_snapshot(&self) -> EndpointState {
        let state = self.state.lock();
        EndpointState {
            recv_max_size: state.recv_max_size,
            reconnect_min_ms: state.reconnect_min_ms,
            reconnect_max_ms: state.reconnect_max_ms,
            tcp_nodelay: state.tcp_nodelay,
            tcp_keepalive: state.tcp_keepalive,
            tls: state.tls.clone(),
            resolved_tls: None,
        }
    }
}

/// Mutable option state carried by a listener or dialer.
#[derive(Debug, Clone)]
pub(crate) struct EndpointState {
    pub recv_max_size: usize,
    pub reconnect_min_ms: i32,
    pub reconnect_max_ms: i32,
    pub tcp_nodelay: bool,
    pub tcp_keepalive: bool,
    pub tls: TlsOptions,
    /// Cached result of `tls.resolve`, invalidated when a TLS option changes.
    resolved_tls: Option<TlsConfig>,
}

pub(crate) struct EndpointOptions {
    state: Mutex<EndpointState>,
    dialer: bool,
}

impl EndpointOptions {
    pub fn new(snapshot: EndpointState, dialer: bool) -> Self {
        EndpointOptions {
            state: Mutex::new(snapshot),
            dialer,
        }
    }

    pub fn get(&self, name: &str) -> Result<OptionValue> {
        let state = self.state.lock();
        match name {
            names::RECV_MAX_SIZE => Ok(OptionValue::Size(state.recv_max_size)),
            names::TCP_NODELAY => Ok(OptionValue::Bool(state.tcp_nodelay)),
            names::TCP_KEEPALIVE => Ok(OptionValue::Bool(state.tcp_keepalive)),
            names::RECONNECT_TIME_MIN if self.dialer => {
                Ok(OptionValue::Ms(state.reconnect_min_ms))
            }
            names::RECONNECT_TIME_MAX if self.dialer => {
                Ok(OptionValue::Ms(state.reconnect_max_ms))
            }
            _ if TlsOptions::is_tls_name(name) => state.tls.get(name),
            _ => Err(Error::NotSupported),
        }
    }

    pub fn set(&self, name: &str, value: &OptionValue) -> Result<()> {
        let mut state = self.state.lock();
        match name {
            names::RECV_MAX_SIZE => state.recv_max_size = value.as_size()?,
            names::TCP_NODELAY => state.tcp_nodelay = value.as_bool()?,
            names::TCP_KEEPALIVE => state.tcp_keepalive = value.as_bool()?,
            names::RECONNECT_TIME_MIN if self.dialer => {
                let ms = value.as_ms()?;
                if ms < 0 {
                    return Err(Error::InvalidOperation);
                }
                state.reconnect_min_ms = ms;
            }
            names::RECONNECT_TIME_MAX if self.dialer => {
                let ms = value.as_ms()?;
                if ms < 0 {
                    return Err(Error::InvalidOperation);
                }
                state.reconnect_max_ms = ms;
            }
            names::URL | names::LOCAL_ADDRESS => return Err(Error::ReadOnly),
            _ if TlsOptions::is_tls_name(name) => {
                state.tls.set(name, value)?;
                state.resolved_tls = None;
            }
            _ => return Err(Error::NotSupported),
        }
        Ok(())
    }

    pub fn recv_max_size(&self) -> usize {
        self.state.lock().recv_max_size
    }

    /// Reconnect backoff bounds. The minimum is clamped to a 1 ms floor so a
    /// zero setting cannot turn into a busy-loop; a zero maximum disables
    /// exponential growth.
    pub fn reconnect_bounds(&self) -> (Duration, Option<Duration>) {
        let state = self.state.lock();
        let min = Duration::from_millis((state.reconnect_min_ms.max(1)) as u64);
        let max = if state.reconnect_max_ms > 0 {
            Some(Duration::from_millis(state.reconnect_max_ms as u64))
        } else {
            None
        };
        (min, max)
    }

    /// Build the per-attempt transport configuration.
    pub fn transport_config(&self, mode: TlsMode) -> Result<crate::transport::TransportConfig> {
        let mut state = self.state.lock();
        if state.resolved_tls.is_none() {
            state.resolved_tls = state.tls.resolve(mode)?;
        }
        Ok(crate::transport::TransportConfig {
            tcp_nodelay: state.tcp_nodelay,
            tcp_keepalive: state.tcp_keepalive,
            tls: state.resolved_tls.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_option_round_trip() {
        let opts = SocketOptions::new(7);
        assert_eq!(opts.get(names::SOCKET_NAME).unwrap().as_str().unwrap(), "7");

        opts.set(names::RECV_TIMEOUT, &OptionValue::Ms(250)).unwrap();
        assert_eq!(opts.recv_timeout(), Some(Duration::from_millis(250)));

        opts.set(names::RECV_TIMEOUT, &OptionValue::Ms(-1)).unwrap();
        assert_eq!(opts.recv_timeout(), None);

        assert_eq!(
            opts.set(names::RECV_TIMEOUT, &OptionValue::Ms(-2)).unwrap_err(),
            Error::InvalidOperation
        );
    }

    #[test]
    fn read_only_and_unknown_options() {
        let opts = SocketOptions::new(1);
        assert_eq!(
            opts.set(names::RAW, &OptionValue::Bool(true)).unwrap_err(),
            Error::ReadOnly
        );
        assert_eq!(opts.get("no-such-option").unwrap_err(), Error::NotSupported);
        assert_eq!(
            opts.set(names::RECV_BUFFER, &OptionValue::Int(0)).unwrap_err(),
            Error::InvalidOperation
        );
    }

    #[test]
    fn endpoint_snapshot_follows_socket_values() {
        let opts = SocketOptions::new(1);
        opts.set(names::RECV_MAX_SIZE, &OptionValue::Size(4096)).unwrap();
        let ep = EndpointOptions::new(opts.endpoint_snapshot(), true);
        assert_eq!(ep.recv_max_size(), 4096);

        // Listener-only store rejects dialer options.
        let listener_ep = EndpointOptions::new(opts.endpoint_snapshot(), false);
        assert_eq!(
            listener_ep.get(names::RECONNECT_TIME_MIN).unwrap_err(),
            Error::NotSupported
        );
    }

    #[test]
    fn reconnect_floor_is_one_millisecond() {
        let opts = SocketOptions::new(1);
        opts.set(names::RECONNECT_TIME_MIN, &OptionValue::Ms(0)).unwrap();
        let ep = EndpointOptions::new(opts.endpoint_snapshot(), true);
        let (min, max) = ep.reconnect_bounds();
        assert_eq!(min, Duration::from_millis(1));
        assert_eq!(max, None);
    }
}
