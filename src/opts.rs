//! Connection and coordinator options.

use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::buffer_pool::{BufferPool, DEFAULT_CHUNK_SIZE, GLOBAL_BUFFER_POOL};
use crate::error::Error;

/// Socket options applied to every backend link at connect time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketOpts {
    /// `SO_RCVBUF` in bytes.
    ///
    /// Default: `4194304`
    pub so_rcvbuf: u32,

    /// `SO_SNDBUF` in bytes.
    ///
    /// Default: `1048576`
    pub so_sndbuf: u32,

    /// `TCP_NODELAY`.
    ///
    /// Default: `true`
    pub tcp_nodelay: bool,
}

impl Default for SocketOpts {
    fn default() -> Self {
        Self {
            so_rcvbuf: 4 * 1024 * 1024,
            so_sndbuf: 1024 * 1024,
            tcp_nodelay: true,
        }
    }
}

/// Options for backend links and the coordinator.
#[derive(Debug, Clone)]
pub struct Opts {
    /// Hostname or IP address of the backend.
    ///
    /// Default: `""`
    pub host: String,

    /// Port number of the backend.
    ///
    /// Default: `3306`
    pub port: u16,

    /// Username for authentication.
    ///
    /// Default: `""`
    pub user: String,

    /// Password for authentication.
    ///
    /// Default: `None`
    pub password: Option<String>,

    /// Schema to use on the backend.
    ///
    /// Default: `None`
    pub schema: Option<String>,

    /// Character set used to encode messages sent to the client.
    ///
    /// Default: `"utf8mb4"`
    pub charset: String,

    /// Socket options.
    pub socket: SocketOpts,

    /// Size of the pooled read chunk per connection.
    ///
    /// Default: `8192`
    pub read_buffer_chunk: usize,

    /// Largest packet accepted from a backend.
    ///
    /// Default: `16777216`
    pub max_packet_size: usize,

    /// How long a connection keeps an oversized read buffer after the last
    /// large message before falling back to a pooled chunk.
    ///
    /// Default: `30s`
    pub large_buffer_revert: Duration,

    /// Prefix of the global XA transaction id.
    ///
    /// Default: `"zero_shard"`
    pub xa_id_prefix: String,

    /// Buffer pool shared by connections built from these options.
    ///
    /// Default: the global buffer pool
    pub buffer_pool: Arc<BufferPool>,

    /// Additional parameters.
    ///
    /// Default: `[]`
    pub params: Vec<(String, String)>,
}

impl Default for Opts {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 3306,
            user: String::new(),
            password: None,
            schema: None,
            charset: "utf8mb4".to_string(),
            socket: SocketOpts::default(),
            read_buffer_chunk: DEFAULT_CHUNK_SIZE,
            max_packet_size: 16 * 1024 * 1024,
            large_buffer_revert: Duration::from_secs(30),
            xa_id_prefix: "zero_shard".to_string(),
            buffer_pool: Arc::clone(&GLOBAL_BUFFER_POOL),
            params: Vec::new(),
        }
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, Error> {
    match value {
        "true" | "True" | "1" | "yes" | "on" => Ok(true),
        "false" | "False" | "0" | "no" | "off" => Ok(false),
        _ => Err(Error::InvalidUsage(format!("Invalid {}: {}", key, value))),
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, Error> {
    value
        .parse()
        .map_err(|_| Error::InvalidUsage(format!("Invalid {}: {}", key, value)))
}

impl TryFrom<&Url> for Opts {
    type Error = Error;

    /// Parse a MySQL backend URL.
    ///
    /// Format: `mysql://[user[:password]@]host[:port][/schema][?param1=value1&..]`
    ///
    /// Supported query parameters:
    /// - `charset`: client character set
    /// - `read_buffer_chunk`: pooled read chunk size (positive integer)
    /// - `max_packet_size`: largest accepted packet (positive integer)
    /// - `so_rcvbuf`, `so_sndbuf`: socket buffer sizes
    /// - `tcp_nodelay`: true/True/1/yes/on or false/False/0/no/off
    /// - `large_buffer_revert_secs`: seconds before an oversized buffer is released
    /// - `buffer_pool_capacity`: use a dedicated pool with this many idle chunks
    /// - `xa_id_prefix`: prefix of generated XA ids
    fn try_from(url: &Url) -> Result<Self, Self::Error> {
        if url.scheme() != "mysql" {
            return Err(Error::InvalidUsage(format!(
                "Invalid scheme: expected 'mysql://', got '{}://'",
                url.scheme()
            )));
        }

        let mut opts = Opts {
            host: url.host_str().unwrap_or("localhost").to_string(),
            port: url.port().unwrap_or(3306),
            user: url.username().to_string(),
            password: url.password().map(|s| s.to_string()),
            schema: url.path().strip_prefix('/').and_then(|s| {
                if s.is_empty() {
                    None
                } else {
                    Some(s.to_string())
                }
            }),
            ..Opts::default()
        };

        let mut pool_capacity: Option<usize> = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "charset" => opts.charset = value.to_string(),
                "read_buffer_chunk" => {
                    opts.read_buffer_chunk = parse_num(&key, &value)?;
                    if opts.read_buffer_chunk == 0 {
                        return Err(Error::InvalidUsage(
                            "read_buffer_chunk must be positive".into(),
                        ));
                    }
                }
                "max_packet_size" => opts.max_packet_size = parse_num(&key, &value)?,
                "so_rcvbuf" => opts.socket.so_rcvbuf = parse_num(&key, &value)?,
                "so_sndbuf" => opts.socket.so_sndbuf = parse_num(&key, &value)?,
                "tcp_nodelay" => opts.socket.tcp_nodelay = parse_bool(&key, &value)?,
                "large_buffer_revert_secs" => {
                    opts.large_buffer_revert = Duration::from_secs(parse_num(&key, &value)?);
                }
                "buffer_pool_capacity" => pool_capacity = Some(parse_num(&key, &value)?),
                "xa_id_prefix" => opts.xa_id_prefix = value.to_string(),
                _ => opts.params.push((key.to_string(), value.to_string())),
            }
        }

        if let Some(capacity) = pool_capacity {
            opts.buffer_pool = Arc::new(BufferPool::new(capacity, opts.read_buffer_chunk));
        } else if opts.read_buffer_chunk != opts.buffer_pool.chunk_size() {
            opts.buffer_pool = Arc::new(BufferPool::new(128, opts.read_buffer_chunk));
        }

        Ok(opts)
    }
}

impl TryFrom<&str> for Opts {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        let url = Url::parse(s).map_err(|e| Error::InvalidUsage(format!("Invalid URL: {}", e)))?;
        Self::try_from(&url)
    }
}
