use std::time::Duration;

use clap::Parser;

use crate::error::ConfigError;
use crate::protocol::{
    FrameFormat, DEFAULT_LENGTH_WIDTH, DEFAULT_MAX_FRAME_BYTES, DEFAULT_TYPE_WIDTH,
};

#[derive(Parser, Debug, Clone)]
#[command(name = "relay-hub", version, about = "Interactive controller for framed TCP agents")]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "RELAY_HUB_HOST", default_value = "0.0.0.0")]
    pub host: String,
    #[arg(long, env = "RELAY_HUB_PORT", default_value_t = 5000)]
    pub port: u16,
    /// Pending-connection queue length
    #[arg(long, env = "RELAY_HUB_BACKLOG", default_value_t = 4)]
    pub backlog: u32,
    /// Bytes in the message type field
    #[arg(long, default_value_t = DEFAULT_TYPE_WIDTH)]
    pub type_width: usize,
    /// Bytes in the message length field
    #[arg(long, default_value_t = DEFAULT_LENGTH_WIDTH)]
    pub length_width: usize,
    /// Largest encoded payload accepted from an agent
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_BYTES)]
    pub max_frame_bytes: u64,
    /// Seconds an agent has to identify itself
    #[arg(long, default_value_t = 4)]
    pub handshake_timeout: u64,
    /// Seconds between keepalive passes, 0 disables them
    #[arg(long, default_value_t = 30)]
    pub ping_interval: u64,
    /// Seconds a keepalive send may take before the agent is dropped
    #[arg(long, default_value_t = 4)]
    pub ping_timeout: u64,
    /// Seconds to wait for each agent reply, 0 waits forever
    #[arg(long, default_value_t = 0)]
    pub reply_timeout: u64,
    /// Unrelated messages tolerated before an expected reply
    #[arg(long, default_value_t = 2)]
    pub expect_retries: u32,
    #[arg(long, env = "RELAY_HUB_DEBUG", default_value_t = false)]
    pub debug: bool,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub backlog: u32,
    pub format: FrameFormat,
    pub handshake_timeout: Duration,
    /// `None` when keepalive is disabled.
    pub ping_interval: Option<Duration>,
    pub ping_timeout: Duration,
    /// `None` waits forever.
    pub reply_timeout: Option<Duration>,
    pub expect_retries: u32,
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            backlog: 4,
            format: FrameFormat::default(),
            handshake_timeout: Duration::from_secs(4),
            ping_interval: Some(Duration::from_secs(30)),
            ping_timeout: Duration::from_secs(4),
            reply_timeout: None,
            expect_retries: 2,
            debug: false,
        }
    }
}

impl Config {
    pub fn from_args(args: Args) -> Result<Self, ConfigError> {
        let format = FrameFormat::new(args.type_width, args.length_width, args.max_frame_bytes)?;
        if args.handshake_timeout == 0 {
            return Err(ConfigError::ZeroDuration("handshake timeout"));
        }
        if args.ping_timeout == 0 {
            return Err(ConfigError::ZeroDuration("ping timeout"));
        }

        Ok(Self {
            host: args.host,
            port: args.port,
            backlog: args.backlog,
            format,
            handshake_timeout: Duration::from_secs(args.handshake_timeout),
            ping_interval: secs_or_none(args.ping_interval),
            ping_timeout: Duration::from_secs(args.ping_timeout),
            reply_timeout: secs_or_none(args.reply_timeout),
            expect_retries: args.expect_retries,
            debug: args.debug,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn secs_or_none(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}
