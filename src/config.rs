//! Settings loaded from the environment and an optional config file.
//!
//! Values are taken, in increasing priority, from the defaults, the
//! `RTSPIO_*` environment variables and the first of `./rtspio.toml` and
//! `./config.toml` that exists. Files hold `key = value` lines; keys are
//! the lowercase field names, environment variables the uppercase ones
//! prefixed with `RTSPIO_`.

use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use log::{debug, warn};

use crate::format::rtsp::{ClientOptions, ServerConfig, Transport};

const CONFIG_PATHS: [&str; 2] = ["./rtspio.toml", "./config.toml"];
const ENV_PREFIX: &str = "RTSPIO_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// URL used by demos and tests.
    pub rtsp_url: String,
    /// `udp`, `multicast` or `tcp`; unset lets the client choose.
    pub transport: Option<Transport>,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub keepalive_period: Duration,
    pub user_agent: Option<String>,
    pub rtsp_address: String,
    pub udp_rtp_address: Option<String>,
    pub udp_rtcp_address: Option<String>,
    pub multicast_ip_range: Option<String>,
    pub session_timeout: Duration,
    pub write_queue_size: usize,
}

impl Default for Settings {
    fn default() -> Self {
        let server = ServerConfig::default();
        Self {
            rtsp_url: String::from("rtsp://example.com:8554/stream"),
            transport: None,
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            keepalive_period: Duration::from_secs(30),
            user_agent: None,
            rtsp_address: server.rtsp_address,
            udp_rtp_address: None,
            udp_rtcp_address: None,
            multicast_ip_range: None,
            session_timeout: server.session_timeout,
            write_queue_size: server.write_queue_size,
        }
    }
}

impl Settings {
    pub fn load() -> Self {
        let mut settings = Settings::default();

        for (key, value) in env::vars() {
            if let Some(name) = key.strip_prefix(ENV_PREFIX) {
                settings.apply(&name.to_ascii_lowercase(), &value);
            }
        }

        if let Some(content) = CONFIG_PATHS.iter().find_map(|p| fs::read_to_string(p).ok()) {
            settings.apply_file(&content);
        }

        settings
    }

    /// Applies the `key = value` lines of a config file. Blank lines,
    /// comments and section headers are skipped.
    pub fn apply_file(&mut self, content: &str) {
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('[') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                let value = value.trim().trim_matches('"').trim_matches('\'');
                self.apply(key.trim(), value);
            }
        }
    }

    fn apply(&mut self, key: &str, value: &str) {
        let optional = |v: &str| Some(v.to_string()).filter(|v| !v.is_empty());
        // zero would disable a timeout or spin a keep-alive timer
        let seconds = |v: &str| {
            v.parse::<u64>()
                .ok()
                .filter(|s| *s > 0)
                .map(Duration::from_secs)
        };

        let applied = match key {
            "rtsp_url" => {
                self.rtsp_url = value.to_string();
                true
            }
            "transport" => match value.to_ascii_lowercase().as_str() {
                "" => {
                    self.transport = None;
                    true
                }
                "udp" => {
                    self.transport = Some(Transport::Udp);
                    true
                }
                "multicast" => {
                    self.transport = Some(Transport::UdpMulticast);
                    true
                }
                "tcp" => {
                    self.transport = Some(Transport::Tcp);
                    true
                }
                _ => false,
            },
            "read_timeout" => seconds(value).map(|d| self.read_timeout = d).is_some(),
            "write_timeout" => seconds(value).map(|d| self.write_timeout = d).is_some(),
            "keepalive_period" => seconds(value).map(|d| self.keepalive_period = d).is_some(),
            "session_timeout" => seconds(value).map(|d| self.session_timeout = d).is_some(),
            "user_agent" => {
                self.user_agent = optional(value);
                true
            }
            "rtsp_address" => {
                self.rtsp_address = value.to_string();
                true
            }
            "udp_rtp_address" => {
                self.udp_rtp_address = optional(value);
                true
            }
            "udp_rtcp_address" => {
                self.udp_rtcp_address = optional(value);
                true
            }
            "multicast_ip_range" => {
                self.multicast_ip_range = optional(value);
                true
            }
            "write_queue_size" => match value.parse::<usize>() {
                Ok(n) if n > 0 => {
                    self.write_queue_size = n;
                    true
                }
                _ => false,
            },
            _ => {
                debug!("ignoring unknown setting '{}'", key);
                return;
            }
        };

        if !applied {
            warn!("invalid value '{}' for setting '{}'", value, key);
        }
    }

    pub fn client_options(&self) -> ClientOptions {
        let mut options = ClientOptions::new()
            .with_read_timeout(self.read_timeout)
            .with_write_timeout(self.write_timeout)
            .with_keepalive_period(self.keepalive_period);
        if let Some(transport) = self.transport {
            options = options.with_transport(transport);
        }
        if let Some(user_agent) = &self.user_agent {
            options = options.with_user_agent(user_agent);
        }
        options
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            rtsp_address: self.rtsp_address.clone(),
            udp_rtp_address: self.udp_rtp_address.clone(),
            udp_rtcp_address: self.udp_rtcp_address.clone(),
            multicast_ip_range: self.multicast_ip_range.clone(),
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
            session_timeout: self.session_timeout,
            write_queue_size: self.write_queue_size,
            ..ServerConfig::default()
        }
    }
}

/// Creates a default config template file if it doesn't exist
pub fn create_default_config_template<P: AsRef<Path>>(path: P) -> std::io::Result<()> {
    if !path.as_ref().exists() {
        let template = r#"# rtspio configuration
# Every key can also be set through an RTSPIO_<KEY> environment variable.

# URL used by demos and tests
rtsp_url = "rtsp://example.com:8554/stream"

# client: udp, multicast or tcp (empty lets the client choose)
transport = ""
read_timeout = 10
write_timeout = 10
keepalive_period = 30

# server
rtsp_address = "0.0.0.0:8554"
# udp_rtp_address = "0.0.0.0:8000"
# udp_rtcp_address = "0.0.0.0:8001"
# multicast_ip_range = "224.1.0.0/16"
session_timeout = 60
write_queue_size = 256
"#;
        fs::write(path, template)?;
    }
    Ok(())
}
