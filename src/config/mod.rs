use std::env;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;
pub const DEFAULT_LIVENESS_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_MIN_RECORDING_SECS: u64 = 5;
pub const DEFAULT_MAX_RECORDING_SECS: u64 = 60 * 10;
pub const DEFAULT_VIDEO_BITRATE: u32 = 500_000;
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub server: ServerConfig,
    pub liveness: LivenessConfig,
    pub face: FaceConfig,
    pub recording: RecordingConfig,
    pub signaling: SignalingConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct LivenessConfig {
    pub match_threshold: f32,
    pub interval: Duration,
    /// Clear `isHighlighted` when the participant leaves mid-incident.
    pub clear_highlight_on_leave: bool,
}

#[derive(Debug, Clone)]
pub struct FaceConfig {
    pub min_confidence: f32,
    pub overlay_min_confidence: f32,
}

#[derive(Debug, Clone)]
pub struct RecordingConfig {
    pub min_duration: Duration,
    pub max_duration: Duration,
    pub watchdog_tick: Duration,
    pub video_bitrate: u32,
    pub output_dir: String,
}

#[derive(Debug, Clone)]
pub struct SignalingConfig {
    pub url: String,
    pub stun_servers: Vec<String>,
    pub turn_servers: Vec<TurnServer>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TurnServer {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub blob_store_url: Option<String>,
    pub upload_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9000,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            blob_store_url: None,
            upload_timeout_secs: 300,
        }
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            interval: Duration::from_millis(DEFAULT_LIVENESS_INTERVAL_MS),
            clear_highlight_on_leave: false,
        }
    }
}

impl Default for FaceConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.5,
            overlay_min_confidence: 0.1,
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            min_duration: Duration::from_secs(DEFAULT_MIN_RECORDING_SECS),
            max_duration: Duration::from_secs(DEFAULT_MAX_RECORDING_SECS),
            watchdog_tick: Duration::from_millis(1000),
            video_bitrate: DEFAULT_VIDEO_BITRATE,
            output_dir: "./recordings".to_string(),
        }
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9000/signal".to_string(),
            stun_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            turn_servers: vec![],
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        let mut turn_servers = vec![];
        if let (Ok(turn_url), Ok(username), Ok(credential)) = (
            env::var("TURN_SERVER_URL"),
            env::var("TURN_USERNAME"),
            env::var("TURN_CREDENTIAL"),
        ) {
            turn_servers.push(TurnServer {
                urls: vec![turn_url],
                username,
                credential,
            });
        }

        Self {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env_parse("SERVER_PORT", 9000),
            },
            liveness: LivenessConfig {
                match_threshold: env_parse("LIVENESS_MATCH_THRESHOLD", DEFAULT_MATCH_THRESHOLD),
                interval: Duration::from_millis(env_parse(
                    "LIVENESS_INTERVAL_MS",
                    DEFAULT_LIVENESS_INTERVAL_MS,
                )),
                clear_highlight_on_leave: env_parse("LIVENESS_CLEAR_HIGHLIGHT_ON_LEAVE", false),
            },
            face: FaceConfig {
                min_confidence: env_parse("FACE_MIN_CONFIDENCE", 0.5),
                overlay_min_confidence: env_parse("FACE_OVERLAY_MIN_CONFIDENCE", 0.1),
            },
            recording: RecordingConfig {
                min_duration: Duration::from_secs(env_parse(
                    "RECORDING_MIN_DURATION_SECS",
                    DEFAULT_MIN_RECORDING_SECS,
                )),
                max_duration: Duration::from_secs(env_parse(
                    "RECORDING_MAX_DURATION_SECS",
                    DEFAULT_MAX_RECORDING_SECS,
                )),
                watchdog_tick: Duration::from_millis(env_parse("RECORDING_WATCHDOG_TICK_MS", 1000)),
                video_bitrate: env_parse("RECORDING_VIDEO_BITRATE", DEFAULT_VIDEO_BITRATE),
                output_dir: env::var("RECORDING_OUTPUT_DIR")
                    .unwrap_or_else(|_| "./recordings".to_string()),
            },
            signaling: SignalingConfig {
                url: env::var("SIGNALING_URL")
                    .unwrap_or_else(|_| "ws://127.0.0.1:9000/signal".to_string()),
                stun_servers: vec![env::var("STUN_SERVER_URL")
                    .unwrap_or_else(|_| DEFAULT_STUN_SERVER.to_string())],
                turn_servers,
            },
            storage: StorageConfig {
                blob_store_url: env::var("BLOB_STORE_URL").ok().filter(|u| !u.is_empty()),
                upload_timeout_secs: env_parse("BLOB_UPLOAD_TIMEOUT_SECS", 300),
            },
        }
    }

    pub fn bind_address(&self) -> ([u8; 4], u16) {
        let ip_addr = self.parse_host_to_ipv4();
        (ip_addr.octets(), self.server.port)
    }

    fn parse_host_to_ipv4(&self) -> Ipv4Addr {
        if let Ok(addr) = self.server.host.parse::<IpAddr>() {
            match addr {
                IpAddr::V4(ipv4) => return ipv4,
                IpAddr::V6(_) => {
                    tracing::warn!(
                        host = %self.server.host,
                        "IPv6 address provided but only IPv4 supported, using 0.0.0.0"
                    );
                    return Ipv4Addr::new(0, 0, 0, 0);
                }
            }
        }

        match self.server.host.as_str() {
            "localhost" => Ipv4Addr::new(127, 0, 0, 1),
            "" | "0.0.0.0" => Ipv4Addr::new(0, 0, 0, 0),
            _ => {
                tracing::warn!(
                    host = %self.server.host,
                    "Unable to parse host as IPv4, using 0.0.0.0"
                );
                Ipv4Addr::new(0, 0, 0, 0)
            }
        }
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(key = %key, value = %raw, "Invalid value, using default");
                default
            }
        },
        Err(_) => default,
    }
}
