use std::net::Ipv4Addr;
use std::path::PathBuf;
use uuid::Uuid;

/// Default port of the RPC listener.
pub const DEFAULT_PORT: u16 = 42000;

/// Configuration of one running instance.
///
/// Immutable once the server is started; the fields are public so a caller
/// can adjust them between construction and `Server::start`.
#[derive(Debug, Clone)]
pub struct Config {
    pub display_name: String,
    pub user_name: String,
    pub hostname: String,

    /// Identity of this instance on the network, also the registry key
    /// under which peers store us.
    pub uuid: String,

    /// Address of the network interface the listeners bind to and the
    /// multicast group is joined on. Unspecified lets the OS choose.
    pub interface: Ipv4Addr,
    pub port: u16,

    /// Where received files land.
    pub download_dir: PathBuf,
    pub allow_overwrite: bool,
    pub notify_incoming: bool,
}

impl Config {
    pub fn new(display_name: impl Into<String>, user_name: impl Into<String>) -> Self {
        let hostname = detect_hostname();
        let uuid = generate_uuid(&hostname);
        Self {
            display_name: display_name.into(),
            user_name: user_name.into(),
            hostname,
            uuid,
            interface: Ipv4Addr::UNSPECIFIED,
            port: DEFAULT_PORT,
            download_dir: default_download_dir(),
            allow_overwrite: false,
            notify_incoming: true,
        }
    }

    /// Creates the download directory if it does not exist yet.
    pub(crate) fn ensure_download_dir(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.download_dir)
    }
}

/// Generates the instance identity: the uppercased first hostname label
/// plus a 6-hex-digit random suffix, e.g. `MYHOST-1A2B3C`.
pub fn generate_uuid(hostname: &str) -> String {
    let label = hostname.split('.').next().unwrap_or(hostname);
    let random = Uuid::new_v4();
    let bytes = random.as_bytes();
    format!(
        "{}-{:02X}{:02X}{:02X}",
        label.to_uppercase(),
        bytes[0],
        bytes[1],
        bytes[2]
    )
}

fn detect_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".into())
}

fn default_download_dir() -> PathBuf {
    dirs::download_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join("Downloads")))
        .unwrap_or_else(|| ".".into())
        .join("Warpinator")
}
