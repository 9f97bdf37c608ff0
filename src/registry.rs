use crate::aggregator::ResolvedService;
use crate::aggregator::ResolvedSink;
use crate::connector::Connector;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Connection lifecycle of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Another running instance of the service, de-duplicated by its UUID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remote {
    pub uuid: String,
    pub hostname: String,
    pub address: Ipv4Addr,
    pub port: u16,
    /// Whether the peer's advertisement is currently seen on the network.
    pub service_available: bool,
    pub status: RemoteStatus,
}

/// Authoritative map of peer identity to peer state.
///
/// At most one `Remote` exists per UUID; a peer is updated in place, never
/// replaced. Every observable mutation is published to subscribers as a
/// snapshot.
pub struct Registry {
    own_uuid: String,
    remotes: DashMap<String, Remote>,
    connector: Arc<dyn Connector>,
    events: broadcast::Sender<Remote>,
}

impl Registry {
    pub fn new(own_uuid: String, connector: Arc<dyn Connector>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            own_uuid,
            remotes: DashMap::new(),
            connector,
            events,
        }
    }

    /// Observer channel: receives a snapshot whenever a peer is created or
    /// has any observable field mutated.
    pub fn subscribe(&self) -> broadcast::Receiver<Remote> {
        self.events.subscribe()
    }

    pub fn get(&self, uuid: &str) -> Option<Remote> {
        self.remotes.get(uuid).map(|r| r.value().clone())
    }

    pub fn remotes(&self) -> Vec<Remote> {
        self.remotes.iter().map(|r| r.value().clone()).collect()
    }

    /// A peer's advertisement was fully resolved.
    pub fn on_resolved(&self, service: ResolvedService) {
        let uuid = match service.full_name.split('.').next() {
            Some(uuid) if !uuid.is_empty() => uuid.to_string(),
            _ => {
                log::debug!("Ignoring a descriptor without a usable name");
                return;
            }
        };
        if uuid == self.own_uuid {
            log::debug!("Discovered ourselves, ignoring");
            return;
        }

        let txt = decode_txt(&service.txt);
        if txt.get("type").map(String::as_str) == Some("flush") {
            log::debug!("Ignoring flush registration of '{}'", uuid);
            return;
        }

        let hostname = txt
            .get("hostname")
            .cloned()
            .or_else(|| service.hostname.clone().map(strip_local_suffix));

        let (snapshot, reconnect) = match self.remotes.entry(uuid.clone()) {
            Entry::Occupied(mut occupied) => {
                let remote = occupied.get_mut();
                log::debug!("Service '{}' already known, status {:?}", uuid, remote.status);
                if let Some(hostname) = hostname {
                    remote.hostname = hostname;
                }
                remote.address = service.address;
                if service.port != 0 {
                    remote.port = service.port;
                }
                remote.service_available = true;
                let reconnect = matches!(
                    remote.status,
                    RemoteStatus::Disconnected | RemoteStatus::Error
                );
                (remote.clone(), reconnect)
            }
            Entry::Vacant(vacant) => {
                let remote = Remote {
                    hostname: hostname.unwrap_or_else(|| uuid.clone()),
                    uuid: uuid.clone(),
                    address: service.address,
                    port: service.port,
                    service_available: true,
                    status: RemoteStatus::Disconnected,
                };
                log::info!("New remote '{}' at {}:{}", uuid, remote.address, remote.port);
                vacant.insert(remote.clone());
                (remote, true)
            }
        };
        self.notify(snapshot);

        if reconnect {
            self.begin_connect(&uuid);
        }
    }

    /// A peer's advertisement was withdrawn. An established session is not
    /// torn down; only the availability flag flips.
    pub fn on_lost(&self, full_name: &str) {
        let uuid = full_name.split('.').next().unwrap_or(full_name);
        let snapshot = match self.remotes.get_mut(uuid) {
            Some(mut remote) => {
                remote.service_available = false;
                remote.clone()
            }
            None => {
                log::debug!("Lost event for unknown service '{}'", uuid);
                return;
            }
        };
        log::debug!("Service lost: '{}'", uuid);
        self.notify(snapshot);
    }

    /// Outcome callback: the connection attempt succeeded.
    pub fn report_connected(&self, uuid: &str) {
        self.transition(uuid, RemoteStatus::Connected, |status| {
            status == RemoteStatus::Connecting
        });
    }

    /// Outcome callback: the connection attempt failed, or an established
    /// session errored later.
    pub fn report_error(&self, uuid: &str) {
        self.transition(uuid, RemoteStatus::Error, |status| {
            matches!(status, RemoteStatus::Connecting | RemoteStatus::Connected)
        });
    }

    /// Outcome callback: the session was closed in an orderly fashion.
    pub fn report_disconnected(&self, uuid: &str) {
        self.transition(uuid, RemoteStatus::Disconnected, |status| {
            status != RemoteStatus::Disconnected
        });
    }

    fn transition(
        &self,
        uuid: &str,
        to: RemoteStatus,
        permitted: impl FnOnce(RemoteStatus) -> bool,
    ) {
        let snapshot = match self.remotes.get_mut(uuid) {
            Some(mut remote) => {
                if !permitted(remote.status) {
                    log::debug!(
                        "Dropping transition of '{}' from {:?} to {:?}",
                        uuid,
                        remote.status,
                        to
                    );
                    return;
                }
                remote.status = to;
                remote.clone()
            }
            None => {
                log::debug!("Status report for unknown remote '{}'", uuid);
                return;
            }
        };
        log::debug!("Remote '{}' is now {:?}", uuid, to);
        self.notify(snapshot);
    }

    /// Moves a peer into `Connecting` and fires exactly one `connect` call.
    /// The check-and-set happens under the key's shard lock, so concurrent
    /// resolution events cannot double-connect.
    fn begin_connect(&self, uuid: &str) {
        let snapshot = match self.remotes.get_mut(uuid) {
            Some(mut remote)
                if matches!(
                    remote.status,
                    RemoteStatus::Disconnected | RemoteStatus::Error
                ) =>
            {
                remote.status = RemoteStatus::Connecting;
                remote.clone()
            }
            _ => return,
        };
        self.notify(snapshot.clone());
        log::debug!("Connecting to '{}'", uuid);
        self.connector.connect(snapshot);
    }

    fn notify(&self, remote: Remote) {
        // No subscribers is fine.
        let _ = self.events.send(remote);
    }
}

impl ResolvedSink for Registry {
    fn service_resolved(&self, service: ResolvedService) {
        self.on_resolved(service);
    }
}

/// Decodes raw TXT strings into a key/value map. A malformed entry is
/// dropped with a diagnostic instead of failing the whole record.
fn decode_txt(entries: &[String]) -> HashMap<String, String> {
    let mut decoded = HashMap::new();
    for entry in entries {
        match entry.split_once('=') {
            Some((key, value)) => {
                decoded.insert(key.to_string(), value.to_string());
            }
            None => log::debug!("Skipping malformed TXT entry '{}'", entry),
        }
    }
    decoded
}

fn strip_local_suffix(target: String) -> String {
    target
        .trim_end_matches('.')
        .trim_end_matches(".local")
        .to_string()
}
