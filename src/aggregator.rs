use dashmap::DashMap;
use mockall::automock;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

/// Unresolved records idle longer than this are evicted from the cache.
/// Resolved records are kept for the process lifetime so resolution is
/// emitted at most once per name.
pub(crate) const RECORD_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// One raw resource record from a multicast answer message, reduced to the
/// fields the aggregator consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Answer {
    /// Service pointer: a new instance name was sighted.
    Pointer { instance: String },
    /// Service location: instance name, target hostname and port.
    Location {
        name: String,
        target: String,
        port: u16,
    },
    /// IPv4 address of a hostname. Other address families never reach the
    /// aggregator; discovery is IPv4 only.
    Address { name: String, address: Ipv4Addr },
    /// Raw `key=value` strings of a text record.
    Text { name: String, entries: Vec<String> },
}

/// A peer descriptor that has accumulated enough fragments to be usable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedService {
    pub full_name: String,
    pub hostname: Option<String>,
    pub address: Ipv4Addr,
    pub port: u16,
    pub txt: Vec<String>,
}

/// Consumer of resolution events.
#[automock]
pub trait ResolvedSink: Send + Sync {
    fn service_resolved(&self, service: ResolvedService);
}

struct ServiceRecord {
    full_name: String,
    hostname: Option<String>,
    address: Option<Ipv4Addr>,
    port: u16,
    txt: Option<Vec<String>>,
    resolved: bool,
    last_seen: Instant,
}

impl ServiceRecord {
    fn new(full_name: String) -> Self {
        Self {
            full_name,
            hostname: None,
            address: None,
            port: 0,
            txt: None,
            resolved: false,
            last_seen: Instant::now(),
        }
    }
}

/// Reassembles service-location, address and text fragments that arrive
/// independently, in any order and across any number of answer messages,
/// into resolved peer descriptors.
///
/// Resolution fires exactly once per name: the `resolved` flag is flipped
/// while the record's shard is locked, so concurrent batches cannot both
/// emit for the same record.
pub struct Aggregator {
    records: DashMap<String, ServiceRecord>,
    sink: Arc<dyn ResolvedSink>,
}

impl Aggregator {
    pub fn new(sink: Arc<dyn ResolvedSink>) -> Self {
        Self {
            records: DashMap::new(),
            sink,
        }
    }

    /// Merges one batch of raw records, then emits a resolution event for
    /// every record that just gained both its address and its text.
    pub fn on_answer_batch(&self, answers: impl IntoIterator<Item = Answer>) {
        for answer in answers {
            self.merge(answer);
        }

        let mut resolved = Vec::new();
        for mut record in self.records.iter_mut() {
            if !record.resolved && record.address.is_some() && record.txt.is_some() {
                record.resolved = true;
                resolved.push(snapshot(&record));
            }
        }
        // Emitted outside the shard guards; the sink may call back into
        // shared state.
        for service in resolved {
            log::debug!("Resolved '{}'", service.full_name);
            self.sink.service_resolved(service);
        }
    }

    fn merge(&self, answer: Answer) {
        match answer {
            Answer::Pointer { instance } => {
                log::debug!("Service sighted: '{}'", instance);
                self.touch(instance);
            }
            Answer::Location { name, target, port } => {
                log::debug!("Service '{}' is at '{}' port {}", name, target, port);
                let mut record = self.touch(name);
                record.hostname = Some(target);
                record.port = port;
            }
            Answer::Address { name, address } => {
                log::debug!("Hostname '{}' resolves to {}", name, address);
                let mut matched = false;
                for mut record in self.records.iter_mut() {
                    let hit = record
                        .hostname
                        .as_deref()
                        .is_some_and(|h| h.eq_ignore_ascii_case(&name));
                    if hit {
                        record.address = Some(address);
                        record.last_seen = Instant::now();
                        matched = true;
                    }
                }
                if !matched {
                    // The matching service-location record may arrive later.
                    log::debug!("Address record for unknown hostname '{}'", name);
                }
            }
            Answer::Text { name, entries } => {
                log::debug!("Service '{}' has strings: {}", name, entries.join("; "));
                let mut record = self.touch(name);
                record.txt = Some(entries);
            }
        }
    }

    fn touch(&self, name: String) -> dashmap::mapref::one::RefMut<'_, String, ServiceRecord> {
        let mut record = self
            .records
            .entry(name.clone())
            .or_insert_with(|| ServiceRecord::new(name));
        record.last_seen = Instant::now();
        record
    }

    /// Drops unresolved records that have not been mentioned for
    /// `max_idle`. Resolved records are never dropped.
    pub fn evict_idle(&self, max_idle: Duration) {
        let before = self.records.len();
        self.records
            .retain(|_, record| record.resolved || record.last_seen.elapsed() <= max_idle);
        let evicted = before - self.records.len();
        if evicted > 0 {
            log::debug!("Evicted {} idle unresolved records", evicted);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.records.len()
    }
}

fn snapshot(record: &ServiceRecord) -> ResolvedService {
    ResolvedService {
        full_name: record.full_name.clone(),
        hostname: record.hostname.clone(),
        address: record.address.unwrap_or(Ipv4Addr::UNSPECIFIED),
        port: record.port,
        txt: record.txt.clone().unwrap_or_default(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        resolved: Mutex<Vec<ResolvedService>>,
    }

    impl ResolvedSink for RecordingSink {
        fn service_resolved(&self, service: ResolvedService) {
            self.resolved.lock().unwrap().push(service);
        }
    }

    const NAME: &str = "PEER1._warpinator._tcp.local";

    fn location() -> Answer {
        Answer::Location {
            name: NAME.into(),
            target: "peer1.local".into(),
            port: 42000,
        }
    }

    fn address() -> Answer {
        Answer::Address {
            name: "peer1.local".into(),
            address: Ipv4Addr::new(10, 0, 0, 5),
        }
    }

    fn text() -> Answer {
        Answer::Text {
            name: NAME.into(),
            entries: vec!["hostname=peer1".into(), "type=real".into()],
        }
    }

    fn aggregator() -> (Aggregator, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        (Aggregator::new(sink.clone()), sink)
    }

    #[test]
    fn resolves_once_regardless_of_arrival_order() {
        crate::test::init();
        let fragments = [location(), address(), text()];
        let orders: [[usize; 3]; 6] = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];
        for order in orders {
            let (aggregator, sink) = aggregator();
            for (step, i) in order.into_iter().enumerate() {
                aggregator.on_answer_batch([fragments[i].clone()]);
                let seen = sink.resolved.lock().unwrap().len();
                if step < 2 {
                    assert_eq!(seen, 0, "resolved before the last fragment: {:?}", order);
                }
            }
            let resolved = sink.resolved.lock().unwrap();
            assert_eq!(resolved.len(), 1, "order {:?}", order);
            let service = &resolved[0];
            assert_eq!(service.full_name, NAME);
            assert_eq!(service.hostname.as_deref(), Some("peer1.local"));
            assert_eq!(service.address, Ipv4Addr::new(10, 0, 0, 5));
            assert_eq!(service.port, 42000);
        }
    }

    #[test]
    fn single_batch_resolves_once() {
        crate::test::init();
        let (aggregator, sink) = aggregator();
        aggregator.on_answer_batch([location(), text(), address()]);
        assert_eq!(sink.resolved.lock().unwrap().len(), 1);
    }

    #[test]
    fn repeated_fragments_do_not_refire() {
        crate::test::init();
        let (aggregator, sink) = aggregator();
        aggregator.on_answer_batch([location(), address(), text()]);
        aggregator.on_answer_batch([location(), address(), text()]);
        assert_eq!(sink.resolved.lock().unwrap().len(), 1);
    }

    #[test]
    fn address_for_unknown_hostname_is_ignored() {
        crate::test::init();
        let (aggregator, sink) = aggregator();
        aggregator.on_answer_batch([address()]);
        assert!(sink.resolved.lock().unwrap().is_empty());
        assert_eq!(aggregator.len(), 0);

        // Once the location record arrives the address must be re-sent, as
        // on a real network where records repeat.
        aggregator.on_answer_batch([location(), text()]);
        aggregator.on_answer_batch([address()]);
        assert_eq!(sink.resolved.lock().unwrap().len(), 1);
    }

    #[test]
    fn pointer_only_never_resolves() {
        crate::test::init();
        let (aggregator, sink) = aggregator();
        aggregator.on_answer_batch([Answer::Pointer {
            instance: NAME.into(),
        }]);
        assert!(sink.resolved.lock().unwrap().is_empty());
        assert_eq!(aggregator.len(), 1);
    }

    #[test]
    fn mock_sink_observes_resolution() {
        crate::test::init();
        let mut sink = MockResolvedSink::new();
        sink.expect_service_resolved()
            .withf(|s| s.full_name == NAME && s.port == 42000)
            .times(1)
            .return_const(());
        let aggregator = Aggregator::new(Arc::new(sink));
        aggregator.on_answer_batch([location(), address(), text()]);
    }

    #[test]
    fn evicts_idle_unresolved_records_only() {
        crate::test::init();
        let (aggregator, _sink) = aggregator();
        aggregator.on_answer_batch([location(), address(), text()]);
        aggregator.on_answer_batch([Answer::Pointer {
            instance: "GHOST._warpinator._tcp.local".into(),
        }]);
        assert_eq!(aggregator.len(), 2);

        aggregator.evict_idle(Duration::ZERO);
        assert_eq!(aggregator.len(), 1, "the resolved record must survive");
    }
}
