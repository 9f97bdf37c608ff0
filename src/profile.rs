/// mDNS service type under which every instance advertises itself.
pub const SERVICE_TYPE: &str = "_warpinator._tcp";

/// Self-advertisement descriptor: what this instance broadcasts about
/// itself on the multicast group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceProfile {
    pub uuid: String,
    pub hostname: String,
    pub port: u16,
}

impl ServiceProfile {
    /// Fully qualified instance name, e.g. `MYHOST-1A2B3C._warpinator._tcp.local.`
    pub fn instance_name(&self) -> String {
        format!("{}.{}.local.", self.uuid, SERVICE_TYPE)
    }

    /// Target hostname of the SRV record, e.g. `myhost.local.`
    pub fn target_host(&self) -> String {
        format!("{}.local.", self.hostname)
    }

    /// TXT entries attached to the advertisement. A `flush` announcement
    /// marks a transient re-registration that peers must not treat as a
    /// genuine instance.
    pub fn txt_entries(&self, flush: bool) -> Vec<String> {
        vec![
            format!("hostname={}", self.hostname),
            format!("type={}", if flush { "flush" } else { "real" }),
        ]
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn profile() -> ServiceProfile {
        ServiceProfile {
            uuid: "MYHOST-1A2B3C".into(),
            hostname: "myhost".into(),
            port: 42000,
        }
    }

    #[test]
    fn instance_name_embeds_service_type() {
        assert_eq!(
            profile().instance_name(),
            "MYHOST-1A2B3C._warpinator._tcp.local."
        );
    }

    #[test]
    fn flush_marker() {
        let txt = profile().txt_entries(true);
        assert!(txt.contains(&"type=flush".to_string()));
        let txt = profile().txt_entries(false);
        assert!(txt.contains(&"type=real".to_string()));
        assert!(txt.contains(&"hostname=myhost".to_string()));
    }
}
