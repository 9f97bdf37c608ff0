use crate::registry::Remote;
use mockall::automock;

/// Seam to the external connection component.
///
/// `connect` is invoked fire-and-forget once per newly registered peer and
/// once per reconnection attempt; the outcome is reported back through
/// `Registry::report_connected` / `Registry::report_error`.
#[automock]
pub trait Connector: Send + Sync {
    fn connect(&self, remote: Remote);
}
