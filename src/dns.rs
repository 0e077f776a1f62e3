use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;

use crate::Error;

/// One SRV record with the A/AAAA expansion of its target.
///
/// The resolver performs the target lookups; consumers only walk the
/// already-expanded addresses.
#[derive(Debug, Clone)]
pub struct SrvRecord {
    pub priority: u16,
    pub weight: u16,
    pub port: u16,
    pub target: String,
    pub addresses: Vec<IpAddr>,
}

/// An SRV lookup result with a cursor over its expanded addresses.
///
/// Records are visited in priority order, higher weight first within a
/// priority, each record yielding its addresses paired with the record
/// port.  Cloning the result resets nothing: the cursor is part of the
/// value, so a caller that wants a fresh walk clones before iterating.
#[derive(Debug, Clone, Default)]
pub struct SrvResult {
    records: Vec<SrvRecord>,
    record_cursor: usize,
    address_cursor: usize,
}

impl SrvResult {
    pub fn new(mut records: Vec<SrvRecord>) -> Self {
        records.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(b.weight.cmp(&a.weight))
        });

        Self {
            records,
            record_cursor: 0,
            address_cursor: 0,
        }
    }

    /// Wrap a plain A/AAAA answer as a single pseudo record, used when
    /// a name has no SRV records at all.
    pub fn from_addresses(name: &str, addresses: Vec<IpAddr>, port: u16) -> Self {
        Self::new(vec![SrvRecord {
            priority: 0,
            weight: 0,
            port,
            target: name.to_string(),
            addresses,
        }])
    }

    pub fn is_empty(&self) -> bool {
        self.records.iter().all(|it| it.addresses.is_empty())
    }

    /// The next expanded address, advancing the cursor.
    ///
    /// ```
    /// use std::net::IpAddr;
    /// use turn_client::dns::{SrvRecord, SrvResult};
    ///
    /// let mut result = SrvResult::new(vec![
    ///     SrvRecord {
    ///         priority: 20,
    ///         weight: 0,
    ///         port: 3479,
    ///         target: "backup.example.org".to_string(),
    ///         addresses: vec!["9.9.9.9".parse::<IpAddr>().unwrap()],
    ///     },
    ///     SrvRecord {
    ///         priority: 10,
    ///         weight: 0,
    ///         port: 3478,
    ///         target: "stun.example.org".to_string(),
    ///         addresses: vec!["1.2.3.4".parse::<IpAddr>().unwrap()],
    ///     },
    /// ]);
    ///
    /// assert_eq!(result.extract_next_ip(), Some("1.2.3.4:3478".parse().unwrap()));
    /// assert_eq!(result.extract_next_ip(), Some("9.9.9.9:3479".parse().unwrap()));
    /// assert_eq!(result.extract_next_ip(), None);
    /// ```
    pub fn extract_next_ip(&mut self) -> Option<SocketAddr> {
        while let Some(record) = self.records.get(self.record_cursor) {
            if let Some(address) = record.addresses.get(self.address_cursor) {
                self.address_cursor += 1;
                return Some(SocketAddr::new(*address, record.port));
            }

            self.record_cursor += 1;
            self.address_cursor = 0;
        }

        None
    }
}

/// The external DNS client this crate consumes.
///
/// `lookup_srv` resolves `_<service>._<proto>.<name>`, expands every
/// target to its A/AAAA addresses and substitutes `default_port` for
/// records without one.  An empty result set is the `DnsFailure`
/// error.
#[async_trait]
pub trait DnsResolver: Send + Sync {
    async fn lookup_srv(
        &self,
        name: &str,
        service: &str,
        proto: &str,
        default_port: u16,
    ) -> Result<SrvResult, Error>;

    async fn lookup_a_or_aaaa(&self, name: &str) -> Result<Vec<IpAddr>, Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_prefers_low_priority_and_high_weight() {
        let record = |priority, weight, port, ip: &str| SrvRecord {
            priority,
            weight,
            port,
            target: "relay.example.org".to_string(),
            addresses: vec![ip.parse().unwrap()],
        };

        let mut result = SrvResult::new(vec![
            record(20, 0, 3478, "7.7.7.7"),
            record(10, 5, 3478, "5.5.5.5"),
            record(10, 50, 3479, "6.6.6.6"),
        ]);

        assert_eq!(result.extract_next_ip(), Some("6.6.6.6:3479".parse().unwrap()));
        assert_eq!(result.extract_next_ip(), Some("5.5.5.5:3478".parse().unwrap()));
        assert_eq!(result.extract_next_ip(), Some("7.7.7.7:3478".parse().unwrap()));
        assert_eq!(result.extract_next_ip(), None);
    }

    #[test]
    fn records_without_addresses_are_skipped() {
        let mut result = SrvResult::new(vec![
            SrvRecord {
                priority: 10,
                weight: 0,
                port: 3478,
                target: "dead.example.org".to_string(),
                addresses: vec![],
            },
            SrvRecord {
                priority: 20,
                weight: 0,
                port: 3478,
                target: "live.example.org".to_string(),
                addresses: vec!["1.2.3.4".parse().unwrap()],
            },
        ]);

        assert_eq!(result.extract_next_ip(), Some("1.2.3.4:3478".parse().unwrap()));
        assert_eq!(result.extract_next_ip(), None);
        assert!(!result.is_empty());
    }
}
