use std::net::IpAddr;

use serde::Deserialize;

/// turn client settings
///
/// The debug switches narrow the candidate enumeration: forcing UDP
/// skips every TCP candidate and vice versa.  Forcing both at once
/// leaves no transport and the client completes with a DNS failure.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct TurnSettings {
    /// backgrounding phase
    ///
    /// the phase at which the turn client subscribes to the
    /// backgrounding service.  phases are notified in ascending order
    /// when the application goes to background.
    #[serde(default)]
    pub backgrounding_phase: u32,

    /// force udp
    ///
    /// skip TCP candidates during server enumeration.
    #[serde(default)]
    pub force_udp: bool,

    /// force tcp
    ///
    /// skip UDP candidates during server enumeration.
    #[serde(default)]
    pub force_tcp: bool,

    /// restrict relay ips
    ///
    /// when non-empty, only the listed peer addresses may be sent
    /// relayed data; datagrams to any other peer are silently dropped.
    /// debugging aid, empty in production.
    #[serde(default)]
    pub restrict_relay_ips: Vec<IpAddr>,
}

/// logger settings
///
/// the telnet log sink itself lives outside this crate; the phase key
/// is recognized here so one settings document configures the whole
/// services stack.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct LoggerSettings {
    /// the phase at which the telnet logger subscribes to the
    /// backgrounding service.
    #[serde(default)]
    pub telnet_phase: u32,
}

/// message queue settings
#[derive(Deserialize, Debug, Clone, Default)]
pub struct QueueSettings {
    /// whether the GUI queue is pumped once more while quitting.
    #[serde(default)]
    pub process_application_queue_on_quit: bool,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub turn: TurnSettings,

    #[serde(default)]
    pub logger: LoggerSettings,

    #[serde(default)]
    pub queues: QueueSettings,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let settings: Settings = serde_json::from_str("{}").unwrap();

        assert_eq!(settings.turn.backgrounding_phase, 0);
        assert!(!settings.turn.force_udp);
        assert!(!settings.turn.force_tcp);
        assert!(settings.turn.restrict_relay_ips.is_empty());
        assert!(!settings.queues.process_application_queue_on_quit);
    }

    #[test]
    fn recognized_keys_deserialize() {
        let settings: Settings = serde_json::from_str(
            r#"{
                "turn": {
                    "backgrounding_phase": 2,
                    "force_tcp": true,
                    "restrict_relay_ips": ["10.0.0.1"]
                },
                "logger": { "telnet_phase": 1 }
            }"#,
        )
        .unwrap();

        assert_eq!(settings.turn.backgrounding_phase, 2);
        assert!(settings.turn.force_tcp);
        assert_eq!(settings.turn.restrict_relay_ips.len(), 1);
        assert_eq!(settings.logger.telnet_phase, 1);
    }
}
