//! Configuration types

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default number of overlay sub-clients
pub const DEFAULT_NUM_SUB_CLIENTS: usize = 4;

/// Main tunnel configuration
///
/// Zero-valued fields mean "use the default" when passed through
/// [`TunnelConfig::merged`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Number of overlay sub-clients (also the NAT listener count)
    pub num_sub_clients: usize,

    /// Also open the un-prefixed "original" overlay client
    pub original_client: bool,

    /// Regex patterns of peer identities allowed to connect (None = all)
    pub accept_addrs: Option<Vec<String>>,

    /// Overlay client settings
    pub client: ClientConfig,

    /// Wallet settings (handed to the NAT session provider untouched)
    pub wallet: WalletConfig,

    /// Outbound dial settings
    pub dial: DialConfig,

    /// NAT traversal session settings
    pub nat: NatConfig,

    /// Relay UDP datagrams as well as streams
    pub udp: bool,

    /// Seconds before an idle UDP pseudo-connection is purged, 0 never purges
    pub udp_idle_secs: u32,

    /// Log every accepted and dialed connection at info level
    pub verbose: bool,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            num_sub_clients: DEFAULT_NUM_SUB_CLIENTS,
            original_client: false,
            accept_addrs: None,
            client: ClientConfig::default(),
            wallet: WalletConfig::default(),
            dial: DialConfig::default(),
            nat: NatConfig::default(),
            udp: false,
            udp_idle_secs: 0,
            verbose: false,
        }
    }
}

impl TunnelConfig {
    /// Defaults overridden by every non-zero field of `overrides`.
    pub fn merged(overrides: Option<TunnelConfig>) -> Self {
        let mut merged = Self::default();
        if let Some(conf) = overrides {
            merged.merge_from(conf);
        }
        merged
    }

    /// Copy every non-zero field of `other` over `self`.
    pub fn merge_from(&mut self, other: TunnelConfig) {
        if other.num_sub_clients != 0 {
            self.num_sub_clients = other.num_sub_clients;
        }
        self.original_client |= other.original_client;
        if other.accept_addrs.is_some() {
            self.accept_addrs = other.accept_addrs;
        }
        self.client.merge_from(other.client);
        self.wallet.merge_from(other.wallet);
        self.dial.merge_from(other.dial);
        self.nat.merge_from(other.nat);
        self.udp |= other.udp;
        if other.udp_idle_secs != 0 {
            self.udp_idle_secs = other.udp_idle_secs;
        }
        self.verbose |= other.verbose;
    }

    /// Idle window for UDP pseudo-connections, `None` when they never expire
    pub fn udp_idle_time(&self) -> Option<Duration> {
        match self.udp_idle_secs {
            0 => None,
            secs => Some(Duration::from_secs(u64::from(secs))),
        }
    }

    /// NAT settings as seen by the session provider: listener count follows
    /// the sub-client count and the client's session settings carry over.
    pub fn effective_nat(&self) -> NatConfig {
        let mut nat = self.nat.clone();
        nat.num_listeners = self.num_sub_clients;
        nat.session = self.client.session.clone();
        nat
    }
}

/// Reliable-session settings shared by overlay client and NAT sessions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Session MTU, 0 lets the transport decide
    pub mtu: u32,
}

impl SessionConfig {
    fn merge_from(&mut self, other: SessionConfig) {
        if other.mtu != 0 {
            self.mtu = other.mtu;
        }
    }
}

/// Overlay client settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Seed RPC servers used to bootstrap
    pub seed_rpc_servers: Vec<String>,

    /// Connect retries before giving up, 0 uses the provider default
    pub connect_retries: u32,

    /// Session settings
    pub session: SessionConfig,
}

impl ClientConfig {
    fn merge_from(&mut self, other: ClientConfig) {
        if !other.seed_rpc_servers.is_empty() {
            self.seed_rpc_servers = other.seed_rpc_servers;
        }
        if other.connect_retries != 0 {
            self.connect_retries = other.connect_retries;
        }
        self.session.merge_from(other.session);
    }
}

/// Wallet settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    /// Seed RPC servers used for wallet queries
    pub seed_rpc_servers: Vec<String>,
}

impl WalletConfig {
    fn merge_from(&mut self, other: WalletConfig) {
        if !other.seed_rpc_servers.is_empty() {
            self.seed_rpc_servers = other.seed_rpc_servers;
        }
    }
}

/// Outbound dial settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DialConfig {
    /// Dial timeout in milliseconds, 0 waits forever
    pub dial_timeout_ms: u64,

    /// Session settings for dialed overlay sessions
    pub session: Option<SessionConfig>,
}

impl DialConfig {
    /// Dial timeout, `None` when unbounded
    pub fn timeout(&self) -> Option<Duration> {
        match self.dial_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    fn merge_from(&mut self, other: DialConfig) {
        if other.dial_timeout_ms != 0 {
            self.dial_timeout_ms = other.dial_timeout_ms;
        }
        if other.session.is_some() {
            self.session = other.session;
        }
    }
}

/// NAT traversal session settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NatConfig {
    /// Number of NAT traversal listeners
    pub num_listeners: usize,

    /// Session settings
    pub session: SessionConfig,

    /// Reverse service name
    pub service_name: String,

    /// Subscription prefix
    pub subscription_prefix: String,

    /// Max price per MB
    pub max_price: String,

    /// Minimal nano-pay transaction fee
    pub min_nano_pay_fee: String,

    /// Nano-pay fee ratio
    pub nano_pay_fee_ratio: f64,

    /// Allowed service node country codes (empty allows all)
    pub allowed_countries: Vec<String>,

    /// Download the geo database to disk
    pub download_geo_db: bool,

    /// Where the geo database lives
    pub geo_db_path: String,

    /// Measure service node bandwidth before use
    pub measure_bandwidth: bool,
}

impl Default for NatConfig {
    fn default() -> Self {
        Self {
            num_listeners: DEFAULT_NUM_SUB_CLIENTS,
            session: SessionConfig::default(),
            service_name: String::new(),
            subscription_prefix: String::new(),
            max_price: "0.01".to_string(),
            min_nano_pay_fee: "0.00001".to_string(),
            nano_pay_fee_ratio: 0.1,
            allowed_countries: Vec::new(),
            download_geo_db: false,
            geo_db_path: ".".to_string(),
            measure_bandwidth: false,
        }
    }
}

impl NatConfig {
    fn merge_from(&mut self, other: NatConfig) {
        if other.num_listeners != 0 {
            self.num_listeners = other.num_listeners;
        }
        self.session.merge_from(other.session);
        if !other.service_name.is_empty() {
            self.service_name = other.service_name;
        }
        if !other.subscription_prefix.is_empty() {
            self.subscription_prefix = other.subscription_prefix;
        }
        if !other.max_price.is_empty() {
            self.max_price = other.max_price;
        }
        if !other.min_nano_pay_fee.is_empty() {
            self.min_nano_pay_fee = other.min_nano_pay_fee;
        }
        if other.nano_pay_fee_ratio != 0.0 {
            self.nano_pay_fee_ratio = other.nano_pay_fee_ratio;
        }
        if !other.allowed_countries.is_empty() {
            self.allowed_countries = other.allowed_countries;
        }
        self.download_geo_db |= other.download_geo_db;
        if !other.geo_db_path.is_empty() {
            self.geo_db_path = other.geo_db_path;
        }
        self.measure_bandwidth |= other.measure_bandwidth;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zeroed() -> TunnelConfig {
        TunnelConfig {
            num_sub_clients: 0,
            original_client: false,
            accept_addrs: None,
            client: ClientConfig::default(),
            wallet: WalletConfig::default(),
            dial: DialConfig::default(),
            nat: NatConfig {
                num_listeners: 0,
                session: SessionConfig::default(),
                service_name: String::new(),
                subscription_prefix: String::new(),
                max_price: String::new(),
                min_nano_pay_fee: String::new(),
                nano_pay_fee_ratio: 0.0,
                allowed_countries: Vec::new(),
                download_geo_db: false,
                geo_db_path: String::new(),
                measure_bandwidth: false,
            },
            udp: false,
            udp_idle_secs: 0,
            verbose: false,
        }
    }

    #[test]
    fn test_default_config() {
        let config = TunnelConfig::default();
        assert_eq!(config.num_sub_clients, 4);
        assert!(!config.udp);
        assert_eq!(config.udp_idle_time(), None);
        assert_eq!(config.dial.timeout(), None);
        assert!(config.accept_addrs.is_none());
    }

    #[test]
    fn test_merged_none_is_default() {
        assert_eq!(TunnelConfig::merged(None), TunnelConfig::default());
    }

    #[test]
    fn test_merged_zero_fields_keep_defaults() {
        let merged = TunnelConfig::merged(Some(zeroed()));
        assert_eq!(merged, TunnelConfig::default());
    }

    #[test]
    fn test_merged_overrides_non_zero_fields() {
        let mut conf = zeroed();
        conf.num_sub_clients = 1;
        conf.udp = true;
        conf.udp_idle_secs = 2;
        conf.dial.dial_timeout_ms = 5000;
        conf.nat.service_name = "reverse".to_string();
        conf.accept_addrs = Some(vec!["^alice\\.".to_string()]);

        let merged = TunnelConfig::merged(Some(conf));
        assert_eq!(merged.num_sub_clients, 1);
        assert!(merged.udp);
        assert_eq!(merged.udp_idle_time(), Some(Duration::from_secs(2)));
        assert_eq!(merged.dial.timeout(), Some(Duration::from_millis(5000)));
        assert_eq!(merged.nat.service_name, "reverse");
        assert_eq!(merged.nat.max_price, "0.01");
        assert_eq!(merged.accept_addrs.as_deref().map(|a| a.len()), Some(1));
    }

    #[test]
    fn test_effective_nat_follows_client() {
        let mut config = TunnelConfig::default();
        config.num_sub_clients = 2;
        config.client.session.mtu = 1400;
        let nat = config.effective_nat();
        assert_eq!(nat.num_listeners, 2);
        assert_eq!(nat.session.mtu, 1400);
    }

    #[test]
    fn test_config_serialization() {
        let mut config = TunnelConfig::default();
        config.udp = true;
        config.udp_idle_secs = 30;
        let json = serde_json::to_string(&config).unwrap();
        let parsed: TunnelConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let parsed: TunnelConfig = serde_json::from_str(r#"{"udp": true}"#).unwrap();
        assert!(parsed.udp);
        assert_eq!(parsed.num_sub_clients, DEFAULT_NUM_SUB_CLIENTS);
        assert_eq!(parsed.nat.geo_db_path, ".");
    }
}
