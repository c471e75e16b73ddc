//! Connection Admission Policy
//!
//! CIDR-based allow/deny evaluation for inbound connections, usable
//! standalone or installed on a device as its admission hook.

use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{bail, Context};
use ipnet::IpNet;
use tracing::debug;

use crate::config::AdmissionConfig;
use crate::hooks::AdmissionHook;
use crate::Result;

/// Decision applied when no rule matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultPolicy {
    Allow,
    Deny,
}

/// Evaluates inbound peer addresses against deny and allow lists.
///
/// Deny rules win over allow rules; the default policy decides the rest.
pub struct AdmissionPolicy {
    default_policy: DefaultPolicy,
    allow: Vec<IpNet>,
    deny: Vec<IpNet>,
}

impl AdmissionPolicy {
    pub fn new(default_policy: DefaultPolicy) -> Self {
        Self {
            default_policy,
            allow: Vec::new(),
            deny: Vec::new(),
        }
    }

    /// Build a policy from configuration. Entries may be bare addresses
    /// or CIDR blocks.
    pub fn from_config(config: &AdmissionConfig) -> Result<Self> {
        let default_policy = match config.default_policy.as_str() {
            "allow" => DefaultPolicy::Allow,
            "deny" => DefaultPolicy::Deny,
            other => bail!(
                "admission.default_policy must be 'allow' or 'deny', got '{}'",
                other
            ),
        };

        Ok(Self {
            default_policy,
            allow: parse_entries(&config.allow).context("invalid admission allow entry")?,
            deny: parse_entries(&config.deny).context("invalid admission deny entry")?,
        })
    }

    /// Add an allow rule.
    pub fn allow(mut self, net: IpNet) -> Self {
        self.allow.push(net);
        self
    }

    /// Add a deny rule.
    pub fn deny(mut self, net: IpNet) -> Self {
        self.deny.push(net);
        self
    }

    /// Whether a peer at `ip` may connect.
    pub fn permits(&self, ip: IpAddr) -> bool {
        if self.deny.iter().any(|net| net.contains(&ip)) {
            return false;
        }
        if self.allow.iter().any(|net| net.contains(&ip)) {
            return true;
        }
        self.default_policy == DefaultPolicy::Allow
    }

    /// Turn the policy into a device admission hook.
    ///
    /// A connection whose peer address cannot be read is denied.
    pub fn into_hook(self) -> AdmissionHook {
        Arc::new(move |conn| match conn.peer_addr() {
            Ok(addr) => {
                let permitted = self.permits(addr.ip());
                if !permitted {
                    debug!(peer = %addr, "admission policy denied connection");
                }
                permitted
            }
            Err(_) => false,
        })
    }
}

/// Parse a list of bare addresses or CIDR blocks.
pub(crate) fn parse_entries(entries: &[String]) -> Result<Vec<IpNet>> {
    entries.iter().map(|entry| parse_entry(entry)).collect()
}

fn parse_entry(entry: &str) -> Result<IpNet> {
    if let Ok(net) = entry.parse::<IpNet>() {
        return Ok(net);
    }
    let ip: IpAddr = entry
        .parse()
        .with_context(|| format!("not an address or CIDR block: '{}'", entry))?;
    Ok(IpNet::from(ip))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_deny_list_blocks_address() {
        let policy = AdmissionPolicy::new(DefaultPolicy::Allow).deny("10.0.0.5/32".parse().unwrap());

        assert!(!policy.permits(ip("10.0.0.5")));
        assert!(policy.permits(ip("10.0.0.6")));
        assert!(policy.permits(ip("192.168.1.1")));
    }

    #[test]
    fn test_deny_wins_over_allow() {
        let policy = AdmissionPolicy::new(DefaultPolicy::Deny)
            .allow("10.0.0.0/8".parse().unwrap())
            .deny("10.0.0.5/32".parse().unwrap());

        assert!(policy.permits(ip("10.0.0.4")));
        assert!(!policy.permits(ip("10.0.0.5")));
        assert!(!policy.permits(ip("172.16.0.1")));
    }

    #[test]
    fn test_default_deny() {
        let policy = AdmissionPolicy::new(DefaultPolicy::Deny);
        assert!(!policy.permits(ip("127.0.0.1")));
    }

    #[test]
    fn test_from_config_accepts_bare_addresses() {
        let config = AdmissionConfig {
            enabled: true,
            default_policy: "allow".to_string(),
            allow: vec![],
            deny: vec!["10.0.0.5".to_string(), "192.168.0.0/16".to_string()],
        };

        let policy = AdmissionPolicy::from_config(&config).unwrap();
        assert!(!policy.permits(ip("10.0.0.5")));
        assert!(!policy.permits(ip("192.168.44.9")));
        assert!(policy.permits(ip("10.0.0.6")));
    }

    #[test]
    fn test_from_config_rejects_bad_policy() {
        let config = AdmissionConfig {
            enabled: true,
            default_policy: "block".to_string(),
            allow: vec![],
            deny: vec![],
        };
        assert!(AdmissionPolicy::from_config(&config).is_err());
    }

    #[test]
    fn test_from_config_rejects_bad_entry() {
        let config = AdmissionConfig {
            enabled: true,
            default_policy: "allow".to_string(),
            allow: vec![],
            deny: vec!["not-an-address".to_string()],
        };
        assert!(AdmissionPolicy::from_config(&config).is_err());
    }
}
