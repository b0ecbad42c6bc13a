//! Per-lab network isolation rules
//!
//! Every VPN lab gets three rules against its subnet, issued in this order:
//!
//! 1. reject everything towards the subnet,
//! 2. accept established/related return traffic,
//! 3. accept traffic from the lab's VPN client addresses.
//!
//! The reject rule goes first so the subnet is never reachable before the
//! narrower accept rule exists.

use crate::error::{Error, Result};
use async_trait::async_trait;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A single firewall rule scoped to a lab subnet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FirewallRule {
    /// Drop all traffic to the subnet
    Reject {
        /// Lab subnet
        subnet: Ipv4Net,
    },
    /// Accept established and related traffic to the subnet
    State {
        /// Lab subnet
        subnet: Ipv4Net,
    },
    /// Accept traffic to the subnet from the given sources
    Accept {
        /// Lab subnet
        subnet: Ipv4Net,
        /// Allowed source addresses
        sources: Vec<Ipv4Addr>,
    },
}

impl fmt::Display for FirewallRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FirewallRule::Reject { subnet } => write!(f, "reject -> {}", subnet),
            FirewallRule::State { subnet } => {
                write!(f, "accept established,related -> {}", subnet)
            }
            FirewallRule::Accept { subnet, sources } => {
                let sources: Vec<String> = sources.iter().map(|ip| ip.to_string()).collect();
                write!(f, "accept {} -> {}", sources.join(","), subnet)
            }
        }
    }
}

/// Identifier assigned to a rule by the firewall backend
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(pub String);

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Backend that installs rules on the host
#[async_trait]
pub trait FirewallBackend: Send + Sync {
    /// Install a rule and return its identifier
    async fn add_rule(&self, rule: &FirewallRule) -> Result<RuleId>;

    /// Remove a previously installed rule
    async fn remove_rule(&self, id: &RuleId) -> Result<()>;
}

/// Rules issued for one lab
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsolationRule {
    /// Lab subnet the rules apply to
    pub lab_subnet: Ipv4Net,
    /// VPN client addresses allowed into the subnet
    pub vpn_ips: Vec<Ipv4Addr>,
    /// Default reject rule
    pub reject: RuleId,
    /// Return traffic rule
    pub state: RuleId,
    /// Client accept rule
    pub accept: RuleId,
}

/// Issued rules by lab tag
pub type RuleTable = BTreeMap<String, IsolationRule>;

/// Issues and revokes lab isolation rules
#[derive(Clone)]
pub struct NetworkRuleManager {
    backend: Arc<dyn FirewallBackend>,
}

impl NetworkRuleManager {
    /// Create a rule manager on top of a firewall backend
    pub fn new(backend: Arc<dyn FirewallBackend>) -> Self {
        Self { backend }
    }

    /// Fail if rules were already issued for the lab
    pub fn ensure_not_issued(table: &RuleTable, lab_tag: &str) -> Result<()> {
        if table.contains_key(lab_tag) {
            return Err(Error::RuleAlreadyIssued(lab_tag.to_string()));
        }
        Ok(())
    }

    /// Issue the three isolation rules for a lab and record them in `table`
    ///
    /// A second issuance for the same lab is rejected. If a later rule fails,
    /// the rules created so far are removed again and nothing is recorded.
    pub async fn issue(
        &self,
        table: &mut RuleTable,
        lab_tag: &str,
        lab_subnet: Ipv4Net,
        vpn_ips: &[Ipv4Addr],
    ) -> Result<IsolationRule> {
        Self::ensure_not_issued(table, lab_tag)?;

        let rules = [
            FirewallRule::Reject { subnet: lab_subnet },
            FirewallRule::State { subnet: lab_subnet },
            FirewallRule::Accept {
                subnet: lab_subnet,
                sources: vpn_ips.to_vec(),
            },
        ];

        let mut issued = Vec::with_capacity(rules.len());
        for rule in &rules {
            match self.backend.add_rule(rule).await {
                Ok(id) => {
                    debug!("Issued rule {} ({}) for lab {}", id, rule, lab_tag);
                    issued.push(id);
                }
                Err(e) => {
                    warn!("Failed to issue rule '{}' for lab {}: {}", rule, lab_tag, e);
                    self.remove_all(issued.iter().rev()).await;
                    return Err(e);
                }
            }
        }

        let [reject, state, accept]: [RuleId; 3] = issued
            .try_into()
            .map_err(|_| Error::Firewall("rule count mismatch".to_string()))?;

        let entry = IsolationRule {
            lab_subnet,
            vpn_ips: vpn_ips.to_vec(),
            reject,
            state,
            accept,
        };
        table.insert(lab_tag.to_string(), entry.clone());

        info!("Isolated lab {} on {}", lab_tag, lab_subnet);
        Ok(entry)
    }

    /// Remove a lab's rules, accept rule first
    ///
    /// Every rule removal is attempted even if an earlier one fails.
    pub async fn revoke(&self, lab_tag: &str, rule: &IsolationRule) -> Result<()> {
        let failures = self
            .remove_all([&rule.accept, &rule.state, &rule.reject].into_iter())
            .await;

        if failures.is_empty() {
            info!("Revoked isolation rules for lab {}", lab_tag);
            Ok(())
        } else {
            Err(Error::Firewall(format!(
                "failed to remove rules for lab {}: {}",
                lab_tag,
                failures.join("; ")
            )))
        }
    }

    async fn remove_all<'a>(&self, ids: impl Iterator<Item = &'a RuleId>) -> Vec<String> {
        let mut failures = Vec::new();
        for id in ids {
            if let Err(e) = self.backend.remove_rule(id).await {
                warn!("Failed to remove rule {}: {}", id, e);
                failures.push(format!("{}: {}", id, e));
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records rules in install order, optionally failing on one kind
    #[derive(Default)]
    struct RecordingBackend {
        installed: Mutex<Vec<(RuleId, FirewallRule)>>,
        removed: Mutex<Vec<RuleId>>,
        fail_accept: bool,
    }

    #[async_trait]
    impl FirewallBackend for RecordingBackend {
        async fn add_rule(&self, rule: &FirewallRule) -> Result<RuleId> {
            if self.fail_accept && matches!(rule, FirewallRule::Accept { .. }) {
                return Err(Error::Firewall("accept chain missing".to_string()));
            }
            let mut installed = self.installed.lock().unwrap();
            let id = RuleId(format!("rule-{}", installed.len()));
            installed.push((id.clone(), rule.clone()));
            Ok(id)
        }

        async fn remove_rule(&self, id: &RuleId) -> Result<()> {
            self.removed.lock().unwrap().push(id.clone());
            Ok(())
        }
    }

    fn subnet() -> Ipv4Net {
        "10.10.4.0/24".parse().unwrap()
    }

    fn clients() -> Vec<Ipv4Addr> {
        vec!["10.17.0.2".parse().unwrap(), "10.17.0.3".parse().unwrap()]
    }

    #[smol_potat::test]
    async fn test_rules_issued_in_order() {
        let backend = Arc::new(RecordingBackend::default());
        let manager = NetworkRuleManager::new(backend.clone());
        let mut table = RuleTable::new();

        let entry = manager
            .issue(&mut table, "ev-aaaa", subnet(), &clients())
            .await
            .unwrap();

        let installed = backend.installed.lock().unwrap();
        assert!(matches!(installed[0].1, FirewallRule::Reject { .. }));
        assert!(matches!(installed[1].1, FirewallRule::State { .. }));
        assert_eq!(
            installed[2].1,
            FirewallRule::Accept {
                subnet: subnet(),
                sources: clients()
            }
        );
        assert_eq!(table.get("ev-aaaa"), Some(&entry));
    }

    #[smol_potat::test]
    async fn test_second_issuance_is_rejected() {
        let backend = Arc::new(RecordingBackend::default());
        let manager = NetworkRuleManager::new(backend.clone());
        let mut table = RuleTable::new();

        manager
            .issue(&mut table, "ev-aaaa", subnet(), &clients())
            .await
            .unwrap();
        let result = manager
            .issue(&mut table, "ev-aaaa", subnet(), &clients())
            .await;

        assert!(matches!(result, Err(Error::RuleAlreadyIssued(_))));
        assert_eq!(backend.installed.lock().unwrap().len(), 3);
    }

    #[smol_potat::test]
    async fn test_failed_accept_rolls_back() {
        let backend = Arc::new(RecordingBackend {
            fail_accept: true,
            ..Default::default()
        });
        let manager = NetworkRuleManager::new(backend.clone());
        let mut table = RuleTable::new();

        let result = manager
            .issue(&mut table, "ev-aaaa", subnet(), &clients())
            .await;

        assert!(result.is_err());
        assert!(table.is_empty());
        // State rule removed before the reject rule
        let removed = backend.removed.lock().unwrap();
        assert_eq!(
            *removed,
            vec![RuleId("rule-1".to_string()), RuleId("rule-0".to_string())]
        );
    }

    #[smol_potat::test]
    async fn test_revoke_removes_accept_first() {
        let backend = Arc::new(RecordingBackend::default());
        let manager = NetworkRuleManager::new(backend.clone());
        let mut table = RuleTable::new();

        let entry = manager
            .issue(&mut table, "ev-aaaa", subnet(), &clients())
            .await
            .unwrap();
        manager.revoke("ev-aaaa", &entry).await.unwrap();

        let removed = backend.removed.lock().unwrap();
        assert_eq!(*removed, vec![entry.accept, entry.state, entry.reject]);
    }

    #[test]
    fn test_rule_display() {
        let rule = FirewallRule::Accept {
            subnet: subnet(),
            sources: clients(),
        };
        assert_eq!(rule.to_string(), "accept 10.17.0.2,10.17.0.3 -> 10.10.4.0/24");
    }
}
