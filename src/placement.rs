use std::collections::BTreeMap;

use crate::config::{ConnectorTrust, WorkerConfig};

/// Choose the node selectors for a workload.
///
/// Custom connectors are scheduled onto the isolated node pool when one is
/// configured, falling back to the standard pool otherwise. Certified
/// connectors always use the standard pool. Tolerations, pull secrets and
/// annotations pass through from [`WorkerConfig`] unchanged; this is the
/// only placement decision made here.
pub fn node_selectors(trust: ConnectorTrust, config: &WorkerConfig) -> BTreeMap<String, String> {
    match trust {
        ConnectorTrust::Custom => config
            .isolated_node_selectors
            .clone()
            .unwrap_or_else(|| config.node_selectors.clone()),
        ConnectorTrust::Certified => config.node_selectors.clone(),
    }
}
