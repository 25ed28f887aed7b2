//! Network policy definitions for sandbox sessions.

use serde::{Deserialize, Serialize};

/// Network access policy for a sandbox strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkPolicy {
    /// Allow all network access
    #[default]
    AllowAll,
    /// Only allow specific domains
    Allowlist,
    /// No network access
    Deny,
}

impl std::fmt::Display for NetworkPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AllowAll => write!(f, "allow-all"),
            Self::Allowlist => write!(f, "allowlist"),
            Self::Deny => write!(f, "deny"),
        }
    }
}

/// Docker `network_mode` for a policy. Allowlists keep the default bridge
/// and are narrowed by [`allowlist_script`] after the container starts.
pub(crate) fn network_mode(policy: NetworkPolicy) -> Option<String> {
    match policy {
        NetworkPolicy::Deny => Some("none".to_string()),
        NetworkPolicy::AllowAll | NetworkPolicy::Allowlist => None,
    }
}

/// Shell script, run as root inside the container, that drops all egress
/// except loopback, DNS to `dns` servers and the resolved `domains`.
pub(crate) fn allowlist_script(domains: &[String], dns: &[String]) -> String {
    let mut script = String::from(
        "set -e\n\
         iptables -P OUTPUT DROP\n\
         iptables -A OUTPUT -o lo -j ACCEPT\n\
         iptables -A OUTPUT -m state --state ESTABLISHED,RELATED -j ACCEPT\n",
    );
    for server in dns {
        script.push_str(&format!(
            "iptables -A OUTPUT -p udp -d {server} --dport 53 -j ACCEPT\n\
             iptables -A OUTPUT -p tcp -d {server} --dport 53 -j ACCEPT\n"
        ));
    }
    for domain in domains {
        let quoted = shell_words::quote(domain);
        script.push_str(&format!(
            "for ip in $(getent ahostsv4 {quoted} | awk '{{print $1}}' | sort -u); do \
             iptables -A OUTPUT -d \"$ip\" -j ACCEPT; done\n"
        ));
    }
    script
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_policy_display() {
        assert_eq!(format!("{}", NetworkPolicy::AllowAll), "allow-all");
        assert_eq!(format!("{}", NetworkPolicy::Allowlist), "allowlist");
        assert_eq!(format!("{}", NetworkPolicy::Deny), "deny");
    }

    #[test]
    fn test_network_mode() {
        assert_eq!(network_mode(NetworkPolicy::Deny).as_deref(), Some("none"));
        assert_eq!(network_mode(NetworkPolicy::AllowAll), None);
        assert_eq!(network_mode(NetworkPolicy::Allowlist), None);
    }

    #[test]
    fn test_allowlist_script_resolves_each_domain() {
        let script = allowlist_script(
            &["github.com".to_string(), "api.anthropic.com".to_string()],
            &["1.1.1.1".to_string()],
        );
        assert!(script.starts_with("set -e\niptables -P OUTPUT DROP"));
        assert!(script.contains("-d 1.1.1.1 --dport 53"));
        assert!(script.contains("getent ahostsv4 github.com"));
        assert!(script.contains("getent ahostsv4 api.anthropic.com"));
    }

    #[test]
    fn test_allowlist_script_quotes_domains() {
        let script = allowlist_script(&["evil.com; rm -rf /".to_string()], &[]);
        assert!(script.contains("'evil.com; rm -rf /'"));
    }
}
