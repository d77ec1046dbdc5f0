use std::{net::IpAddr, str::FromStr};

use ipnet::IpNet;

use crate::error::ScanError;

/// Whether `target` is covered by the scope allowlist.
///
/// Entries are domains (covering themselves and their subdomains), single
/// IPs, or CIDR ranges. An empty allowlist puts every target in scope.
pub fn in_scope(target: &str, allowlist: &[String]) -> bool {
    if allowlist.is_empty() {
        return true;
    }

    if let Ok(ip) = IpAddr::from_str(target) {
        return allowlist.iter().any(|entry| {
            IpNet::from_str(entry)
                .map(|net| net.contains(&ip))
                .or_else(|_| IpAddr::from_str(entry).map(|allowed| allowed == ip))
                .unwrap_or(false)
        });
    }

    let target = target.trim_end_matches('.').to_ascii_lowercase();
    allowlist.iter().any(|entry| {
        let entry = entry.trim_end_matches('.').to_ascii_lowercase();
        target == entry || target.ends_with(&format!(".{entry}"))
    })
}

const MAX_DOMAIN_LEN: usize = 253;

/// Rejects anything that is not a plain hostname or IP address.
///
/// Targets end up as discrete process arguments, so the concern here is
/// option injection (`-o /etc/passwd`) and garbage, not shell metacharacters
/// being interpreted.
pub fn validate_target(domain: &str) -> Result<(), ScanError> {
    let invalid = |why: &str| ScanError::InvalidInput(format!("invalid domain {domain:?}: {why}"));

    if domain.is_empty() {
        return Err(invalid("empty"));
    }
    if IpAddr::from_str(domain).is_ok() {
        return Ok(());
    }
    if domain.len() > MAX_DOMAIN_LEN {
        return Err(invalid("too long"));
    }
    if domain.starts_with('-') {
        return Err(invalid("leading dash"));
    }

    let host = domain.strip_suffix('.').unwrap_or(domain);
    for label in host.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(invalid("bad label length"));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(invalid("label starts or ends with a dash"));
        }
        if !label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '*')
        {
            return Err(invalid("unexpected character"));
        }
    }
    Ok(())
}
