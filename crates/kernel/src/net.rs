//! Naming rules for projects, services, and their virtual networks.
//!
//! Each project owns one bridge network, created lazily on first service
//! start. Services are reachable inside it under a short alias (their
//! name) and a fully-qualified alias `<name>.<project>.local`.

use crate::error::{Error, Result};

/// Validate a DNS-label name: lowercase alphanumerics and hyphens,
/// 1–64 characters, no leading or trailing hyphen.
pub fn validate_dns_label(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 64 {
        return Err(Error::Validation(format!(
            "name must be 1-64 characters, got {}",
            name.len()
        )));
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err(Error::Validation(
            "name must not start or end with a hyphen".to_string(),
        ));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-'))
    {
        return Err(Error::Validation(format!(
            "name contains invalid character {bad:?}; allowed: lowercase letters, digits, hyphen"
        )));
    }
    Ok(())
}

pub fn network_name(project_id: i64) -> String {
    format!("proj_{project_id}")
}

/// Container name for a managed service. Deterministic so create is
/// idempotent across retries.
pub fn container_name(project_id: i64, service_name: &str) -> String {
    format!("glinr_{project_id}_{service_name}")
}

/// Aliases a service answers to inside its project network.
pub fn service_aliases(service_name: &str, project_name: &str) -> Vec<String> {
    vec![
        service_name.to_string(),
        format!("{service_name}.{project_name}.local"),
    ]
}

/// Human hint shown in service detail responses.
pub fn dns_hint(service_name: &str, project_name: &str) -> String {
    format!("{service_name}.{project_name}.local")
}

pub fn curl_hint(service_name: &str, project_name: &str, port: Option<u16>) -> String {
    match port {
        Some(port) => format!("curl http://{service_name}.{project_name}.local:{port}/"),
        None => format!("curl http://{service_name}.{project_name}.local/"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_labels() {
        for name in ["web", "api-v2", "a", "x1", "my-long-service-name"] {
            assert!(validate_dns_label(name).is_ok(), "{name} should be valid");
        }
    }

    #[test]
    fn rejects_invalid_labels() {
        for name in ["", "Web", "my_app", "-edge", "edge-", "a.b", "café"] {
            let err = validate_dns_label(name).unwrap_err();
            assert_eq!(err.kind(), "validation", "{name} should be rejected");
        }
    }

    #[test]
    fn rejects_overlong_label() {
        let name = "a".repeat(65);
        assert!(validate_dns_label(&name).is_err());
        let name = "a".repeat(64);
        assert!(validate_dns_label(&name).is_ok());
    }

    #[test]
    fn network_and_alias_naming() {
        assert_eq!(network_name(7), "proj_7");
        assert_eq!(container_name(7, "web"), "glinr_7_web");
        assert_eq!(
            service_aliases("web", "demo"),
            vec!["web".to_string(), "web.demo.local".to_string()]
        );
        assert_eq!(dns_hint("web", "demo"), "web.demo.local");
        assert_eq!(
            curl_hint("web", "demo", Some(8080)),
            "curl http://web.demo.local:8080/"
        );
    }
}
