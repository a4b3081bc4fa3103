//! Deterministic nginx config rendering.
//!
//! Same snapshot → same bytes → same hash; the reconciler's no-op
//! detection depends on it, so nothing time- or order-dependent may leak
//! into the output. Routes group by `(domain, tls)` and longer path
//! prefixes match first.

use std::collections::BTreeMap;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::store::RouteBinding;

/// Bumped whenever the template changes shape, so stale active configs
/// rewrite even when the route set is unchanged.
const TEMPLATE_VERSION: u32 = 1;

pub fn render_config(snapshot: &[RouteBinding], certs_dir: &Path, challenges_dir: &Path) -> String {
    // BTreeMap keys give a stable domain ordering.
    let mut groups: BTreeMap<(String, bool), Vec<&RouteBinding>> = BTreeMap::new();
    for binding in snapshot {
        groups
            .entry((binding.route.domain.clone(), binding.route.tls))
            .or_default()
            .push(binding);
    }

    let mut out = String::new();
    out.push_str(&format!("# glinrdock proxy config (template v{TEMPLATE_VERSION})\n"));
    out.push_str("# managed file; edits are overwritten on reconcile\n");

    for ((domain, tls), mut bindings) in groups {
        // Longest prefix wins on match.
        bindings.sort_by(|a, b| {
            let alen = a.route.path.as_deref().unwrap_or("").len();
            let blen = b.route.path.as_deref().unwrap_or("").len();
            blen.cmp(&alen).then_with(|| a.route.id.cmp(&b.route.id))
        });

        out.push_str("\nserver {\n");
        if tls {
            let Some(cert_domain) = bindings.iter().find_map(|b| b.cert_domain.clone()) else {
                // A TLS route without a certificate cannot be served;
                // route validation should have refused it.
                out.push_str(&format!("    # skipped: {domain} has no certificate\n}}\n"));
                continue;
            };
            let cert_base = certs_dir.join(&cert_domain);
            out.push_str("    listen 443 ssl;\n");
            out.push_str(&format!("    server_name {domain};\n"));
            out.push_str(&format!(
                "    ssl_certificate {};\n",
                cert_base.join("fullchain.pem").display()
            ));
            out.push_str(&format!(
                "    ssl_certificate_key {};\n",
                cert_base.join("privkey.pem").display()
            ));
        } else {
            out.push_str("    listen 80;\n");
            out.push_str(&format!("    server_name {domain};\n"));
            out.push_str(&format!(
                "    location /.well-known/acme-challenge/ {{\n        root {};\n    }}\n",
                challenges_dir.display()
            ));
        }

        for binding in bindings {
            let Some(host_port) = binding.host_port else {
                out.push_str(&format!(
                    "    # skipped: route {} targets unpublished port {}\n",
                    binding.route.id, binding.route.port
                ));
                continue;
            };
            let prefix = binding.route.path.as_deref().unwrap_or("/");
            out.push_str(&format!("    location {prefix} {{\n"));
            out.push_str(&format!(
                "        proxy_pass http://127.0.0.1:{host_port};\n"
            ));
            out.push_str("        proxy_set_header Host $host;\n");
            out.push_str("        proxy_set_header X-Real-IP $remote_addr;\n");
            out.push_str("        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;\n");
            out.push_str("        proxy_set_header X-Forwarded-Proto $scheme;\n");
            out.push_str("    }\n");
        }
        out.push_str("}\n");
    }
    out
}

pub fn config_hash(config: &str) -> String {
    hex::encode(Sha256::digest(config.as_bytes()))
}
