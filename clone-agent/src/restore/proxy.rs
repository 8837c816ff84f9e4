//! nginx / apache site handling.
//!
//! Certificates are never part of a bundle, so restored sites that point at
//! missing certificate files are rewritten to serve plaintext until new
//! certificates are issued on the target.

use std::path::{Path, PathBuf};

pub const DISABLED_MARKER: &str = "# server-clone: disabled, certificate missing: ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    Nginx,
    Apache,
}

impl ProxyKind {
    pub fn name(&self) -> &'static str {
        match self {
            ProxyKind::Nginx => "nginx",
            ProxyKind::Apache => "apache",
        }
    }

    /// Config subdirectories copied verbatim.
    pub fn config_dirs(&self) -> &'static [&'static str] {
        match self {
            ProxyKind::Nginx => &["sites-available", "sites-enabled", "conf.d"],
            ProxyKind::Apache => &["sites-available", "sites-enabled", "conf-available"],
        }
    }

    pub fn unit(&self) -> &'static str {
        match self {
            ProxyKind::Nginx => "nginx",
            ProxyKind::Apache => "apache2",
        }
    }
}

fn directive(line: &str) -> Option<(&str, &str)> {
    let line = line.trim();
    if line.starts_with('#') {
        return None;
    }
    let (key, rest) = line.split_once(char::is_whitespace)?;
    Some((key, rest.trim().trim_end_matches(';').trim().trim_matches('"')))
}

/// Document roots declared by a site file.
pub fn document_roots(kind: ProxyKind, content: &str) -> Vec<PathBuf> {
    let key = match kind {
        ProxyKind::Nginx => "root",
        ProxyKind::Apache => "DocumentRoot",
    };
    let mut roots: Vec<PathBuf> = content
        .lines()
        .filter_map(directive)
        .filter(|(k, v)| *k == key && v.starts_with('/'))
        .map(|(_, v)| PathBuf::from(v))
        .collect();
    roots.sort();
    roots.dedup();
    roots
}

/// Certificate and key files a site file references.
pub fn referenced_certificates(kind: ProxyKind, content: &str) -> Vec<PathBuf> {
    let keys: &[&str] = match kind {
        ProxyKind::Nginx => &[
            "ssl_certificate",
            "ssl_certificate_key",
            "ssl_trusted_certificate",
            "ssl_dhparam",
            "include",
        ],
        ProxyKind::Apache => &[
            "SSLCertificateFile",
            "SSLCertificateKeyFile",
            "SSLCertificateChainFile",
            "Include",
        ],
    };
    content
        .lines()
        .filter_map(directive)
        .filter(|(k, v)| {
            keys.contains(k) && (!k.eq_ignore_ascii_case("include") || v.contains("letsencrypt"))
        })
        .map(|(_, v)| PathBuf::from(v))
        .collect()
}

fn is_tls_line(kind: ProxyKind, line: &str) -> bool {
    let Some((key, value)) = directive(line) else {
        return false;
    };
    match kind {
        ProxyKind::Nginx => {
            key.starts_with("ssl_")
                || (key == "listen" && (value.contains("443") || value.contains("ssl")))
                || (key == "include" && value.contains("letsencrypt"))
                || (key == "return" && value.contains("https://"))
        }
        ProxyKind::Apache => {
            key.starts_with("SSL")
                || (key == "Include" && value.contains("letsencrypt"))
                || (key == "Redirect" && value.contains("https://"))
                || (key == "RewriteRule" && value.contains("https://"))
        }
    }
}

/// Rewrite a site so it serves plaintext when any certificate it references
/// is missing. Returns `None` when the file needs no change.
pub fn neutralize_tls<F>(kind: ProxyKind, content: &str, cert_exists: F) -> Option<String>
where
    F: Fn(&Path) -> bool,
{
    let missing: Vec<PathBuf> = referenced_certificates(kind, content)
        .into_iter()
        .filter(|p| !cert_exists(p))
        .collect();
    let Some(first_missing) = missing.first() else {
        return None;
    };
    let marker = format!("{}{}", DISABLED_MARKER, first_missing.display());

    let mut out = String::with_capacity(content.len() + 256);
    for line in content.lines() {
        if is_tls_line(kind, line) {
            let indent = &line[..line.len() - line.trim_start().len()];
            out.push_str(&format!("{}{}\n{}# {}\n", indent, marker, indent, line.trim_start()));
        } else if kind == ProxyKind::Apache && line.trim_start().starts_with("<VirtualHost") {
            out.push_str(&line.replace(":443", ":80"));
            out.push('\n');
        } else {
            out.push_str(line);
            out.push('\n');
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NGINX_SITE: &str = "server {\n    \
        server_name shop.example.com;\n    \
        root /var/www/shop;\n    \
        listen 443 ssl; # managed by Certbot\n    \
        ssl_certificate /etc/letsencrypt/live/shop/fullchain.pem;\n    \
        ssl_certificate_key /etc/letsencrypt/live/shop/privkey.pem;\n    \
        include /etc/letsencrypt/options-ssl-nginx.conf;\n\
        }\n\
        server {\n    \
        if ($host = shop.example.com) {\n        \
        return 301 https://$host$request_uri;\n    \
        }\n    \
        listen 80;\n    \
        server_name shop.example.com;\n\
        }\n";

    #[test]
    fn test_nginx_document_roots() {
        assert_eq!(
            document_roots(ProxyKind::Nginx, NGINX_SITE),
            vec![PathBuf::from("/var/www/shop")]
        );
    }

    #[test]
    fn test_nginx_tls_neutralized_when_cert_missing() {
        let out = neutralize_tls(ProxyKind::Nginx, NGINX_SITE, |_| false).expect("rewritten");

        assert!(out.contains("# listen 443 ssl;"));
        assert!(out.contains("# ssl_certificate /etc/letsencrypt/live/shop/fullchain.pem;"));
        assert!(out.contains("# include /etc/letsencrypt/options-ssl-nginx.conf;"));
        assert!(out.contains("# return 301 https://$host$request_uri;"));
        assert!(out.contains("    listen 80;\n"));
        assert!(out.contains("    root /var/www/shop;\n"));
        assert!(out.contains(DISABLED_MARKER));
        for line in out.lines().map(str::trim) {
            assert!(!line.starts_with("ssl_"), "{}", line);
        }
    }

    #[test]
    fn test_nginx_kept_when_certs_present() {
        assert!(neutralize_tls(ProxyKind::Nginx, NGINX_SITE, |_| true).is_none());
    }

    #[test]
    fn test_plain_site_untouched() {
        let site = "server {\n    listen 80;\n    root /var/www/html;\n}\n";
        assert!(neutralize_tls(ProxyKind::Nginx, site, |_| false).is_none());
    }

    #[test]
    fn test_apache_vhost_moves_to_port_80() {
        let site = "<VirtualHost *:443>\n\
                    DocumentRoot \"/var/www/blog\"\n\
                    SSLEngine on\n\
                    SSLCertificateFile /etc/letsencrypt/live/blog/cert.pem\n\
                    Include /etc/letsencrypt/options-ssl-apache.conf\n\
                    </VirtualHost>\n";

        assert_eq!(
            document_roots(ProxyKind::Apache, site),
            vec![PathBuf::from("/var/www/blog")]
        );

        let out = neutralize_tls(ProxyKind::Apache, site, |_| false).expect("rewritten");
        assert!(out.starts_with("<VirtualHost *:80>\n"));
        assert!(out.contains("# SSLEngine on"));
        assert!(out.contains("# SSLCertificateFile"));
        assert!(out.contains("DocumentRoot \"/var/www/blog\"\n"));
    }
}
