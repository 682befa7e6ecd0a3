//! Pure header rewriting for the rstudio proxy variant (§4.I). Cookie
//! *values* are signed by the backend and must never be touched, only the
//! surrounding attributes.

use std::time::Duration;

pub const ROOT_PATH_HEADER: (&str, &str) = ("X-RStudio-Root-Path", "/rstudio-direct");
pub const STRIPPED_RESPONSE_HEADERS: &[&str] = &["x-frame-options"];

/// Long-poll RPC calls hang for minutes; the proxy must not time them out
/// at a generic short default.
pub const LONG_POLL_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Rewrites one backend `Set-Cookie` value: keep `Path=/rstudio-direct`
/// (no trailing slash), add `Secure` and `SameSite=None`, leave the
/// name=value pair untouched.
pub fn rewrite_cookie(raw: &str) -> String {
    let mut parts = raw.splitn(2, ';');
    let name_value = parts.next().unwrap_or("").trim().to_string();
    let mut attrs: Vec<String> = parts
        .next()
        .unwrap_or("")
        .split(';')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .filter(|attr| {
            let lower = attr.to_ascii_lowercase();
            !(lower.starts_with("path=") || lower == "secure" || lower.starts_with("samesite"))
        })
        .map(|s| s.to_string())
        .collect();
    attrs.push("Path=/rstudio-direct".to_string());
    attrs.push("Secure".to_string());
    attrs.push("SameSite=None".to_string());
    format!("{name_value}; {}", attrs.join("; "))
}

/// Rewrites a `Location` header: absolute URLs pointing at the loopback
/// port or the external host both collapse to `/rstudio-direct`; bare
/// root-relative locations get `/rstudio-direct` prefixed; anything else
/// passes through unchanged.
pub fn rewrite_location(raw: &str, loopback_port: u16, external_host: &str) -> String {
    let loopback_prefixes = [format!("http://127.0.0.1:{loopback_port}"), format!("http://localhost:{loopback_port}")];
    let external_prefixes = [format!("http://{external_host}"), format!("https://{external_host}")];

    if loopback_prefixes.iter().chain(external_prefixes.iter()).any(|prefix| raw.starts_with(prefix.as_str())) {
        return "/rstudio-direct".to_string();
    }
    if let Some(rest) = raw.strip_prefix('/') {
        return format!("/rstudio-direct/{rest}");
    }
    raw.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_keeps_value_and_rewrites_attributes() {
        let rewritten = rewrite_cookie("rs-session=SIGNED-VALUE; Path=/; HttpOnly");
        assert!(rewritten.starts_with("rs-session=SIGNED-VALUE;"));
        assert!(rewritten.contains("Path=/rstudio-direct"));
        assert!(rewritten.contains("Secure"));
        assert!(rewritten.contains("SameSite=None"));
        assert!(rewritten.contains("HttpOnly"));
        assert!(!rewritten.contains("Path=/;"));
    }

    #[test]
    fn cookie_without_attributes_still_gets_required_ones() {
        let rewritten = rewrite_cookie("rs-session=VALUE");
        assert_eq!(rewritten, "rs-session=VALUE; Path=/rstudio-direct; Secure; SameSite=None");
    }

    #[test]
    fn location_on_loopback_port_collapses() {
        assert_eq!(rewrite_location("http://127.0.0.1:9100/auth-sign-in", 9100, "hpc.example.edu"), "/rstudio-direct");
    }

    #[test]
    fn location_on_external_host_collapses() {
        assert_eq!(rewrite_location("https://hpc.example.edu/rstudio-direct/foo", 9100, "hpc.example.edu"), "/rstudio-direct");
    }

    #[test]
    fn root_relative_location_gets_prefixed() {
        assert_eq!(rewrite_location("/auth-sign-in", 9100, "hpc.example.edu"), "/rstudio-direct/auth-sign-in");
    }

    #[test]
    fn unrelated_location_passes_through() {
        assert_eq!(rewrite_location("https://cdn.example.com/asset.js", 9100, "hpc.example.edu"), "https://cdn.example.com/asset.js");
    }
}
