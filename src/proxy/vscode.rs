//! Pure header/path rewriting for the vscode proxy variant (§4.I). VS
//! Code's token-cookie auth is stateful per session; stale cookies cause
//! hard 403 loops without the redirect/clear dance implemented here.

pub const COOKIE_NAME: &str = "vscode-tkn";
const CLEARED_COOKIES: [&str; 3] = ["vscode-tkn", "vscode-secret-key-path", "vscode-cli-secret-half"];
pub const REAUTH_REDIRECT_PATH: &str = "/code/";

/// The browser-visible prefix and the backend-visible prefix it maps to.
const INCOMING_PREFIX: &str = "/code";
const BACKEND_ROOT: &str = "/vscode-direct";

/// `/code/...` → `/vscode-direct/...` (§4.I vscode row). `/code` and
/// `/code/` both map onto the VS Code root. Paths outside that prefix are
/// left for the caller to decide (they shouldn't reach this proxy).
pub fn rewrite_path(path: &str) -> Option<String> {
    if path == INCOMING_PREFIX || path == format!("{INCOMING_PREFIX}/") {
        return Some(format!("{BACKEND_ROOT}/"));
    }
    path.strip_prefix(&format!("{INCOMING_PREFIX}/")).map(|rest| format!("{BACKEND_ROOT}/{rest}"))
}

/// Strips a trailing slash for the "is this the VS Code root" check. Query
/// strings are stripped by the caller before this is invoked.
fn normalize_root_path(path: &str) -> &str {
    path.trim_end_matches('/')
}

/// True when the (already `rewrite_path`-rewritten) request targets VS
/// Code's root and carries no `vscode-tkn` cookie matching the session's
/// current token.
pub fn needs_token_redirect(path: &str, cookie_token: Option<&str>, token: &str) -> bool {
    let normalized = normalize_root_path(path);
    (normalized.is_empty() || normalized == BACKEND_ROOT) && cookie_token != Some(token)
}

/// The `(path, query)` the proxy substitutes on the *outbound* request to
/// the backend when [`needs_token_redirect`] holds — not a redirect sent
/// back to the browser.
pub fn token_redirect_target(token: &str) -> (String, String) {
    ("/".to_string(), format!("tkn={token}"))
}

/// `Set-Cookie` values clearing every VS Code auth cookie, emitted
/// alongside a 302 to `/code/` when the backend answers 403 with a
/// mismatching cookie.
pub fn expired_cookie_headers() -> Vec<String> {
    CLEARED_COOKIES.iter().map(|name| format!("{name}=; Path=/; Max-Age=0")).collect()
}

/// Rewrites one backend `Set-Cookie` value on a non-403 response: drop
/// `Domain=`, force `Path=/`.
pub fn rewrite_success_cookie(raw: &str) -> String {
    let mut saw_path = false;
    let mut attrs: Vec<String> = raw
        .split(';')
        .map(|s| s.trim())
        .filter(|attr| !attr.to_ascii_lowercase().starts_with("domain="))
        .map(|attr| {
            if attr.to_ascii_lowercase().starts_with("path=") {
                saw_path = true;
                "Path=/".to_string()
            } else {
                attr.to_string()
            }
        })
        .collect();
    if !saw_path {
        attrs.push("Path=/".to_string());
    }
    attrs.join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_prefixed_path() {
        assert_eq!(rewrite_path("/code/stable-abc/vscode-remote-resource"), Some("/vscode-direct/stable-abc/vscode-remote-resource".to_string()));
    }

    #[test]
    fn rewrites_root_with_and_without_trailing_slash() {
        assert_eq!(rewrite_path("/code"), Some("/vscode-direct/".to_string()));
        assert_eq!(rewrite_path("/code/"), Some("/vscode-direct/".to_string()));
    }

    #[test]
    fn leaves_unprefixed_path_alone() {
        assert_eq!(rewrite_path("/other"), None);
    }

    #[test]
    fn root_with_no_cookie_needs_redirect() {
        assert!(needs_token_redirect("/vscode-direct/", None, "TOK"));
        assert!(needs_token_redirect("/vscode-direct", None, "TOK"));
        assert!(needs_token_redirect("/", None, "TOK"));
        assert!(needs_token_redirect("", None, "TOK"));
    }

    #[test]
    fn root_with_stale_cookie_needs_redirect() {
        assert!(needs_token_redirect("/vscode-direct/", Some("STALE"), "TOK"));
    }

    #[test]
    fn root_with_matching_cookie_is_fine() {
        assert!(!needs_token_redirect("/vscode-direct/", Some("TOK"), "TOK"));
    }

    #[test]
    fn non_root_path_never_needs_redirect() {
        assert!(!needs_token_redirect("/vscode-direct/stable-abc/vscode-remote-resource", None, "TOK"));
    }

    #[test]
    fn token_redirect_target_carries_token_as_query() {
        assert_eq!(token_redirect_target("TOK"), ("/".to_string(), "tkn=TOK".to_string()));
    }

    #[test]
    fn expired_cookies_cover_all_three_names() {
        let cookies = expired_cookie_headers();
        assert_eq!(cookies.len(), 3);
        assert!(cookies.iter().any(|c| c.starts_with("vscode-tkn=")));
        assert!(cookies.iter().any(|c| c.starts_with("vscode-secret-key-path=")));
        assert!(cookies.iter().any(|c| c.starts_with("vscode-cli-secret-half=")));
        assert!(cookies.iter().all(|c| c.contains("Max-Age=0")));
    }

    #[test]
    fn success_cookie_drops_domain_and_forces_root_path() {
        let rewritten = rewrite_success_cookie("vscode-tkn=abc; Domain=example.edu; Path=/code; HttpOnly");
        assert_eq!(rewritten, "vscode-tkn=abc; Path=/; HttpOnly");
    }

    #[test]
    fn success_cookie_adds_path_when_absent() {
        let rewritten = rewrite_success_cookie("vscode-tkn=abc");
        assert_eq!(rewritten, "vscode-tkn=abc; Path=/");
    }
}
