//! Pure path/query rewriting for the jupyter proxy variant (§4.I). Jupyter
//! authenticates by query-string token rather than a cookie.

/// `/jupyter/...` → `/jupyter-direct/...`. Paths outside that prefix are
/// left for the caller to decide (they shouldn't reach this proxy).
pub fn rewrite_path(path: &str) -> Option<String> {
    path.strip_prefix("/jupyter/").map(|rest| format!("/jupyter-direct/{rest}"))
}

/// Appends `token=<token>` to the query string unless one is already
/// present.
pub fn inject_token(query: &str, token: &str) -> String {
    if query.split('&').any(|kv| kv == "token" || kv.starts_with("token=")) {
        return query.to_string();
    }
    if query.is_empty() {
        format!("token={token}")
    } else {
        format!("{query}&token={token}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_prefixed_path() {
        assert_eq!(rewrite_path("/jupyter/api/contents"), Some("/jupyter-direct/api/contents".to_string()));
    }

    #[test]
    fn leaves_unprefixed_path_alone() {
        assert_eq!(rewrite_path("/other"), None);
    }

    #[test]
    fn injects_token_when_absent() {
        assert_eq!(inject_token("", "TOK"), "token=TOK");
        assert_eq!(inject_token("foo=bar", "TOK"), "foo=bar&token=TOK");
    }

    #[test]
    fn leaves_existing_token_untouched() {
        assert_eq!(inject_token("token=ALREADY", "TOK"), "token=ALREADY");
        assert_eq!(inject_token("foo=bar&token=ALREADY", "TOK"), "foo=bar&token=ALREADY");
    }
}
