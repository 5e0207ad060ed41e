use std::collections::BTreeMap;

/// Current wall-clock time as unix seconds.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Splits a browser cookie header (`a=1; b=2`) into its pairs.
pub fn parse_cookie(cookie: &str) -> BTreeMap<String, String> {
    cookie
        .split(';')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Upstream platforms hand out protocol-relative or plain http image links.
pub fn link_to_https(link: &str) -> String {
    if let Some(rest) = link.strip_prefix("//") {
        format!("https://{}", rest)
    } else if let Some(rest) = link.strip_prefix("http://") {
        format!("https://{}", rest)
    } else {
        link.to_string()
    }
}
