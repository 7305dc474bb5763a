//! Pagination and rate-limit response headers.

use std::time::Duration;

/// Per-app call budget header, formatted `used/max`.
pub(crate) const CALL_LIMIT: &str = "x-shopify-shop-api-call-limit";

/// URL of the `rel="next"` entry of an RFC 8288 `Link` header.
pub(crate) fn next_link(header: &str) -> Option<String> {
    header.split(',').find_map(|entry| {
        let mut parts = entry.split(';');
        let target = parts.next()?.trim();
        let is_next = parts.any(|param| {
            let param = param.trim();
            param == "rel=\"next\"" || param == "rel=next"
        });
        if !is_next {
            return None;
        }
        target
            .strip_prefix('<')
            .and_then(|t| t.strip_suffix('>'))
            .map(str::to_string)
    })
}

/// `(used, max)` from the call-limit header.
pub(crate) fn call_limit(header: &str) -> Option<(u32, u32)> {
    let (used, max) = header.trim().split_once('/')?;
    Some((used.trim().parse().ok()?, max.trim().parse().ok()?))
}

/// `Retry-After` in (possibly fractional) seconds.
pub(crate) fn retry_after(header: &str) -> Option<Duration> {
    let secs: f64 = header.trim().parse().ok()?;
    Duration::try_from_secs_f64(secs).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_link_picks_rel_next() {
        let header = r#"<https://acme.myshopify.com/admin/api/2023-10/orders.json?limit=250&page_info=prev1>; rel="previous", <https://acme.myshopify.com/admin/api/2023-10/orders.json?limit=250&page_info=abc>; rel="next""#;
        assert_eq!(
            next_link(header).as_deref(),
            Some("https://acme.myshopify.com/admin/api/2023-10/orders.json?limit=250&page_info=abc")
        );
    }

    #[test]
    fn previous_only_has_no_next() {
        assert_eq!(next_link(r#"<https://x/orders.json?page_info=p>; rel="previous""#), None);
        assert_eq!(next_link(""), None);
    }

    #[test]
    fn call_limit_parses() {
        assert_eq!(call_limit("39/40"), Some((39, 40)));
        assert_eq!(call_limit(" 40 / 40 "), Some((40, 40)));
        assert_eq!(call_limit("forty"), None);
    }

    #[test]
    fn retry_after_accepts_fractional_seconds() {
        assert_eq!(retry_after("2.0"), Some(Duration::from_secs(2)));
        assert_eq!(retry_after("0.5"), Some(Duration::from_millis(500)));
        assert_eq!(retry_after("-1"), None);
        assert_eq!(retry_after("soon"), None);
    }

    #[test]
    fn retry_after_rejects_unrepresentable_values() {
        assert_eq!(retry_after("1e30"), None);
        assert_eq!(retry_after("inf"), None);
        assert_eq!(retry_after("NaN"), None);
    }
}
