use std::collections::BTreeMap;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};

/// Characters left alone by JavaScript's `encodeURIComponent`.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Appends `params` to `base` as an encoded query string.
///
/// Uses `&` when `base` already carries a query, `?` otherwise. Returns
/// `base` unchanged when there are no params.
pub fn build_url(base: &str, params: &BTreeMap<String, String>) -> String {
    let query = params
        .iter()
        .map(|(name, value)| {
            format!(
                "{}={}",
                utf8_percent_encode(name, COMPONENT),
                utf8_percent_encode(value, COMPONENT)
            )
        })
        .collect::<Vec<_>>()
        .join("&");

    if query.is_empty() {
        return base.to_string();
    }
    let sep = if base.find('?').is_some_and(|i| i > 0) {
        '&'
    } else {
        '?'
    };
    format!("{base}{sep}{query}")
}
