use percent_encoding::{percent_encode, NON_ALPHANUMERIC, AsciiSet};
pub use percent_encoding::percent_decode;

/// RFC 3986 unreserved characters (`ALPHA / DIGIT / "-" / "." / "_" / "~"`) pass through,
/// everything else is percent-encoded. This is the encoding OAuth 1.0 signatures require and
/// it is also safe for `application/x-www-form-urlencoded` bodies.
const UNRESERVED_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Encodes a string for URL safety and returns an owned `String`
///
/// # Example
/// ```
/// use starberry_lib::url_encoding::encode_url_owned;
/// let encoded = encode_url_owned("Hello World!");
/// assert_eq!(encoded, "Hello%20World%21");
/// ```
pub fn encode_url_owned(input: &str) -> String {
    percent_encode(input.as_bytes(), UNRESERVED_SET).to_string()
}

/// Decodes a URL-encoded string and returns an owned `String`.
///
/// `+` is left untouched; use [`decode_form_component`] for form bodies and query strings.
pub fn decode_url_owned(input: &str) -> String {
    percent_decode(input.as_bytes())
        .decode_utf8_lossy()
        .into_owned()
}

/// Decodes one `application/x-www-form-urlencoded` component, turning `+` into a space first.
pub fn decode_form_component(input: &str) -> String {
    decode_url_owned(&input.replace('+', " "))
}

/// Joins key/value pairs into `k1=v1&k2=v2`, encoding both sides.
///
/// # Example
/// ```
/// use starberry_lib::url_encoding::encode_pairs;
/// let body = encode_pairs([("grant_type", "authorization_code"), ("code", "a b")]);
/// assert_eq!(body, "grant_type=authorization_code&code=a%20b");
/// ```
pub fn encode_pairs<I, K, V>(pairs: I) -> String
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    pairs
        .into_iter()
        .map(|(k, v)| format!("{}={}", encode_url_owned(k.as_ref()), encode_url_owned(v.as_ref())))
        .collect::<Vec<_>>()
        .join("&")
}

/// Parses a query string or form body into decoded pairs, preserving order.
///
/// A leading `?` is ignored and keys without `=` get an empty value.
pub fn parse_pairs(input: &str) -> Vec<(String, String)> {
    input
        .trim_start_matches('?')
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            (decode_form_component(k), decode_form_component(v))
        })
        .collect()
}

/// Appends encoded pairs to a URL, respecting an existing query string.
pub fn append_query<I, K, V>(url: &str, pairs: I) -> String
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let query = encode_pairs(pairs);
    if query.is_empty() {
        return url.to_string();
    }
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{}{}{}", url, separator, query)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unreserved_characters_pass_through() {
        assert_eq!(encode_url_owned("abcXYZ019-._~"), "abcXYZ019-._~");
        assert_eq!(encode_url_owned("a+b c/d"), "a%2Bb%20c%2Fd");
        assert_eq!(encode_url_owned("é"), "%C3%A9");
    }

    #[test]
    fn test_encode_then_decode_recovers_input() {
        for input in ["Hello Ladies + Gentlemen, a signed OAuth request!", "ünïcødé", "a=b&c=d", "~-._", ""] {
            assert_eq!(decode_url_owned(&encode_url_owned(input)), input);
        }
    }

    #[test]
    fn test_parse_pairs() {
        let pairs = parse_pairs("?oauth_token=rt&oauth_token_secret=r%2Bs&flag&name=a+b");
        assert_eq!(
            pairs,
            vec![
                ("oauth_token".to_string(), "rt".to_string()),
                ("oauth_token_secret".to_string(), "r+s".to_string()),
                ("flag".to_string(), String::new()),
                ("name".to_string(), "a b".to_string()),
            ]
        );
        assert!(parse_pairs("").is_empty());
    }

    #[test]
    fn test_append_query() {
        assert_eq!(append_query("https://x.test/auth", [("a", "1")]), "https://x.test/auth?a=1");
        assert_eq!(append_query("https://x.test/auth?v=2", [("a", "1")]), "https://x.test/auth?v=2&a=1");
        assert_eq!(append_query("https://x.test/auth", Vec::<(&str, &str)>::new()), "https://x.test/auth");
    }
}
