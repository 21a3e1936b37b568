//! Distinguished name helpers (RFC 2253 string form).
//!
//! Only what backends need to key and navigate entries: splitting into RDNs,
//! joining back with escaping, and a case-folded normal form. Full X.500
//! name comparison is not attempted.

use crate::result::{LdapError, LdapResult};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    #[allow(clippy::expect_used)]
    static ref ESCAPED_SPECIAL: Regex = Regex::new(r#"\\([ #,+"\\<>;=])"#).expect("Invalid DN escape regex");
    #[allow(clippy::expect_used)]
    static ref RDN_SEPARATOR: Regex = Regex::new(r"\s*[,;]\s*").expect("Invalid RDN separator regex");
}

/// One RDN: its `attr=value` pairs in the order written.
pub type Rdn = Vec<(String, String)>;

fn unhex(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            if let Some(b) = s.get(i + 1..i + 3).and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(b);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Split a DN into RDNs, most specific first. Attribute names are
/// lowercased; values keep their case. `;` is accepted as a separator and
/// spaces around separators are ignored.
pub fn split_dn(dn: &str) -> LdapResult<Vec<Rdn>> {
    // turn character escapes into hex so separators can be split on safely
    let hexed = ESCAPED_SPECIAL.replace_all(dn, |caps: &regex::Captures<'_>| {
        format!("\\{:02x}", caps[1].as_bytes()[0])
    });
    if hexed.trim().is_empty() {
        return Ok(Vec::new());
    }
    RDN_SEPARATOR
        .split(hexed.trim())
        .map(|part| {
            part.split('+')
                .map(|av| {
                    let (attr, val) = av
                        .split_once('=')
                        .filter(|(a, _)| !a.is_empty())
                        .ok_or_else(|| LdapError::protocol(format!("Bad DN component: {}", av)))?;
                    Ok((unhex(attr).to_lowercase(), unhex(val)))
                })
                .collect::<LdapResult<Rdn>>()
        })
        .collect()
}

fn escape_value(val: &str) -> String {
    let last = val.chars().count().saturating_sub(1);
    let mut out = String::with_capacity(val.len());
    for (i, c) in val.chars().enumerate() {
        let edge = (i == 0 && (c == '#' || c == ' ')) || (i == last && c == ' ');
        if edge || matches!(c, ',' | '+' | '"' | '\\' | '<' | '>' | ';') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Inverse of `split_dn`.
pub fn join_dn(rdns: &[Rdn]) -> String {
    rdns.iter()
        .map(|rdn| {
            rdn.iter()
                .map(|(attr, val)| format!("{}={}", attr, escape_value(val)))
                .collect::<Vec<_>>()
                .join("+")
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Case-folded form used as a lookup key: attribute names and values
/// lowercased, whitespace around separators removed.
pub fn normalize_dn(dn: &str) -> LdapResult<String> {
    let rdns = split_dn(dn)?
        .into_iter()
        .map(|rdn| {
            rdn.into_iter()
                .map(|(a, v)| (a, v.trim().to_lowercase()))
                .collect()
        })
        .collect::<Vec<Rdn>>();
    Ok(join_dn(&rdns))
}

/// The DN of the immediate superior, `None` for the empty DN.
pub fn parent_dn(dn: &str) -> LdapResult<Option<String>> {
    let rdns = split_dn(dn)?;
    if rdns.is_empty() {
        return Ok(None);
    }
    Ok(Some(join_dn(&rdns[1..])))
}
