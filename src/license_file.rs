//! FlexNet license file text.
//!
//! License managers hand out their license file verbatim, and vendor license
//! sets embed the same syntax. Parsing is best effort: lines that cannot be
//! understood are skipped, never fatal.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::debug;

/// `SERVER` line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerLine {
    pub host: String,
    pub hostid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// `VENDOR` or `DAEMON` line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VendorLine {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// `FEATURE` or `INCREMENT` line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct License {
    pub feature: String,
    pub vendor: String,
    pub version: String,
    pub expiry: String,
    /// `None` for uncounted licenses.
    pub quantity: Option<u32>,
    /// `key=value` attributes, keys lowercased.
    pub attributes: BTreeMap<String, String>,
    /// Tokens that are not part of an attribute.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extras: Vec<String>,
}

impl License {
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// Signature used to ask a vendor daemon about this license: the `SIGN`
    /// attribute, or the first bare token for files that use the old
    /// unnamed license key.
    pub fn signature(&self) -> Option<&str> {
        self.attribute("sign")
            .or_else(|| self.extras.first().map(String::as_str))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LicenseFile {
    pub use_server: bool,
    pub servers: Vec<ServerLine>,
    pub vendors: Vec<VendorLine>,
    pub licenses: Vec<License>,
}

impl LicenseFile {
    pub fn parse(text: &str) -> Self {
        let mut file = LicenseFile::default();
        for tokens in lex(text) {
            match tokens[0].as_str() {
                "USE_SERVER" => file.use_server = true,
                "SERVER" => {
                    if let Some(server) = server_line(&tokens[1..]) {
                        file.servers.push(server);
                    }
                }
                "VENDOR" | "DAEMON" => {
                    if let Some(name) = tokens.get(1) {
                        file.vendors.push(VendorLine {
                            name: name.clone(),
                            path: tokens.get(2).cloned(),
                        });
                    }
                }
                "FEATURE" | "INCREMENT" => match license_line(&tokens[1..]) {
                    Some(license) => file.licenses.push(license),
                    None => debug!("Skipping malformed license line: {:?}", tokens),
                },
                _ => {}
            }
        }
        file
    }

    /// Licenses served by `vendor`.
    pub fn licenses_for<'a>(&'a self, vendor: &'a str) -> impl Iterator<Item = &'a License> {
        self.licenses.iter().filter(move |l| l.vendor == vendor)
    }
}

fn server_line(tokens: &[String]) -> Option<ServerLine> {
    let [host, hostid, rest @ ..] = tokens else {
        return None;
    };
    let mut hostid = hostid.clone();
    let mut rest = rest;
    // hostids such as ID=1234 arrive as three tokens
    while let [eq, value, tail @ ..] = rest {
        if eq != "=" {
            break;
        }
        hostid.push('=');
        hostid.push_str(value);
        rest = tail;
    }
    Some(ServerLine {
        host: host.clone(),
        hostid,
        port: rest.first().and_then(|p| p.parse().ok()),
    })
}

fn unquote(token: &str) -> String {
    token.trim_matches('"').to_string()
}

fn license_line(tokens: &[String]) -> Option<License> {
    let [feature, vendor, version, expiry, quantity, rest @ ..] = tokens else {
        return None;
    };
    let quantity = if quantity.eq_ignore_ascii_case("uncounted") {
        None
    } else {
        Some(quantity.parse().ok()?)
    };

    let mut attributes = BTreeMap::new();
    let mut extras = Vec::new();
    let mut i = 0;
    while i < rest.len() {
        let is_key = rest.get(i + 1).is_some_and(|t| t == "=") && i + 2 < rest.len();
        if !is_key {
            extras.push(rest[i].clone());
            i += 1;
            continue;
        }
        let key = unquote(&rest[i]).to_lowercase();
        let mut value = unquote(&rest[i + 2]);
        i += 3;
        // values that themselves contain '=' continue in later tokens
        while rest.get(i).is_some_and(|t| t == "=") && i + 1 < rest.len() {
            value.push('=');
            value.push_str(&rest[i + 1]);
            i += 2;
        }
        attributes.insert(key, value);
    }

    Some(License {
        feature: feature.clone(),
        vendor: vendor.clone(),
        version: version.clone(),
        expiry: expiry.clone(),
        quantity,
        attributes,
        extras,
    })
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "_.,-/:;+^".contains(c)
}

/// Split license text into non-empty token lines.
///
/// Words are runs of word characters, quoted strings keep their quotes, `#`
/// starts a comment and every other character is a token of its own.
/// Backslash-newline joins lines.
fn lex(text: &str) -> Vec<Vec<String>> {
    let text = text.replace("\r\n", "\n").replace("\\\n", "");
    text.lines()
        .map(lex_line)
        .filter(|tokens| !tokens.is_empty())
        .collect()
}

fn lex_line(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_whitespace() {
            continue;
        }
        if c == '#' {
            break;
        }
        if c == '"' || c == '\'' {
            let mut token = String::from(c);
            for next in chars.by_ref() {
                token.push(next);
                if next == c {
                    break;
                }
            }
            tokens.push(token);
            continue;
        }
        if !is_word_char(c) {
            tokens.push(c.to_string());
            continue;
        }
        let mut token = String::from(c);
        while let Some(&next) = chars.peek() {
            if is_word_char(next) || next == '"' || next == '\'' {
                token.push(next);
                chars.next();
            } else {
                break;
            }
        }
        tokens.push(token);
    }
    tokens
}
