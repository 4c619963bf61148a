//! Endpoint URL templates.
//!
//! `{index}` expands to the connection index and `{random:N}` to `N` random
//! ASCII letters, e.g. `ws://127.0.0.1:8080/{index}-{random:32}`.

use anyhow::{anyhow, bail, Result};
use rand::Rng;
use std::str::FromStr;

const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Literal(String),
    Index,
    Random(usize),
}

/// Parsed endpoint template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlTemplate {
    parts: Vec<Part>,
}

impl FromStr for UrlTemplate {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = Vec::new();
        let mut rest = s;

        while let Some(open) = rest.find('{') {
            if open > 0 {
                parts.push(Part::Literal(rest[..open].to_string()));
            }
            let close = rest[open..]
                .find('}')
                .map(|i| open + i)
                .ok_or_else(|| anyhow!("unclosed '{{' in template {}", s))?;

            let placeholder = &rest[open + 1..close];
            parts.push(match placeholder.split_once(':') {
                None if placeholder == "index" => Part::Index,
                Some(("random", len)) => Part::Random(
                    len.trim()
                        .parse()
                        .map_err(|_| anyhow!("bad length in {{{}}}", placeholder))?,
                ),
                _ => bail!("unknown placeholder {{{}}} in template {}", placeholder, s),
            });
            rest = &rest[close + 1..];
        }
        if !rest.is_empty() {
            parts.push(Part::Literal(rest.to_string()));
        }

        Ok(Self { parts })
    }
}

impl UrlTemplate {
    /// Expand the template for connection `index`
    pub fn render<R: Rng>(&self, index: usize, rng: &mut R) -> String {
        let mut out = String::new();
        for part in &self.parts {
            match part {
                Part::Literal(text) => out.push_str(text),
                Part::Index => out.push_str(&index.to_string()),
                Part::Random(len) => {
                    out.extend((0..*len).map(|_| LETTERS[rng.gen_range(0..LETTERS.len())] as char))
                }
            }
        }
        out
    }
}

/// Default `Origin` header for an endpoint: same URL over http(s)
pub fn origin_for(endpoint: &str) -> String {
    if let Some(rest) = endpoint.strip_prefix("wss://") {
        format!("https://{}", rest)
    } else if let Some(rest) = endpoint.strip_prefix("ws://") {
        format!("http://{}", rest)
    } else {
        endpoint.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_render_index_and_random() {
        let template: UrlTemplate = "ws://127.0.0.1:8080/{index}-{random:32}".parse().unwrap();
        let url = template.render(7, &mut StdRng::seed_from_u64(1));

        let suffix = url.strip_prefix("ws://127.0.0.1:8080/7-").unwrap();
        assert_eq!(suffix.len(), 32);
        assert!(suffix.bytes().all(|b| b.is_ascii_alphabetic()));
    }

    #[test]
    fn test_plain_url_is_literal() {
        let template: UrlTemplate = "ws://host/room".parse().unwrap();
        assert_eq!(template.render(3, &mut StdRng::seed_from_u64(1)), "ws://host/room");
    }

    #[test]
    fn test_bad_templates() {
        assert!("ws://host/{index".parse::<UrlTemplate>().is_err());
        assert!("ws://host/{nope}".parse::<UrlTemplate>().is_err());
        assert!("ws://host/{random:x}".parse::<UrlTemplate>().is_err());
    }

    #[test]
    fn test_origin_follows_scheme() {
        assert_eq!(origin_for("ws://h:1/a"), "http://h:1/a");
        assert_eq!(origin_for("wss://h/a"), "https://h/a");
    }
}
