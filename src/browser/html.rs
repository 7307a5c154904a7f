//! Plain-text views of HTML pages.

use std::sync::OnceLock;

use regex::Regex;
use url::Url;

use super::Link;

/// Links kept per page.
const MAX_LINKS: usize = 200;

/// Basic HTML entity decoding.
pub fn decode_entities(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&amp;", "&")
}

/// Remove every `<tag ...>...</tag>` block of the given element.
fn strip_element(html: &str, tag: &str) -> String {
    let open = format!("<{}", tag);
    let close = format!("</{}>", tag);
    let mut text = html.to_string();
    loop {
        let lower = text.to_ascii_lowercase();
        let Some(start) = lower.find(&open) else {
            break;
        };
        match lower[start..].find(&close) {
            Some(end) => text.replace_range(start..start + end + close.len(), " "),
            None => break,
        }
    }
    text
}

/// Extract readable text from HTML.
pub fn extract_text(html: &str) -> String {
    let mut text = html.to_string();
    for tag in ["script", "style", "noscript", "svg"] {
        text = strip_element(&text, tag);
    }

    let mut result = String::with_capacity(text.len() / 2);
    let mut in_tag = false;
    for c in text.chars() {
        match c {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                result.push(' ');
            }
            _ if !in_tag => result.push(c),
            _ => {}
        }
    }

    let result = result.split_whitespace().collect::<Vec<_>>().join(" ");
    decode_entities(&result)
}

fn title_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("valid regex"))
}

fn link_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?is)<a\s[^>]*?href\s*=\s*["']([^"']+)["'][^>]*>(.*?)</a>"#)
            .expect("valid regex")
    })
}

pub fn extract_title(html: &str) -> String {
    title_pattern()
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| decode_entities(m.as_str().split_whitespace().collect::<Vec<_>>().join(" ").as_str()))
        .unwrap_or_default()
}

/// Absolute http(s) links on the page, deduplicated.
///
/// Search-engine redirect links (`...?uddg=<target>`) are unwrapped to
/// their target.
pub fn extract_links(html: &str, base: &Url) -> Vec<Link> {
    let mut links: Vec<Link> = Vec::new();
    for caps in link_pattern().captures_iter(html) {
        let raw_href = decode_entities(&caps[1]);
        let Ok(mut href) = base.join(&raw_href) else {
            continue;
        };
        let redirect = href
            .query_pairs()
            .find(|(k, _)| k == "uddg")
            .map(|(_, target)| target.into_owned());
        if let Some(target) = redirect {
            match Url::parse(&target) {
                Ok(unwrapped) => href = unwrapped,
                Err(_) => continue,
            }
        }
        if href.scheme() != "http" && href.scheme() != "https" {
            continue;
        }
        let text = extract_text(&caps[2]);
        let href = href.to_string();
        if links.iter().any(|l| l.href == href) {
            continue;
        }
        links.push(Link { text, href });
        if links.len() >= MAX_LINKS {
            break;
        }
    }
    links
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<html><head><title> Countries &amp; people </title>
        <style>body { color: red }</style><script>var x = "<p>";</script></head>
        <body><h1>Population</h1><p>China &lt;1.4B&gt;</p>
        <a href="/wiki/India">India</a>
        <a href='https://other.test/x'><b>Other</b></a>
        <a href="/wiki/India">India again</a>
        <a href="mailto:a@b.c">mail</a>
        <a href="//duckduckgo.com/l/?uddg=https%3A%2F%2Fdata.test%2Fexport.csv&rut=1">Export</a>
        </body></html>"#;

    #[test]
    fn test_text_drops_scripts_and_decodes() {
        let text = extract_text(PAGE);
        assert!(text.contains("Population China <1.4B>"));
        assert!(!text.contains("color: red"));
        assert!(!text.contains("var x"));
    }

    #[test]
    fn test_title() {
        assert_eq!(extract_title(PAGE), "Countries & people");
        assert_eq!(extract_title("<p>none</p>"), "");
    }

    #[test]
    fn test_links_are_absolute_and_unique() {
        let base = Url::parse("https://en.wikipedia.test/wiki/Main").unwrap();
        let links = extract_links(PAGE, &base);
        let hrefs: Vec<_> = links.iter().map(|l| l.href.as_str()).collect();
        assert_eq!(
            hrefs,
            vec![
                "https://en.wikipedia.test/wiki/India",
                "https://other.test/x",
                "https://data.test/export.csv",
            ]
        );
        assert_eq!(links[1].text, "Other");
    }
}
