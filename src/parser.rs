//! RSS 2.0 / Atom document parsing.
//!
//! The response body is first read into a small element tree, then the tree
//! is inspected for either an RSS `channel` with `item`s or Atom `entry`
//! elements under the root. Element names are matched on their qualified
//! name, so extension elements such as `atom:link` inside an RSS item are
//! never mistaken for the item's own `link`.

use chrono::{DateTime, NaiveDateTime, Utc};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;
use tracing::debug;

/// The body could not be read as XML at all.
#[derive(Debug, Error)]
#[error("Malformed feed document: {0}")]
pub struct MalformedDocument(String);

impl MalformedDocument {
    fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// One item/entry as found in the document, before any storage-side cleanup.
///
/// `title` and `description` are raw (not HTML-entity-decoded, not truncated);
/// the reconciler normalizes them.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedArticle {
    pub title: String,
    pub description: String,
    pub link: String,
    pub external_id: String,
    pub published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Rss,
    Atom,
    Unrecognized,
}

#[derive(Debug, Clone)]
pub struct ParsedDocument {
    pub dialect: Dialect,
    /// Channel title (RSS) or feed title (Atom), raw.
    pub title: Option<String>,
    pub articles: Vec<ParsedArticle>,
}

/// Parse a response body into a normalized list of articles.
///
/// A well-formed document that is neither RSS nor Atom yields zero articles.
pub fn parse_document(
    body: &[u8],
    content_type: Option<&str>,
) -> Result<ParsedDocument, MalformedDocument> {
    if let Some(content_type) = content_type {
        if !is_xml_content_type(content_type) {
            debug!("Parsing feed served as '{}' as XML anyway", content_type);
        }
    }

    let root = read_tree(body)?;

    if let Some(channel) = root
        .child("channel")
        .filter(|channel| channel.child("item").is_some())
    {
        return Ok(ParsedDocument {
            dialect: Dialect::Rss,
            title: channel.child_text("title"),
            articles: channel.children_named("item").map(rss_item).collect(),
        });
    }

    if root.child("entry").is_some() {
        return Ok(ParsedDocument {
            dialect: Dialect::Atom,
            title: root.child_text("title"),
            articles: root.children_named("entry").map(atom_entry).collect(),
        });
    }

    let title = root
        .child("channel")
        .and_then(|channel| channel.child_text("title"))
        .or_else(|| root.child_text("title"));

    Ok(ParsedDocument {
        dialect: Dialect::Unrecognized,
        title,
        articles: Vec::new(),
    })
}

fn is_xml_content_type(content_type: &str) -> bool {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    mime.ends_with("/xml") || mime.ends_with("+xml")
}

fn rss_item(item: &Element) -> ParsedArticle {
    let link = item.child_text("link").unwrap_or_default();
    let external_id = item
        .child_text("guid")
        .filter(|guid| !guid.is_empty())
        .unwrap_or_else(|| link.clone());

    ParsedArticle {
        title: item.child_text("title").unwrap_or_default(),
        description: item.child_text("description").unwrap_or_default(),
        published_at: item
            .child_text("pubDate")
            .as_deref()
            .and_then(parse_timestamp),
        link,
        external_id,
    }
}

fn atom_entry(entry: &Element) -> ParsedArticle {
    let link = atom_link(entry);
    let external_id = entry
        .child_text("id")
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| link.clone());

    let description = entry
        .child("content")
        .or_else(|| entry.child("summary"))
        .map(Element::text)
        .unwrap_or_default();

    let published_at = entry
        .child_text("published")
        .as_deref()
        .and_then(parse_timestamp)
        .or_else(|| {
            entry
                .child_text("updated")
                .as_deref()
                .and_then(parse_timestamp)
        });

    ParsedArticle {
        title: entry.child_text("title").unwrap_or_default(),
        description,
        link,
        external_id,
        published_at,
    }
}

/// First `alternate` (or rel-less) link, else the first link of any kind.
fn atom_link(entry: &Element) -> String {
    let mut links = entry.children_named("link").peekable();
    let first = links.peek().copied();

    let preferred = links
        .find(|link| matches!(link.attribute("rel"), None | Some("") | Some("alternate")))
        .and_then(|link| link.attribute("href"))
        .unwrap_or("");

    if !preferred.is_empty() {
        return preferred.trim().to_string();
    }

    first
        .and_then(|link| link.attribute("href"))
        .unwrap_or("")
        .trim()
        .to_string()
}

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%a, %d %b %Y %H:%M:%S",
    "%d %b %Y %H:%M:%S",
];

/// Parse a feed timestamp. RFC 2822 (RSS) and RFC 3339 (Atom) are tried
/// first, then a few zone-less layouts seen in the wild, read as UTC.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    let rfc2822 = match value.strip_suffix(" UTC") {
        Some(stripped) => format!("{} +0000", stripped),
        None => value.to_string(),
    };

    if let Ok(dt) = DateTime::parse_from_rfc2822(&rfc2822) {
        return Some(dt.with_timezone(&Utc));
    }
    // Feeds regularly carry a weekday that doesn't match the date.
    if let Some((_, without_weekday)) = rfc2822.split_once(", ") {
        if let Ok(dt) = DateTime::parse_from_rfc2822(without_weekday) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }

    NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|naive| naive.and_utc())
}

/// A node of the parsed document. Only what feed extraction needs is kept:
/// qualified name, attributes, direct text content and child elements.
#[derive(Debug, Default)]
struct Element {
    name: String,
    attributes: Vec<(String, String)>,
    text: String,
    children: Vec<Element>,
}

impl Element {
    fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|child| child.name == name)
    }

    fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |child| child.name == name)
    }

    fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    fn text(&self) -> String {
        self.text.trim().to_string()
    }

    fn child_text(&self, name: &str) -> Option<String> {
        self.child(name).map(Element::text)
    }
}

fn read_tree(body: &[u8]) -> Result<Element, MalformedDocument> {
    let mut reader = Reader::from_reader(body);
    let mut buf = Vec::new();
    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        let event = reader.read_event_into(&mut buf).map_err(|e| {
            MalformedDocument::new(format!("{} at byte {}", e, reader.buffer_position()))
        })?;

        match event {
            Event::Start(start) => {
                if stack.is_empty() && root.is_some() {
                    return Err(MalformedDocument::new("multiple root elements"));
                }
                stack.push(open_element(&start, &reader)?);
            }
            Event::Empty(start) => {
                let element = open_element(&start, &reader)?;
                attach(&mut stack, &mut root, element)?;
            }
            Event::End(_) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| MalformedDocument::new("unexpected closing tag"))?;
                attach(&mut stack, &mut root, element)?;
            }
            Event::Text(text) => {
                let text = text
                    .unescape()
                    .map_err(|e| MalformedDocument::new(e.to_string()))?;
                append_text(&mut stack, &text)?;
            }
            Event::CData(cdata) => {
                let text = reader
                    .decoder()
                    .decode(&cdata)
                    .map_err(|e| MalformedDocument::new(e.to_string()))?;
                append_text(&mut stack, &text)?;
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if let Some(open) = stack.last() {
        return Err(MalformedDocument::new(format!(
            "document ended inside <{}>",
            open.name
        )));
    }

    root.ok_or_else(|| MalformedDocument::new("no root element"))
}

fn open_element(
    start: &BytesStart<'_>,
    reader: &Reader<&[u8]>,
) -> Result<Element, MalformedDocument> {
    let decoder = reader.decoder();
    let name = decoder
        .decode(start.name().as_ref())
        .map_err(|e| MalformedDocument::new(e.to_string()))?
        .into_owned();

    let mut attributes = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| MalformedDocument::new(e.to_string()))?;
        let key = decoder
            .decode(attr.key.as_ref())
            .map_err(|e| MalformedDocument::new(e.to_string()))?
            .into_owned();
        let value = attr
            .decode_and_unescape_value(decoder)
            .map_err(|e| MalformedDocument::new(e.to_string()))?
            .into_owned();
        attributes.push((key, value));
    }

    Ok(Element {
        name,
        attributes,
        ..Default::default()
    })
}

fn attach(
    stack: &mut [Element],
    root: &mut Option<Element>,
    element: Element,
) -> Result<(), MalformedDocument> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None if root.is_some() => return Err(MalformedDocument::new("multiple root elements")),
        None => *root = Some(element),
    }
    Ok(())
}

fn append_text(stack: &mut [Element], text: &str) -> Result<(), MalformedDocument> {
    match stack.last_mut() {
        Some(element) => element.text.push_str(text),
        None if text.trim().is_empty() => {}
        None => return Err(MalformedDocument::new("text outside the root element")),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn parse(xml: &str) -> ParsedDocument {
        parse_document(xml.as_bytes(), Some("application/rss+xml")).unwrap()
    }

    mod rss_tests {
        use super::*;

        #[test]
        fn test_parses_rss_items() {
            let doc = parse(
                r#"<?xml version="1.0" encoding="UTF-8"?>
                <rss version="2.0">
                  <channel>
                    <title>Test RSS Feed</title>
                    <item>
                      <title>Test Article 1</title>
                      <link>https://example.com/article1</link>
                      <description>Article 1 description</description>
                      <guid>https://example.com/article1</guid>
                      <pubDate>Mon, 02 Jan 2023 12:00:00 GMT</pubDate>
                    </item>
                    <item>
                      <title>Test Article 2</title>
                      <link>https://example.com/article2</link>
                      <description>Article 2 description</description>
                      <guid>article-2</guid>
                    </item>
                  </channel>
                </rss>"#,
            );

            assert_eq!(doc.dialect, Dialect::Rss);
            assert_eq!(doc.title.as_deref(), Some("Test RSS Feed"));
            assert_eq!(doc.articles.len(), 2);

            let first = &doc.articles[0];
            assert_eq!(first.title, "Test Article 1");
            assert_eq!(first.link, "https://example.com/article1");
            assert_eq!(first.description, "Article 1 description");
            assert_eq!(first.external_id, "https://example.com/article1");
            assert_eq!(
                first.published_at,
                Some(Utc.with_ymd_and_hms(2023, 1, 2, 12, 0, 0).unwrap())
            );

            assert_eq!(doc.articles[1].external_id, "article-2");
        }

        #[test]
        fn test_missing_pub_date_is_absent() {
            let doc = parse(
                r#"<rss><channel><item><title>No date</title><link>https://a.com</link></item></channel></rss>"#,
            );
            assert_eq!(doc.articles[0].published_at, None);
        }

        #[test]
        fn test_guid_falls_back_to_link() {
            let doc = parse(
                r#"<rss><channel>
                    <item><link>https://a.com/1</link></item>
                    <item><guid></guid><link>https://a.com/2</link></item>
                </channel></rss>"#,
            );
            assert_eq!(doc.articles[0].external_id, "https://a.com/1");
            assert_eq!(doc.articles[1].external_id, "https://a.com/2");
        }

        #[test]
        fn test_missing_fields_become_empty_strings() {
            let doc = parse(r#"<rss><channel><item><guid>x</guid></item></channel></rss>"#);
            let article = &doc.articles[0];
            assert_eq!(article.title, "");
            assert_eq!(article.description, "");
            assert_eq!(article.link, "");
            assert_eq!(article.external_id, "x");
        }

        #[test]
        fn test_cdata_description_is_kept_raw() {
            let doc = parse(
                r#"<rss><channel><item>
                    <guid>1</guid>
                    <description><![CDATA[<p>Fish &amp; Chips</p>]]></description>
                </item></channel></rss>"#,
            );
            assert_eq!(doc.articles[0].description, "<p>Fish &amp; Chips</p>");
        }

        #[test]
        fn test_xml_entities_are_unescaped_once() {
            let doc = parse(
                r#"<rss><channel><item><guid>1</guid><title>Tom &amp;amp; Jerry</title></item></channel></rss>"#,
            );
            assert_eq!(doc.articles[0].title, "Tom &amp; Jerry");
        }

        #[test]
        fn test_namespaced_link_is_not_the_item_link() {
            let doc = parse(
                r#"<rss xmlns:atom="http://www.w3.org/2005/Atom"><channel><item>
                    <atom:link href="https://other.example.com" rel="self"/>
                    <link>https://a.com/real</link>
                </item></channel></rss>"#,
            );
            assert_eq!(doc.articles[0].link, "https://a.com/real");
        }

        #[test]
        fn test_unparseable_pub_date_is_absent() {
            let doc = parse(
                r#"<rss><channel><item><guid>1</guid><pubDate>sometime soon</pubDate></item></channel></rss>"#,
            );
            assert_eq!(doc.articles[0].published_at, None);
        }
    }

    mod atom_tests {
        use super::*;

        #[test]
        fn test_parses_atom_entries() {
            let doc = parse(
                r#"<?xml version="1.0" encoding="UTF-8"?>
                <feed xmlns="http://www.w3.org/2005/Atom">
                  <title>Test Atom Feed</title>
                  <link href="https://example.com"/>
                  <entry>
                    <title>Test Atom Article 1</title>
                    <link href="https://example.com/atom1"/>
                    <id>urn:uuid:1</id>
                    <content>Atom Article 1 content</content>
                    <summary>ignored</summary>
                    <published>2023-01-01T12:00:00Z</published>
                  </entry>
                  <entry>
                    <title>Test Atom Article 2</title>
                    <link href="https://example.com/atom2"/>
                    <summary>Atom Article 2 summary</summary>
                    <updated>2023-01-02T12:00:00+02:00</updated>
                  </entry>
                </feed>"#,
            );

            assert_eq!(doc.dialect, Dialect::Atom);
            assert_eq!(doc.title.as_deref(), Some("Test Atom Feed"));
            assert_eq!(doc.articles.len(), 2);

            let first = &doc.articles[0];
            assert_eq!(first.external_id, "urn:uuid:1");
            assert_eq!(first.description, "Atom Article 1 content");
            assert_eq!(
                first.published_at,
                Some(Utc.with_ymd_and_hms(2023, 1, 1, 12, 0, 0).unwrap())
            );

            let second = &doc.articles[1];
            assert_eq!(second.external_id, "https://example.com/atom2");
            assert_eq!(second.description, "Atom Article 2 summary");
            assert_eq!(
                second.published_at,
                Some(Utc.with_ymd_and_hms(2023, 1, 2, 10, 0, 0).unwrap())
            );
        }

        #[test]
        fn test_link_without_rel_beats_enclosure() {
            let doc = parse(
                r#"<feed><entry>
                    <id>1</id>
                    <link rel="enclosure" href="https://cdn.example.com/a.mp3"/>
                    <link href="https://example.com/post"/>
                </entry></feed>"#,
            );
            assert_eq!(doc.articles[0].link, "https://example.com/post");
        }

        #[test]
        fn test_first_alternate_link_wins() {
            let doc = parse(
                r#"<feed><entry>
                    <id>1</id>
                    <link rel="replies" href="https://example.com/comments"/>
                    <link rel="alternate" href="https://example.com/one"/>
                    <link href="https://example.com/two"/>
                </entry></feed>"#,
            );
            assert_eq!(doc.articles[0].link, "https://example.com/one");
        }

        #[test]
        fn test_falls_back_to_first_link_of_any_kind() {
            let doc = parse(
                r#"<feed><entry>
                    <id>1</id>
                    <link rel="related" href="https://example.com/related"/>
                    <link rel="enclosure" href="https://example.com/file"/>
                </entry></feed>"#,
            );
            assert_eq!(doc.articles[0].link, "https://example.com/related");
        }

        #[test]
        fn test_entry_without_links_or_description() {
            let doc = parse(r#"<feed><entry><title>Bare</title></entry></feed>"#);
            let article = &doc.articles[0];
            assert_eq!(article.link, "");
            assert_eq!(article.description, "");
            assert_eq!(article.external_id, "");
            assert_eq!(article.published_at, None);
        }
    }

    mod encoding_tests {
        use super::*;

        #[test]
        fn test_latin1_declaration_is_honoured() {
            let body = b"<?xml version=\"1.0\" encoding=\"ISO-8859-1\"?>\
<rss><channel><title>Caf\xe9 News</title>\
<item><guid>1</guid><title>Caf\xe9</title>\
<description><![CDATA[Cr\xe8me <b>br\xfbl\xe9e</b>]]></description></item>\
</channel></rss>";

            let doc = parse_document(body, Some("application/rss+xml")).unwrap();

            assert_eq!(doc.title.as_deref(), Some("Caf\u{e9} News"));
            assert_eq!(doc.articles.len(), 1);
            assert_eq!(doc.articles[0].title, "Caf\u{e9}");
            assert_eq!(doc.articles[0].description, "Cr\u{e8}me <b>br\u{fb}l\u{e9}e</b>");
        }

        #[test]
        fn test_windows_1252_declaration_is_honoured() {
            let body = b"<?xml version=\"1.0\" encoding=\"windows-1252\"?>\
<rss><channel><item><guid>q</guid><title>\x93Quoted\x94</title></item></channel></rss>";

            let doc = parse_document(body, None).unwrap();

            assert_eq!(doc.articles[0].title, "\u{201c}Quoted\u{201d}");
        }

        #[test]
        fn test_utf8_bom_is_skipped() {
            let body = b"\xef\xbb\xbf<rss><channel><item><guid>1</guid><title>Na\xc3\xafve</title></item></channel></rss>";

            let doc = parse_document(body, None).unwrap();

            assert_eq!(doc.articles[0].title, "Na\u{ef}ve");
        }
    }

    mod malformed_tests {
        use super::*;

        #[test]
        fn test_plain_text_is_malformed() {
            let result = parse_document(b"This is not XML", Some("text/plain"));
            assert!(result.is_err());
        }

        #[test]
        fn test_empty_body_is_malformed() {
            assert!(parse_document(b"", None).is_err());
        }

        #[test]
        fn test_unclosed_root_is_malformed() {
            let result = parse_document(b"<rss><channel><item>", None);
            assert!(result.is_err());
        }

        #[test]
        fn test_mismatched_tags_are_malformed() {
            let result = parse_document(b"<rss><channel></item></rss>", None);
            assert!(result.is_err());
        }

        #[test]
        fn test_multiple_roots_are_malformed() {
            let result = parse_document(b"<rss></rss><rss></rss>", None);
            assert!(result.is_err());
        }

        #[test]
        fn test_well_formed_but_unrecognized_is_empty() {
            let doc = parse_document(b"<html><body><p>hello</p></body></html>", None).unwrap();
            assert_eq!(doc.dialect, Dialect::Unrecognized);
            assert!(doc.articles.is_empty());
        }

        #[test]
        fn test_channel_without_items_is_empty() {
            let doc = parse(r#"<rss><channel><title>Quiet Feed</title></channel></rss>"#);
            assert_eq!(doc.dialect, Dialect::Unrecognized);
            assert_eq!(doc.title.as_deref(), Some("Quiet Feed"));
            assert!(doc.articles.is_empty());
        }
    }

    mod timestamp_tests {
        use super::*;

        #[test]
        fn test_rfc2822_with_offset() {
            assert_eq!(
                parse_timestamp("Tue, 10 Jun 2003 04:00:00 -0500"),
                Some(Utc.with_ymd_and_hms(2003, 6, 10, 9, 0, 0).unwrap())
            );
        }

        #[test]
        fn test_rfc2822_with_utc_suffix() {
            assert_eq!(
                parse_timestamp("Mon, 09 Dec 2024 12:00:00 UTC"),
                Some(Utc.with_ymd_and_hms(2024, 12, 9, 12, 0, 0).unwrap())
            );
        }

        #[test]
        fn test_wrong_weekday_still_parses() {
            assert_eq!(
                parse_timestamp("Mon, 01 Jan 2023 12:00:00 GMT"),
                Some(Utc.with_ymd_and_hms(2023, 1, 1, 12, 0, 0).unwrap())
            );
        }

        #[test]
        fn test_naive_sql_style() {
            assert_eq!(
                parse_timestamp("2024-03-01 08:30:00"),
                Some(Utc.with_ymd_and_hms(2024, 3, 1, 8, 30, 0).unwrap())
            );
        }

        #[test]
        fn test_blank_is_none() {
            assert_eq!(parse_timestamp("   "), None);
        }
    }

    #[test]
    fn test_xml_content_type_detection() {
        assert!(is_xml_content_type("application/rss+xml; charset=utf-8"));
        assert!(is_xml_content_type("text/xml"));
        assert!(!is_xml_content_type("text/html"));
    }
}
