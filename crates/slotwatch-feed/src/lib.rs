//! RSS feed synthesis and bounded history merging for slotwatch.
//!
//! Prior entries are carried forward as the raw `<item>` blocks they were
//! written as. A small tokenizer splits a stored document into those blocks
//! so truncation and repair operate on whole entries.

use chrono::{DateTime, Utc};
use slotwatch_core::{Record, RecordSet};

pub const CRATE_NAME: &str = "slotwatch-feed";

pub const DEFAULT_MAX_ENTRIES: usize = 10;
pub const DEFAULT_TTL_MINUTES: u32 = 60;

const RFC822_FORMAT: &str = "%a, %d %b %Y %H:%M:%S +0000";
const GUID_FORMAT: &str = "%Y%m%d%H%M%S";

const CDATA_OPEN: &str = "<![CDATA[";
const CDATA_CLOSE: &str = "]]>";
const COMMENT_OPEN: &str = "<!--";
const COMMENT_CLOSE: &str = "-->";

/// Static envelope fields of the published channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub title: String,
    pub description: String,
    pub link: String,
    pub ttl_minutes: u32,
}

/// One announcement of newly available slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationEntry {
    pub title: String,
    pub body_html: String,
    pub link: String,
    pub guid: String,
    pub published_at: DateTime<Utc>,
    pub slot_count: usize,
}

impl NotificationEntry {
    pub fn render(&self) -> String {
        format!(
            "<item>\n  <title>{}</title>\n  <description>{}</description>\n  <link>{}</link>\n  <guid isPermaLink=\"false\">{}</guid>\n  <pubDate>{}</pubDate>\n </item>",
            escape_xml(&self.title),
            cdata(&self.body_html),
            escape_xml(&self.link),
            escape_xml(&self.guid),
            rfc822(self.published_at),
        )
    }

    pub fn to_block(&self) -> EntryBlock {
        EntryBlock {
            raw: self.render(),
            repaired: false,
        }
    }
}

/// Build the entry announcing `new`, or `None` when nothing is new.
///
/// Slots are listed in lexicographic order; the guid is `now` at second
/// resolution.
pub fn synthesize_entry(
    new: &RecordSet,
    source_link: &str,
    now: DateTime<Utc>,
) -> Option<NotificationEntry> {
    if new.is_empty() {
        return None;
    }

    let mut slots: Vec<&str> = new.iter().map(Record::as_str).collect();
    slots.sort_unstable();
    let items = slots
        .iter()
        .map(|slot| format!("<li>{}</li>", escape_xml(slot)))
        .collect::<String>();
    let body_html = format!(
        "<h3>New Dates Available:</h3><ul>{items}</ul> <br/> <a href=\"{}\">Book Now</a>",
        escape_xml(source_link)
    );

    Some(NotificationEntry {
        title: entry_title(slots.len()),
        body_html,
        link: source_link.to_string(),
        guid: now.format(GUID_FORMAT).to_string(),
        published_at: now,
        slot_count: slots.len(),
    })
}

fn entry_title(count: usize) -> String {
    if count == 1 {
        "1 New Slot Found!".to_string()
    } else {
        format!("{count} New Slots Found!")
    }
}

/// A rendered `<item>` block, as stored in a feed document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryBlock {
    raw: String,
    repaired: bool,
}

impl EntryBlock {
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// True when the stored block was unterminated and had to be closed.
    pub fn is_repaired(&self) -> bool {
        self.repaired
    }

    pub fn title(&self) -> Option<String> {
        element_text(&self.raw, "title")
    }

    pub fn guid(&self) -> Option<String> {
        element_text(&self.raw, "guid")
    }

    pub fn pub_date(&self) -> Option<String> {
        element_text(&self.raw, "pubDate")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedEntries {
    pub entries: Vec<EntryBlock>,
    pub repairs: usize,
    /// The text around the entries closes `</channel>` and `</rss>` with
    /// every other element balanced.
    pub envelope_intact: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind {
    ItemOpen,
    ItemClose,
    ChannelEnd,
    RssEnd,
}

#[derive(Debug, Clone, Copy)]
struct Token {
    kind: TokenKind,
    start: usize,
    end: usize,
}

/// Yields item and channel boundary tags, stepping over CDATA and comments.
struct Tokenizer<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Tokenizer<'a> {
    fn new(text: &'a str) -> Self {
        Self { text, pos: 0 }
    }
}

impl Iterator for Tokenizer<'_> {
    type Item = Token;

    fn next(&mut self) -> Option<Token> {
        loop {
            let start = self.pos + self.text[self.pos..].find('<')?;
            let rest = &self.text[start..];

            if rest.starts_with(CDATA_OPEN) {
                self.pos = skip_past(self.text, start + CDATA_OPEN.len(), CDATA_CLOSE);
                continue;
            }
            if rest.starts_with(COMMENT_OPEN) {
                self.pos = skip_past(self.text, start + COMMENT_OPEN.len(), COMMENT_CLOSE);
                continue;
            }

            let kind = if is_tag(rest, "<item") {
                TokenKind::ItemOpen
            } else if is_tag(rest, "</item") {
                TokenKind::ItemClose
            } else if is_tag(rest, "</channel") {
                TokenKind::ChannelEnd
            } else if is_tag(rest, "</rss") {
                TokenKind::RssEnd
            } else {
                self.pos = start + 1;
                continue;
            };

            let end = rest.find('>').map_or(self.text.len(), |gt| start + gt + 1);
            self.pos = end;
            // `<item/>` carries nothing worth keeping.
            if kind == TokenKind::ItemOpen && self.text[start..end].ends_with("/>") {
                continue;
            }
            return Some(Token { kind, start, end });
        }
    }
}

fn skip_past(text: &str, from: usize, marker: &str) -> usize {
    text[from..]
        .find(marker)
        .map_or(text.len(), |i| from + i + marker.len())
}

fn is_tag(rest: &str, name: &str) -> bool {
    rest.strip_prefix(name)
        .and_then(|after| after.chars().next())
        .is_some_and(|c| c == '>' || c == '/' || c.is_whitespace())
}

/// Split a stored feed document into its ordered entry blocks.
///
/// Every block is rebalanced: closers with no open element are dropped and
/// elements left open are closed where their parent ends. An item still open
/// when the next item starts, when the channel ends, or at end of input is
/// closed in place. Each altered block counts as one repair. Closers with no
/// open item are ignored.
pub fn parse_entries(document: &str) -> ParsedEntries {
    let mut parsed = ParsedEntries::default();
    let mut open: Option<usize> = None;
    let mut outside = String::new();
    let mut cursor = 0;
    let (mut channel_closed, mut rss_closed) = (false, false);

    for token in Tokenizer::new(document) {
        match token.kind {
            TokenKind::ItemOpen => {
                if let Some(start) = open.take() {
                    push_block(&mut parsed, &document[start..token.start], true);
                } else {
                    outside.push_str(&document[cursor..token.start]);
                }
                open = Some(token.start);
            }
            TokenKind::ItemClose => {
                if let Some(start) = open.take() {
                    push_block(&mut parsed, &document[start..token.end], false);
                    cursor = token.end;
                }
            }
            TokenKind::ChannelEnd | TokenKind::RssEnd => {
                if let Some(start) = open.take() {
                    push_block(&mut parsed, &document[start..token.start], true);
                    cursor = token.start;
                }
                channel_closed |= token.kind == TokenKind::ChannelEnd;
                rss_closed |= token.kind == TokenKind::RssEnd;
            }
        }
    }
    match open {
        Some(start) => push_block(&mut parsed, &document[start..], true),
        None => outside.push_str(&document[cursor..]),
    }

    let (_, envelope_altered) = balance_fragment(&outside);
    parsed.envelope_intact = channel_closed && rss_closed && !envelope_altered;
    parsed
}

fn push_block(parsed: &mut ParsedEntries, fragment: &str, unterminated: bool) {
    let (raw, altered) = balance_fragment(fragment);
    let repaired = unterminated || altered;
    if repaired {
        parsed.repairs += 1;
    }
    if raw.is_empty() {
        return;
    }
    parsed.entries.push(EntryBlock { raw, repaired });
}

fn push_close(out: &mut String, name: &str) {
    out.push_str("</");
    out.push_str(name);
    out.push('>');
}

/// Rebuild `fragment` with every element properly nested.
///
/// Returns the balanced text and whether anything had to change. Balanced
/// input comes back byte-for-byte.
fn balance_fragment(fragment: &str) -> (String, bool) {
    let text = fragment.trim_end();
    let mut out = String::with_capacity(text.len() + 16);
    let mut stack: Vec<&str> = Vec::new();
    let mut altered = false;
    let mut pos = 0;

    loop {
        let Some(rel) = text[pos..].find('<') else {
            out.push_str(&text[pos..]);
            break;
        };
        let at = pos + rel;
        out.push_str(&text[pos..at]);
        let rest = &text[at..];

        let opaque = [(CDATA_OPEN, CDATA_CLOSE), (COMMENT_OPEN, COMMENT_CLOSE)]
            .into_iter()
            .find(|(opener, _)| rest.starts_with(*opener));
        if let Some((opener, closer)) = opaque {
            match rest[opener.len()..].find(closer) {
                Some(i) => {
                    let end = at + opener.len() + i + closer.len();
                    out.push_str(&text[at..end]);
                    pos = end;
                    continue;
                }
                None => {
                    out.push_str(rest);
                    out.push_str(closer);
                    altered = true;
                    break;
                }
            }
        }

        let Some(gt) = rest.find('>') else {
            // Partial tag at the end of a truncated write.
            out.truncate(out.trim_end().len());
            altered = true;
            break;
        };
        let end = at + gt + 1;
        let tag = &rest[1..gt];
        pos = end;

        if tag.starts_with('?') || tag.starts_with('!') || tag.ends_with('/') {
            out.push_str(&text[at..end]);
            continue;
        }
        if let Some(name) = tag.strip_prefix('/') {
            let name = name.trim();
            match stack.iter().rposition(|open| *open == name) {
                Some(idx) => {
                    while stack.len() > idx + 1 {
                        if let Some(inner) = stack.pop() {
                            push_close(&mut out, inner);
                        }
                        altered = true;
                    }
                    stack.truncate(idx);
                    out.push_str(&text[at..end]);
                }
                None => altered = true,
            }
            continue;
        }
        if let Some(name) = tag.split_whitespace().next() {
            stack.push(name);
        }
        out.push_str(&text[at..end]);
    }

    altered |= !stack.is_empty();
    while let Some(name) = stack.pop() {
        push_close(&mut out, name);
    }
    (out, altered)
}

fn element_text(raw: &str, name: &str) -> Option<String> {
    let open = format!("<{name}");
    let close = format!("</{name}>");
    let mut search = 0;
    while let Some(rel) = raw[search..].find(&open) {
        let at = search + rel;
        let rest = &raw[at..];
        if is_tag(rest, &open) {
            let body_start = at + rest.find('>')? + 1;
            let body_end = body_start + raw[body_start..].find(&close)?;
            let text = raw[body_start..body_end].trim();
            let text = text
                .strip_prefix(CDATA_OPEN)
                .and_then(|t| t.strip_suffix(CDATA_CLOSE))
                .unwrap_or(text);
            return Some(unescape_xml(text));
        }
        search = at + open.len();
    }
    None
}

/// Result of merging a new entry into the stored history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedFeed {
    pub document: String,
    pub entry_count: usize,
    pub repairs: usize,
    /// The stored document existed but its channel envelope was broken.
    pub envelope_repaired: bool,
    /// Entries dropped by the `max_entries` bound.
    pub evicted: usize,
}

/// Produce the full document to persist: the new entry (if any) first, then
/// prior entries in their stored order, bounded to `max_entries`, inside a
/// freshly stamped envelope.
pub fn merge(
    existing: Option<&str>,
    new_entry: Option<&NotificationEntry>,
    channel: &ChannelInfo,
    max_entries: usize,
    now: DateTime<Utc>,
) -> MergedFeed {
    let prior = existing.map(parse_entries).unwrap_or_default();

    let mut entries = Vec::with_capacity(prior.entries.len() + 1);
    if let Some(entry) = new_entry {
        entries.push(entry.to_block());
    }
    entries.extend(prior.entries);
    let evicted = entries.len().saturating_sub(max_entries);
    entries.truncate(max_entries);

    MergedFeed {
        document: render_document(channel, &entries, now),
        entry_count: entries.len(),
        repairs: prior.repairs,
        envelope_repaired: existing.is_some() && !prior.envelope_intact,
        evicted,
    }
}

pub fn render_document(channel: &ChannelInfo, entries: &[EntryBlock], now: DateTime<Utc>) -> String {
    let stamp = rfc822(now);
    let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\" ?>\n<rss version=\"2.0\">\n<channel>\n");
    out.push_str(&format!(" <title>{}</title>\n", escape_xml(&channel.title)));
    out.push_str(&format!(
        " <description>{}</description>\n",
        escape_xml(&channel.description)
    ));
    out.push_str(&format!(" <link>{}</link>\n", escape_xml(&channel.link)));
    out.push_str(&format!(" <lastBuildDate>{stamp}</lastBuildDate>\n"));
    out.push_str(&format!(" <pubDate>{stamp}</pubDate>\n"));
    out.push_str(&format!(" <ttl>{}</ttl>\n", channel.ttl_minutes));
    for entry in entries {
        out.push(' ');
        out.push_str(entry.as_str());
        out.push('\n');
    }
    out.push_str("</channel>\n</rss>\n");
    out
}

pub fn rfc822(ts: DateTime<Utc>) -> String {
    ts.format(RFC822_FORMAT).to_string()
}

pub fn escape_xml(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(ch),
        }
    }
    out
}

fn unescape_xml(input: &str) -> String {
    input
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Wrap text in a CDATA section, splitting any embedded terminator.
fn cdata(input: &str) -> String {
    format!(
        "{CDATA_OPEN}{}{CDATA_CLOSE}",
        input.replace(CDATA_CLOSE, "]]]]><![CDATA[>")
    )
}
