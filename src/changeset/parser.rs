// ABOUTME: Streaming XML parser that yields one ChangesetRecord per changeset element
// ABOUTME: Pull-based over quick-xml events; memory is bounded by a single changeset

use std::io::BufRead;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;

use super::model::{Attributes, ChangesetRecord, Comment};

/// Structural or value errors while reading changeset XML.
///
/// All of these are fatal for the stream: once one is returned the parser
/// yields nothing further.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed XML at byte {position}: {source}")]
    Xml {
        position: u64,
        #[source]
        source: quick_xml::Error,
    },
    #[error("malformed attribute at byte {position}: {source}")]
    Attribute {
        position: u64,
        #[source]
        source: quick_xml::events::attributes::AttrError,
    },
    #[error("<{element}> at byte {position} is missing required attribute '{attribute}'")]
    MissingAttribute {
        element: &'static str,
        attribute: &'static str,
        position: u64,
    },
    #[error("<{element}> at byte {position} has invalid {attribute}=\"{value}\"")]
    InvalidAttribute {
        element: &'static str,
        attribute: &'static str,
        value: String,
        position: u64,
    },
    #[error("<changeset> nested inside another changeset at byte {position}")]
    NestedChangeset { position: u64 },
    #[error("unexpected text outside any element at byte {position}")]
    StrayText { position: u64 },
    #[error("input ended with {open_elements} unclosed element(s)")]
    UnexpectedEof { open_elements: usize },
}

/// Lazy, forward-only sequence of changesets read from an XML stream.
///
/// Only the changeset currently being assembled is held in memory; as soon as
/// its closing tag is seen it is handed to the caller and nothing about it is
/// retained. The parser cannot be rewound: to re-read, open the input again.
pub struct RecordParser<R: BufRead> {
    reader: Reader<R>,
    buf: Vec<u8>,
    depth: usize,
    current: Option<ChangesetRecord>,
    comment: Option<Comment>,
    in_discussion: bool,
    text: Option<String>,
    finished: bool,
    parsed: u64,
}

impl<R: BufRead> RecordParser<R> {
    pub fn new(input: R) -> Self {
        let mut reader = Reader::from_reader(input);
        reader.check_end_names(true);
        Self {
            reader,
            buf: Vec::with_capacity(4096),
            depth: 0,
            current: None,
            comment: None,
            in_discussion: false,
            text: None,
            finished: false,
            parsed: 0,
        }
    }

    /// Number of changesets emitted so far.
    pub fn parsed(&self) -> u64 {
        self.parsed
    }

    fn byte_position(&self) -> u64 {
        self.reader.buffer_position() as u64
    }

    /// Advance the reader until one changeset is complete or input ends.
    fn next_record(&mut self) -> Result<Option<ChangesetRecord>, ParseError> {
        loop {
            self.buf.clear();
            let result = self
                .reader
                .read_event_into(&mut self.buf)
                .map(Event::into_owned);
            let event = match result {
                Ok(event) => event,
                Err(source) => {
                    return Err(ParseError::Xml {
                        position: self.byte_position(),
                        source,
                    })
                }
            };

            match event {
                Event::Start(start) => {
                    self.depth += 1;
                    self.open_element(&start, false)?;
                }
                Event::Empty(start) => {
                    if let Some(done) = self.open_element(&start, true)? {
                        return Ok(Some(done));
                    }
                }
                Event::End(end) => {
                    self.depth = self.depth.saturating_sub(1);
                    if let Some(done) = self.close_element(end.name().as_ref()) {
                        return Ok(Some(done));
                    }
                }
                Event::Text(text) => {
                    let position = self.byte_position();
                    let value = text.unescape().map_err(|source| ParseError::Xml { position, source })?;
                    self.push_text(&value)?;
                }
                Event::CData(data) => {
                    let position = self.byte_position();
                    let value = self
                        .reader
                        .decoder()
                        .decode(&data)
                        .map_err(|source| ParseError::Xml { position, source })?
                        .into_owned();
                    self.push_text(&value)?;
                }
                Event::Eof => {
                    if self.depth > 0 || self.current.is_some() {
                        return Err(ParseError::UnexpectedEof {
                            open_elements: self.depth.max(1),
                        });
                    }
                    return Ok(None);
                }
                // Declarations, comments, processing instructions, doctype
                _ => {}
            }
        }
    }

    /// Handle an opening (or self-closing) tag.
    ///
    /// Returns a finished record when a self-closing `<changeset/>` is seen.
    fn open_element(
        &mut self,
        start: &BytesStart<'_>,
        self_closing: bool,
    ) -> Result<Option<ChangesetRecord>, ParseError> {
        let position = self.byte_position();
        match start.name().as_ref() {
            b"changeset" => {
                if self.current.is_some() {
                    return Err(ParseError::NestedChangeset { position });
                }
                let attrs = read_attributes(start, "changeset", position)?;
                let record = ChangesetRecord::from_attributes(attrs)?;
                if self_closing {
                    self.parsed += 1;
                    return Ok(Some(record));
                }
                self.current = Some(record);
            }
            b"tag" if self.comment.is_none() => {
                if let Some(record) = self.current.as_mut() {
                    let mut attrs = read_attributes(start, "tag", position)?;
                    let key = attrs.require("k")?;
                    let value = attrs.require("v")?;
                    // Repeated keys should not happen; the last one wins.
                    record.tags.insert(key, value);
                }
            }
            b"discussion" if self.current.is_some() => {
                self.in_discussion = !self_closing;
            }
            b"comment" if self.in_discussion => {
                let attrs = read_attributes(start, "comment", position)?;
                let comment = Comment::from_attributes(attrs)?;
                if self_closing {
                    if let Some(record) = self.current.as_mut() {
                        record.comments.push(comment);
                    }
                } else {
                    self.comment = Some(comment);
                }
            }
            b"text" if self.comment.is_some() && !self_closing => {
                self.text = Some(String::new());
            }
            _ => {}
        }
        Ok(None)
    }

    fn close_element(&mut self, name: &[u8]) -> Option<ChangesetRecord> {
        match name {
            b"changeset" => {
                self.in_discussion = false;
                self.comment = None;
                self.text = None;
                let record = self.current.take();
                if record.is_some() {
                    self.parsed += 1;
                }
                record
            }
            b"discussion" => {
                self.in_discussion = false;
                None
            }
            b"comment" if self.in_discussion => {
                if let (Some(comment), Some(record)) = (self.comment.take(), self.current.as_mut()) {
                    record.comments.push(comment);
                }
                None
            }
            b"text" => {
                if let (Some(text), Some(comment)) = (self.text.take(), self.comment.as_mut()) {
                    comment.text = Some(text);
                }
                None
            }
            _ => None,
        }
    }

    fn push_text(&mut self, value: &str) -> Result<(), ParseError> {
        if let Some(text) = self.text.as_mut() {
            text.push_str(value);
        } else if self.depth == 0 && !value.trim().is_empty() {
            return Err(ParseError::StrayText {
                position: self.byte_position(),
            });
        }
        Ok(())
    }
}

impl<R: BufRead> Iterator for RecordParser<R> {
    type Item = Result<ChangesetRecord, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.next_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

fn read_attributes(
    start: &BytesStart<'_>,
    element: &'static str,
    position: u64,
) -> Result<Attributes, ParseError> {
    let mut attrs = Attributes::new(element, position);
    for attr in start.attributes() {
        let attr = attr.map_err(|source| ParseError::Attribute { position, source })?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|source| ParseError::Xml { position, source })?
            .into_owned();
        attrs.insert(key, value);
    }
    Ok(attrs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(xml: &str) -> Vec<Result<ChangesetRecord, ParseError>> {
        RecordParser::new(xml.as_bytes()).collect()
    }

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<osm version="0.6" generator="planet-dump-ng 1.1.6">
 <bound box="-90,-180,90,180" origin="http://www.openstreetmap.org/api/0.6"/>
 <changeset id="1" created_at="2005-04-09T19:54:13Z" closed_at="2005-04-09T20:54:39Z" open="false" user="Steve" uid="1" min_lat="51.5288506" min_lon="-0.1465242" max_lat="51.5288620" max_lon="-0.1464925" num_changes="2" comments_count="2">
  <tag k="created_by" v="JOSM"/>
  <tag k="comment" v="first &amp; foremost"/>
  <discussion>
   <comment uid="10" user="alice" date="2015-01-01T00:00:00Z">
    <text>looks good</text>
   </comment>
   <comment uid="11" user="bob" date="2015-01-02T00:00:00Z">
    <text>agreed &lt;3</text>
   </comment>
  </discussion>
 </changeset>
 <changeset id="2" created_at="2005-04-10T10:00:00Z" open="true" num_changes="0"/>
 <changeset id="3" created_at="2005-04-11T10:00:00Z" user="carol" uid="3">
  <tag k="source" v="survey"/>
 </changeset>
</osm>
"#;

    #[test]
    fn test_parses_every_changeset_in_order() {
        let records: Vec<_> = parse_all(SAMPLE).into_iter().map(Result::unwrap).collect();
        let ids: Vec<i64> = records.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_tags_and_comments_are_attached() {
        let records: Vec<_> = parse_all(SAMPLE).into_iter().map(Result::unwrap).collect();
        let first = &records[0];

        assert_eq!(first.tags.len(), 2);
        assert_eq!(first.tags["comment"], "first & foremost");
        assert_eq!(first.comments.len(), 2);
        assert_eq!(first.comments[0].user_name.as_deref(), Some("alice"));
        assert_eq!(first.comments[0].text.as_deref(), Some("looks good"));
        assert_eq!(first.comments[1].user_id, Some(11));
        assert_eq!(first.comments[1].text.as_deref(), Some("agreed <3"));

        // Comment tags never leak into the next record
        assert!(records[1].tags.is_empty());
        assert!(records[1].comments.is_empty());
        assert_eq!(records[2].tags["source"], "survey");
    }

    #[test]
    fn test_self_closing_changeset() {
        let records: Vec<_> = parse_all(SAMPLE).into_iter().map(Result::unwrap).collect();
        let second = &records[1];
        assert_eq!(second.open, Some(true));
        assert_eq!(second.num_changes, Some(0));
        assert!(second.bbox.is_none());
        assert!(second.user_id.is_none());
    }

    #[test]
    fn test_repeated_tag_key_last_wins() {
        let xml = r#"<osm><changeset id="5" created_at="2010-01-01T00:00:00Z">
            <tag k="a" v="1"/><tag k="a" v="2"/>
        </changeset></osm>"#;
        let records = parse_all(xml);
        assert_eq!(records.len(), 1);
        let record = records.into_iter().next().unwrap().unwrap();
        assert_eq!(record.tags["a"], "2");
    }

    #[test]
    fn test_legacy_format_without_open_attribute() {
        let xml = r#"<osm><changeset id="9" created_at="2008-01-01T00:00:00Z" closed_at="2008-01-01T01:00:00Z"/></osm>"#;
        let record = parse_all(xml).into_iter().next().unwrap().unwrap();
        assert!(record.open.is_none());
        assert!(record.closed_at.is_some());
    }

    #[test]
    fn test_unclosed_document_is_fatal() {
        let xml = r#"<osm><changeset id="1" created_at="2010-01-01T00:00:00Z"><tag k="a" v="b"/>"#;
        let results = parse_all(xml);
        assert_eq!(results.len(), 1);
        assert!(matches!(
            results[0],
            Err(ParseError::UnexpectedEof { .. })
        ));
    }

    #[test]
    fn test_mismatched_tags_are_fatal() {
        let xml = r#"<osm><changeset id="1" created_at="2010-01-01T00:00:00Z"></osm>"#;
        let results = parse_all(xml);
        assert!(matches!(results.last(), Some(Err(ParseError::Xml { .. }))));
    }

    #[test]
    fn test_parser_stops_after_first_error() {
        let xml = r#"<osm>
            <changeset id="1" created_at="2010-01-01T00:00:00Z"/>
            <changeset created_at="2010-01-01T00:00:00Z"/>
            <changeset id="3" created_at="2010-01-01T00:00:00Z"/>
        </osm>"#;
        let results = parse_all(xml);
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(matches!(
            results[1],
            Err(ParseError::MissingAttribute {
                attribute: "id",
                ..
            })
        ));
    }

    #[test]
    fn test_garbage_input_is_fatal() {
        let results = parse_all("this is not xml at all");
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(ParseError::StrayText { .. })));
    }

    #[test]
    fn test_empty_document_yields_nothing() {
        assert!(parse_all(r#"<?xml version="1.0"?><osm></osm>"#).is_empty());
    }

    #[test]
    fn test_parsed_counter() {
        let mut parser = RecordParser::new(SAMPLE.as_bytes());
        while let Some(result) = parser.next() {
            result.unwrap();
        }
        assert_eq!(parser.parsed(), 3);
    }

    #[test]
    fn test_comment_text_keeps_surrounding_whitespace() {
        let xml = "<osm>\n <changeset id=\"1\" created_at=\"2015-01-01T00:00:00Z\">\n  <discussion>\n   <comment uid=\"10\" user=\"alice\">\n    <text>\n  indented line\n  second line  \n</text>\n   </comment>\n  </discussion>\n </changeset>\n</osm>\n";
        let record = parse_all(xml).into_iter().next().unwrap().unwrap();
        assert_eq!(
            record.comments[0].text.as_deref(),
            Some("\n  indented line\n  second line  \n")
        );
    }

    #[test]
    fn test_cdata_comment_text() {
        let xml = r#"<osm><changeset id="1" created_at="2015-01-01T00:00:00Z"><discussion><comment><text><![CDATA[a < b & c]]></text></comment></discussion></changeset></osm>"#;
        let record = parse_all(xml).into_iter().next().unwrap().unwrap();
        assert_eq!(record.comments[0].text.as_deref(), Some("a < b & c"));
    }

    #[test]
    fn test_invalid_utf8_in_cdata_is_fatal() {
        let mut xml = br#"<osm><changeset id="1" created_at="2015-01-01T00:00:00Z"><discussion><comment><text><![CDATA["#.to_vec();
        xml.push(0xff);
        xml.extend_from_slice(b"]]></text></comment></discussion></changeset></osm>");

        let results: Vec<_> = RecordParser::new(&xml[..]).collect();
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(ParseError::Xml { .. })));
    }
}
