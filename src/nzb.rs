//! NZB manifest parsing and ingestion
//!
//! An NZB is an XML manifest enumerating the articles of each source file.
//! This module parses the XML into the queue's entity tree and performs the
//! ingestion-time duplicate pass: when two files in the same manifest carry
//! the same parsed filename, the biggest wins (earliest index on a tie).

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::OnceLock;

use quick_xml::Reader;
use quick_xml::events::Event as XmlEvent;
use regex::Regex;

use crate::error::{Error, Result};
use crate::queue::{ArticleInfo, DownloadQueue, FileInfo, NzbInfo};
use crate::types::NzbKind;

/// One parsed `<file>` element
#[derive(Clone, Debug)]
pub struct ParsedNzbFile {
    /// Subject line
    pub subject: String,
    /// Posting time (unix seconds)
    pub date: i64,
    /// Newsgroups
    pub groups: Vec<String>,
    /// Segments: (part number, declared bytes, message id without brackets)
    pub segments: Vec<(u32, u64, String)>,
}

/// A parsed manifest, pre-ingestion
#[derive(Clone, Debug, Default)]
pub struct ParsedNzb {
    /// File list in manifest order
    pub files: Vec<ParsedNzbFile>,
    /// `<meta type="password">` value, if present
    pub password: Option<String>,
    /// All other `<meta>` entries
    pub meta: Vec<(String, String)>,
}

/// Parse NZB XML into its file/segment structure
pub fn parse_nzb(content: &[u8]) -> Result<ParsedNzb> {
    let mut reader = Reader::from_reader(content);
    reader.config_mut().trim_text(true);

    let mut parsed = ParsedNzb::default();
    let mut current_file: Option<ParsedNzbFile> = None;
    let mut current_segment: Option<(u32, u64)> = None;
    let mut in_group = false;
    let mut meta_type: Option<String> = None;
    let mut buf = Vec::new();

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| Error::InvalidNzb(format!("XML error at byte {}: {e}", reader.buffer_position())))?;
        match event {
            XmlEvent::Start(ref e) => match e.local_name().as_ref() {
                b"file" => {
                    let mut file = ParsedNzbFile {
                        subject: String::new(),
                        date: 0,
                        groups: Vec::new(),
                        segments: Vec::new(),
                    };
                    for attr in e.attributes().flatten() {
                        let value = String::from_utf8_lossy(&attr.value).into_owned();
                        match attr.key.local_name().as_ref() {
                            b"subject" => file.subject = value,
                            b"date" => file.date = value.parse().unwrap_or(0),
                            _ => {}
                        }
                    }
                    current_file = Some(file);
                }
                b"segment" => {
                    let mut number = 0u32;
                    let mut bytes = 0u64;
                    for attr in e.attributes().flatten() {
                        let value = String::from_utf8_lossy(&attr.value).into_owned();
                        match attr.key.local_name().as_ref() {
                            b"number" => number = value.parse().unwrap_or(0),
                            b"bytes" => bytes = value.parse().unwrap_or(0),
                            _ => {}
                        }
                    }
                    current_segment = Some((number, bytes));
                }
                b"group" => in_group = true,
                b"meta" => {
                    meta_type = e.attributes().flatten().find_map(|attr| {
                        (attr.key.local_name().as_ref() == b"type")
                            .then(|| String::from_utf8_lossy(&attr.value).into_owned())
                    });
                }
                _ => {}
            },
            XmlEvent::Text(ref t) => {
                let text = t.unescape().unwrap_or_default().into_owned();
                if let Some((number, bytes)) = current_segment
                    && let Some(file) = current_file.as_mut()
                {
                    file.segments.push((number, bytes, text));
                    current_segment = None;
                } else if in_group && let Some(file) = current_file.as_mut() {
                    file.groups.push(text);
                } else if let Some(kind) = meta_type.take() {
                    if kind.eq_ignore_ascii_case("password") {
                        parsed.password = Some(text);
                    } else {
                        parsed.meta.push((kind, text));
                    }
                }
            }
            XmlEvent::End(ref e) => match e.local_name().as_ref() {
                b"file" => {
                    if let Some(mut file) = current_file.take() {
                        file.segments.sort_by_key(|(number, _, _)| *number);
                        parsed.files.push(file);
                    }
                }
                b"group" => in_group = false,
                b"segment" => current_segment = None,
                _ => {}
            },
            XmlEvent::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if parsed.files.is_empty() {
        return Err(Error::InvalidNzb("manifest contains no files".into()));
    }
    for (idx, file) in parsed.files.iter().enumerate() {
        if file.segments.is_empty() {
            return Err(Error::InvalidNzb(format!(
                "file {idx} ({}) has no segments",
                file.subject
            )));
        }
    }
    Ok(parsed)
}

/// Extract a filename from an NZB subject line.
///
/// Usenet subjects typically quote the filename:
/// `Some.Release [01/50] - "Some.Release.part01.rar" yEnc (1/100)`.
/// Falls back to a hash-derived placeholder so every file gets a unique,
/// stable name.
pub fn filename_from_subject(subject: &str) -> String {
    static QUOTED: OnceLock<Regex> = OnceLock::new();
    let regex = QUOTED.get_or_init(|| {
        Regex::new(r#""([^"]+)""#).unwrap_or_else(|e| panic!("invalid filename regex: {e}"))
    });
    if let Some(captures) = regex.captures(subject) {
        let name = captures[1].trim();
        if !name.is_empty() {
            return name.to_string();
        }
    }
    let mut hasher = DefaultHasher::new();
    subject.hash(&mut hasher);
    format!("file_{:x}", hasher.finish())
}

/// Build a ready-to-queue [`NzbInfo`] from manifest bytes.
///
/// Allocates ids from `queue`, computes the duplicate-detection hashes, and
/// applies the ingestion dedup rule.
pub fn build_nzb_info(
    queue: &mut DownloadQueue,
    content: &[u8],
    nzb_filename: &str,
    dest_dir: PathBuf,
) -> Result<NzbInfo> {
    let parsed = parse_nzb(content)?;

    let id = queue.next_nzb_id();
    let mut nzb = NzbInfo::new(id, NzbKind::Nzb, nzb_filename.to_string(), dest_dir);
    nzb.content_hash = format!("{:x}", md5::compute(content));
    nzb.filtered_content_hash = filtered_content_hash(&parsed);
    if let Some(password) = &parsed.password {
        nzb.set_parameter("*Password", password);
    }

    for file in &parsed.files {
        let file_id = queue.next_file_id();
        let filename = filename_from_subject(&file.subject);
        let articles = file
            .segments
            .iter()
            .map(|(number, bytes, msgid)| {
                let message_id = if msgid.starts_with('<') {
                    msgid.clone()
                } else {
                    format!("<{msgid}>")
                };
                ArticleInfo::new(*number, message_id, *bytes)
            })
            .collect();
        nzb.files.push(FileInfo::new(
            file_id,
            id,
            file.subject.clone(),
            filename,
            file.groups.clone(),
            file.date,
            articles,
        ));
    }

    dedupe_files(&mut nzb);
    nzb.recompute_aggregates();
    Ok(nzb)
}

/// MD5 over the stable parts of the manifest (subjects and message ids),
/// ignoring dates and meta so re-posts hash identically.
fn filtered_content_hash(parsed: &ParsedNzb) -> String {
    let mut context = md5::Context::new();
    for file in &parsed.files {
        context.consume(file.subject.as_bytes());
        for (_, _, msgid) in &file.segments {
            context.consume(msgid.as_bytes());
        }
    }
    format!("{:x}", context.compute())
}

/// Ingestion dedup: among files with the same parsed filename, keep the
/// biggest; on a size tie, keep the earliest manifest index.
fn dedupe_files(nzb: &mut NzbInfo) {
    let mut keep: Vec<bool> = vec![true; nzb.files.len()];
    for i in 0..nzb.files.len() {
        if !keep[i] {
            continue;
        }
        for j in (i + 1)..nzb.files.len() {
            if !keep[j] || nzb.files[i].filename != nzb.files[j].filename {
                continue;
            }
            if nzb.files[j].size > nzb.files[i].size {
                keep[i] = false;
            } else {
                keep[j] = false;
            }
        }
    }
    let mut idx = 0;
    let dropped_before = nzb.files.len();
    nzb.files.retain(|_| {
        let kept = keep[idx];
        idx += 1;
        kept
    });
    let dropped = dropped_before - nzb.files.len();
    if dropped > 0 {
        tracing::info!(nzb_id = %nzb.id, dropped, "dropped duplicate files from manifest");
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn sample_nzb() -> Vec<u8> {
        br#"<?xml version="1.0" encoding="UTF-8"?>
<nzb xmlns="http://www.newzbin.com/DTD/2003/nzb">
  <head>
    <meta type="password">secret</meta>
    <meta type="category">tv</meta>
  </head>
  <file poster="poster@example.com" date="1400000000" subject="Test [1/2] - &quot;archive.part01.rar&quot; yEnc (1/2)">
    <groups>
      <group>alt.binaries.test</group>
      <group>alt.binaries.misc</group>
    </groups>
    <segments>
      <segment bytes="200" number="2">part2@example</segment>
      <segment bytes="100" number="1">part1@example</segment>
    </segments>
  </file>
  <file poster="poster@example.com" date="1400000100" subject="Test [2/2] - &quot;archive.vol00+1.par2&quot; yEnc (1/1)">
    <groups>
      <group>alt.binaries.test</group>
    </groups>
    <segments>
      <segment bytes="50" number="1">par1@example</segment>
    </segments>
  </file>
</nzb>"#
            .to_vec()
    }

    #[test]
    fn parses_files_groups_and_sorted_segments() {
        let parsed = parse_nzb(&sample_nzb()).unwrap();
        assert_eq!(parsed.files.len(), 2);
        assert_eq!(parsed.password.as_deref(), Some("secret"));
        assert_eq!(parsed.meta, vec![("category".to_string(), "tv".to_string())]);

        let first = &parsed.files[0];
        assert_eq!(first.groups, vec!["alt.binaries.test", "alt.binaries.misc"]);
        assert_eq!(first.date, 1400000000);
        // Segments must come out sorted by part number despite manifest order
        assert_eq!(first.segments[0], (1, 100, "part1@example".to_string()));
        assert_eq!(first.segments[1], (2, 200, "part2@example".to_string()));
    }

    #[test]
    fn rejects_empty_manifest() {
        let err = parse_nzb(b"<nzb></nzb>").unwrap_err();
        assert!(matches!(err, Error::InvalidNzb(_)));
    }

    #[test]
    fn rejects_file_without_segments() {
        let xml = br#"<nzb><file subject="x"><groups><group>g</group></groups><segments/></file></nzb>"#;
        assert!(parse_nzb(xml).is_err());
    }

    #[test]
    fn rejects_malformed_xml() {
        assert!(parse_nzb(b"<nzb><file subject=").is_err());
    }

    #[test]
    fn filename_comes_from_the_quoted_subject_part() {
        assert_eq!(
            filename_from_subject(r#"Rel [01/50] - "My.Release.part01.rar" yEnc (1/100)"#),
            "My.Release.part01.rar"
        );
    }

    #[test]
    fn unquoted_subject_gets_a_stable_placeholder() {
        let a = filename_from_subject("no quotes here");
        let b = filename_from_subject("no quotes here");
        let c = filename_from_subject("different subject");
        assert!(a.starts_with("file_"));
        assert_eq!(a, b, "placeholder must be stable per subject");
        assert_ne!(a, c);
    }

    #[test]
    fn build_nzb_info_assembles_the_entity_tree() {
        let mut queue = DownloadQueue::new();
        let nzb =
            build_nzb_info(&mut queue, &sample_nzb(), "test.nzb", PathBuf::from("/d")).unwrap();

        assert_eq!(nzb.files.len(), 2);
        assert_eq!(nzb.size, 350);
        assert_eq!(nzb.par_size, 50, "the par2 volume must be recognised");
        assert_eq!(nzb.total_articles, 3);
        assert_eq!(nzb.min_time, 1400000000);
        assert_eq!(nzb.max_time, 1400000100);
        assert!(!nzb.content_hash.is_empty());
        assert!(!nzb.filtered_content_hash.is_empty());
        assert_eq!(
            nzb.parameters,
            vec![("*Password".to_string(), "secret".to_string())]
        );
        // Message ids gain angle brackets
        assert_eq!(nzb.files[0].articles[0].message_id, "<part1@example>");
    }

    #[test]
    fn filtered_hash_ignores_dates() {
        let with_date = sample_nzb();
        let other_date = String::from_utf8(with_date.clone())
            .unwrap()
            .replace("1400000000", "1500000000");

        let a = parse_nzb(&with_date).unwrap();
        let b = parse_nzb(other_date.as_bytes()).unwrap();
        assert_eq!(
            filtered_content_hash(&a),
            filtered_content_hash(&b),
            "re-posts with different dates must hash identically"
        );
    }

    #[test]
    fn ingestion_dedup_keeps_the_biggest_same_named_file() {
        let xml = br#"<nzb>
  <file date="1" subject="A - &quot;same.rar&quot; (1/1)">
    <groups><group>g</group></groups>
    <segments><segment bytes="100" number="1">a@x</segment></segments>
  </file>
  <file date="1" subject="B - &quot;same.rar&quot; (1/1)">
    <groups><group>g</group></groups>
    <segments><segment bytes="300" number="1">b@x</segment></segments>
  </file>
  <file date="1" subject="C - &quot;other.rar&quot; (1/1)">
    <groups><group>g</group></groups>
    <segments><segment bytes="10" number="1">c@x</segment></segments>
  </file>
</nzb>"#;
        let mut queue = DownloadQueue::new();
        let nzb = build_nzb_info(&mut queue, xml, "d.nzb", PathBuf::from("/d")).unwrap();

        assert_eq!(nzb.files.len(), 2);
        let same = nzb.files.iter().find(|f| f.filename == "same.rar").unwrap();
        assert_eq!(same.size, 300, "the bigger duplicate must win");
    }

    #[test]
    fn ingestion_dedup_tie_keeps_the_earliest() {
        let xml = br#"<nzb>
  <file date="1" subject="A - &quot;same.rar&quot; (1/1)">
    <groups><group>g</group></groups>
    <segments><segment bytes="100" number="1">first@x</segment></segments>
  </file>
  <file date="1" subject="B - &quot;same.rar&quot; (1/1)">
    <groups><group>g</group></groups>
    <segments><segment bytes="100" number="1">second@x</segment></segments>
  </file>
</nzb>"#;
        let mut queue = DownloadQueue::new();
        let nzb = build_nzb_info(&mut queue, xml, "d.nzb", PathBuf::from("/d")).unwrap();

        assert_eq!(nzb.files.len(), 1);
        assert_eq!(nzb.files[0].articles[0].message_id, "<first@x>");
    }
}

