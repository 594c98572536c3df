use indexmap::IndexMap;
use tracing::{error, warn};

use crate::clispec::MetaOptions;
use crate::error::{AgentError, Result};
use crate::record::Record;

/// Default field delimiter for tabular CLI output.
pub const DEFAULT_DELIM: char = '\t';

/// Raw output of a remote command, decoded as UTF-8 at the transport
/// boundary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawOutput {
    pub stdout: String,
    pub stderr: String,
}

impl RawOutput {
    pub fn new(stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        RawOutput {
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }
}

/// The response shape declared by the CLI specification.
///
/// Selected once at spec-parse time; dispatch happens in
/// [`CliResponse::parse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// Tabular (CSV-like) or colon/blank-block output.
    Generic,
    /// Two named routing tables separated by a marker line.
    LsRoute,
    /// One block of `key value` pairs.
    LsMetadataVdisk,
    /// A single `Key: Value` line, optionally followed by entry content.
    MetadataEntry,
    /// Whitespace table; the first 3 columns of each row are captured.
    MetadataEntryList,
    /// Whitespace table; only the first column of each row is captured.
    MetadataDbList,
}

/// True when a declared response type is SVC-flavored.
pub fn is_svc_response(type_attr: &str) -> bool {
    type_attr.starts_with("svc")
}

/// Select the response shape for a `Response` node.
///
/// `param` is the node's `param` attribute, or the owning command's name.
/// Non-SVC types get no parser; their output is returned raw.
pub fn find_response_kind(type_attr: Option<&str>, param: Option<&str>) -> Option<ResponseKind> {
    let type_attr = type_attr?;
    if !is_svc_response(type_attr) {
        return None;
    }
    Some(match param {
        Some("metadata_entry_create" | "metadata_entry_update" | "metadata_entry_retrieve") => {
            ResponseKind::MetadataEntry
        }
        Some("metadata_entry_list") => ResponseKind::MetadataEntryList,
        Some("metadata_db_list") => ResponseKind::MetadataDbList,
        Some("lsmetadatavdisk") => ResponseKind::LsMetadataVdisk,
        Some("lsroute") => ResponseKind::LsRoute,
        _ => ResponseKind::Generic,
    })
}

/// Parsed CLI response: the raw output plus the structured records.
#[derive(Debug, Clone)]
pub struct CliResponse {
    pub raw: RawOutput,
    records: Vec<Record>,
}

impl CliResponse {
    /// Run the parser selected for `kind` over the raw output.
    ///
    /// In flexible mode a structural parse failure degrades to an empty
    /// record list; a vendor CLI failure always propagates.
    pub fn parse(kind: ResponseKind, raw: RawOutput, meta: &MetaOptions) -> Result<CliResponse> {
        match run_parser(kind, &raw, meta) {
            Ok(records) => Ok(CliResponse { raw, records }),
            Err(err @ AgentError::CliFailure { .. }) => Err(err),
            Err(err) if meta.flexible => {
                warn!(error = %err, "failed to parse CLI output, continuing in flexible mode");
                Ok(CliResponse {
                    raw,
                    records: Vec::new(),
                })
            }
            Err(err) => Err(err),
        }
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Record> {
        self.records.iter()
    }

    /// A shallow copy of the records.
    pub fn as_list(&self) -> Vec<Record> {
        self.records.clone()
    }

    /// All records merged into one, with all-equal list fields compacted.
    pub fn as_single_element(&self) -> Option<Record> {
        if self.records.is_empty() {
            return None;
        }
        let mut merged = Record::new();
        for record in &self.records {
            merged.merge_from(record);
        }
        Some(merged)
    }

    /// Re-index the records by the named field. Records sharing the same
    /// key collapse under the merge/compact rule.
    pub fn as_dict(&self, key: &str) -> IndexMap<String, Record> {
        let mut result: IndexMap<String, Record> = IndexMap::new();
        for record in &self.records {
            let Some(value) = record.text(key) else {
                continue;
            };
            match result.get_mut(value) {
                None => {
                    result.insert(value.to_string(), record.clone());
                }
                Some(existing) => existing.merge_from(record),
            }
        }
        result
    }
}

impl<'a> IntoIterator for &'a CliResponse {
    type Item = &'a Record;
    type IntoIter = std::slice::Iter<'a, Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

fn run_parser(kind: ResponseKind, raw: &RawOutput, meta: &MetaOptions) -> Result<Vec<Record>> {
    match kind {
        ResponseKind::Generic => {
            let delim = meta.delim.unwrap_or(DEFAULT_DELIM);
            parse_generic(&raw.stdout, &raw.stderr, meta, delim)
        }
        ResponseKind::LsRoute => parse_lsroute(raw, meta),
        ResponseKind::LsMetadataVdisk => parse_lsmetadatavdisk(raw, meta),
        ResponseKind::MetadataEntry => parse_metadata_entry(raw, meta),
        ResponseKind::MetadataEntryList => parse_metadata_table(raw, meta, 3),
        ResponseKind::MetadataDbList => parse_metadata_table(raw, meta, 1),
    }
}

// -- Return-code sentinel ------------------------------------------------------

/// Scan stdout for the error tag planted by the return-code sentinel tail.
///
/// The tokens after the tag that look like optionally-signed integers form
/// the return-code field; the first of them is the primary code.
fn check_error_tag(stdout: &str, stderr: &str, meta: &MetaOptions) -> Result<()> {
    let Some(tag) = meta.error_tag.as_deref() else {
        return Ok(());
    };
    for line in stdout.lines() {
        if let Some(idx) = line.find(tag) {
            let tail = &line[idx + tag.len()..];
            let tokens: Vec<&str> = tail
                .split_whitespace()
                .filter(|tk| looks_like_int(tk))
                .collect();
            let rc_field = tokens.join(" ");
            let return_code = tokens
                .first()
                .and_then(|tk| tk.parse::<i32>().ok())
                .unwrap_or(-1);
            return Err(AgentError::cli_failure(&rc_field, stderr, return_code));
        }
    }
    Ok(())
}

fn looks_like_int(token: &str) -> bool {
    let body = token.strip_prefix('-').unwrap_or(token);
    !body.is_empty() && body.bytes().all(|b| b.is_ascii_digit())
}

// -- Generic parser ------------------------------------------------------------

fn parse_generic(
    stdout_raw: &str,
    stderr: &str,
    meta: &MetaOptions,
    delim: char,
) -> Result<Vec<Record>> {
    // Leading whitespace confuses both sniffing and the header row.
    let stdout = stdout_raw.trim_start();
    check_error_tag(stdout, stderr, meta)?;

    let rows: Vec<Vec<String>> = stdout.lines().map(|line| split_fields(line, delim)).collect();
    let with_header = meta.with_header.unwrap_or_else(|| sniff_header(&rows));

    if with_header {
        let mut it = rows.into_iter();
        let header = it.next().unwrap_or_default();
        if let Some(first) = header.first() {
            if first.starts_with("CMMVC7017E Login has failed") {
                let message = format!(
                    "CLI failure. Return code is 1. Error message is \"{first}\""
                );
                error!("{message}");
                return Err(AgentError::CliFailure {
                    message,
                    return_code: 1,
                });
            }
        }
        let mut result = Vec::new();
        for row in it {
            let mut record = Record::new();
            for (key, value) in header.iter().zip(row.iter()) {
                record.append_stripped(key, value);
            }
            result.push(record);
        }
        Ok(result)
    } else {
        // Records are blocks separated by blank lines; the first cell of a
        // row is the key, the remainder one space-joined value.
        let mut result = Vec::new();
        let mut current = Record::new();
        for row in &rows {
            if let Some(key) = row.first() {
                current.append_stripped(key, &row[1..].join(" "));
            } else if !current.is_empty() {
                result.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            result.push(current);
        }
        Ok(result)
    }
}

/// Split one output line into fields.
///
/// Honors a double-quote wrapped field, a doubled quote as an escaped
/// quote, and spaces immediately following the delimiter being ignored
/// (which also makes runs of spaces act as one separator when the
/// delimiter itself is a space).
fn split_fields(line: &str, delim: char) -> Vec<String> {
    if line.is_empty() {
        return Vec::new();
    }
    let chars: Vec<char> = line.chars().collect();
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if in_quotes {
            if c == '"' {
                if chars.get(i + 1) == Some(&'"') {
                    current.push('"');
                    i += 2;
                } else {
                    in_quotes = false;
                    i += 1;
                }
            } else {
                current.push(c);
                i += 1;
            }
        } else if c == '"' && current.is_empty() {
            in_quotes = true;
            i += 1;
        } else if c == delim {
            fields.push(std::mem::take(&mut current));
            i += 1;
            while chars.get(i) == Some(&' ') {
                i += 1;
            }
        } else {
            current.push(c);
            i += 1;
        }
    }
    fields.push(current);
    fields
}

/// Heuristic header detection over already-split rows.
///
/// Classify each column from up to 20 sample rows of matching width: a
/// column is numeric if every sample parses as a float or a hexadecimal
/// integer; otherwise a uniform cell length classifies it. The header is
/// present iff, summed over classified columns, the first row diverges
/// from the class more often than it matches.
fn sniff_header(rows: &[Vec<String>]) -> bool {
    let Some(header) = rows.first() else {
        return false;
    };
    let columns = header.len();
    let sample: Vec<&Vec<String>> = rows[1..]
        .iter()
        .filter(|row| row.len() == columns)
        .take(20)
        .collect();

    let mut score = 0i32;
    for col in 0..columns {
        if sample.iter().all(|row| is_numeric(&row[col])) {
            score += if is_numeric(&header[col]) { -1 } else { 1 };
        } else {
            let mut lengths = sample.iter().map(|row| row[col].chars().count());
            let first_len = lengths.next();
            if let Some(len) = first_len {
                if lengths.all(|l| l == len) {
                    score += if header[col].chars().count() == len { -1 } else { 1 };
                }
            }
        }
    }
    score > 0
}

fn is_numeric(data: &str) -> bool {
    let trimmed = data.trim();
    if trimmed.parse::<f64>().is_ok() {
        return true;
    }
    is_hex_integer(trimmed)
}

fn is_hex_integer(data: &str) -> bool {
    let body = data
        .strip_prefix('-')
        .or_else(|| data.strip_prefix('+'))
        .unwrap_or(data);
    let body = body
        .strip_prefix("0x")
        .or_else(|| body.strip_prefix("0X"))
        .unwrap_or(body);
    !body.is_empty() && body.bytes().all(|b| b.is_ascii_hexdigit())
}

// -- lsroute -------------------------------------------------------------------

/// The remote emits two named routing tables separated by a marker line.
/// Each section is run through the generic parser with a space delimiter;
/// the intra-header space in "Next Hop" is eliminated first.
fn parse_lsroute(raw: &RawOutput, meta: &MetaOptions) -> Result<Vec<Record>> {
    let delim = meta.delim.unwrap_or(' ');
    let mut result = Vec::new();
    let mut section: Vec<String> = Vec::new();
    for line in raw.stdout.lines() {
        if line.contains("routing table") {
            flush_route_section(&mut section, &mut result, &raw.stderr, meta, delim)?;
        } else {
            let line = line.trim();
            if !line.is_empty() {
                section.push(line.to_string());
            }
        }
    }
    flush_route_section(&mut section, &mut result, &raw.stderr, meta, delim)?;
    Ok(result)
}

fn flush_route_section(
    section: &mut Vec<String>,
    result: &mut Vec<Record>,
    stderr: &str,
    meta: &MetaOptions,
    delim: char,
) -> Result<()> {
    if section.is_empty() {
        return Ok(());
    }
    section[0] = section[0].replace(" Next Hop ", " Next_Hop ");
    let stdout = section.join("\n");
    result.extend(parse_generic(&stdout, stderr, meta, delim)?);
    section.clear();
    Ok(())
}

// -- lsmetadatavdisk -----------------------------------------------------------

/// The entire stdout is one block of `key value` pairs.
fn parse_lsmetadatavdisk(raw: &RawOutput, meta: &MetaOptions) -> Result<Vec<Record>> {
    let stdout = raw.stdout.trim_start();
    check_error_tag(stdout, &raw.stderr, meta)?;
    let mut record = Record::new();
    for line in stdout.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() % 2 != 0 {
            return Err(AgentError::ResponseParser(format!(
                "Fail to parse the CLI response: {stdout}"
            )));
        }
        for pair in tokens.chunks(2) {
            record.set(pair[0], pair[1]);
        }
    }
    Ok(vec![record])
}

// -- Metadata entries ----------------------------------------------------------

/// The first line is a space-separated sequence of `Key: Value` pairs.
/// With more than one line, everything after the first newline is attached
/// as the entry's `content` field.
fn parse_metadata_entry(raw: &RawOutput, meta: &MetaOptions) -> Result<Vec<Record>> {
    let stdout = raw.stdout.trim_start();
    check_error_tag(stdout, &raw.stderr, meta)?;
    let mut lines = stdout.lines();
    let Some(first) = lines.next() else {
        return Ok(Vec::new());
    };
    let mut entry = colon_pairs(first);
    if lines.next().is_some() {
        let content = match stdout.find('\n') {
            Some(idx) => &stdout[idx + 1..],
            None => "",
        };
        entry.set("content", content);
    }
    Ok(vec![entry])
}

/// `Token: 1234 TimeStamp: 20141013` becomes
/// `{Token: "1234", TimeStamp: "20141013"}`.
fn colon_pairs(line: &str) -> Record {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let mut record = Record::new();
    let mut i = 0;
    while i < tokens.len() {
        if tokens[i].ends_with(':') && i + 1 < tokens.len() {
            record.set(&tokens[i].replace(':', ""), tokens[i + 1]);
            i += 2;
        } else {
            i += 1;
        }
    }
    record
}

/// Whitespace-separated table of which the first `columns` columns are
/// captured per row.
fn parse_metadata_table(raw: &RawOutput, meta: &MetaOptions, columns: usize) -> Result<Vec<Record>> {
    let stdout = raw.stdout.trim_start();
    check_error_tag(stdout, &raw.stderr, meta)?;
    let mut lines = stdout.lines();
    let Some(header_line) = lines.next() else {
        return Ok(Vec::new());
    };
    let header: Vec<&str> = header_line.split_whitespace().collect();
    let mut result = Vec::new();
    for line in lines {
        let cells: Vec<&str> = line.split_whitespace().collect();
        if header.len() < columns || cells.len() < columns {
            return Err(AgentError::ResponseParser(format!(
                "Fail to parse the CLI response: {stdout}"
            )));
        }
        let mut record = Record::new();
        for i in 0..columns {
            record.set(header[i], cells[i]);
        }
        result.push(record);
    }
    Ok(result)
}
