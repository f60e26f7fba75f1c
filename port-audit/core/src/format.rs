//! Matrix encodings.
//!
//! All formats share the fixed column set in [`crate::COLUMNS`]. Dynamic
//! ranges are written as rows with a `<min>-<max>` port and their
//! description in the `Service` column.

use crate::{
    flow::{Direction, DynamicRange, FlowRecord, InvalidDirection, InvalidProtocol, Protocol},
    matrix::FlowMatrix,
    COLUMNS,
};
use serde::{Deserialize, Serialize};
use std::{fmt, path::Path, str::FromStr};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Format {
    #[default]
    Csv,
    Json,
    Yaml,
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ParseError {
    #[error("unsupported format: {0}")]
    UnknownFormat(String),

    #[error("missing header row")]
    MissingHeader,

    #[error("unexpected header row: {0}")]
    Header(String),

    #[error("row {row}: expected 9 columns, got {got}")]
    Columns { row: usize, got: usize },

    #[error("row {row}: unterminated quoted field")]
    Unterminated { row: usize },

    #[error("row {row}: invalid port {value:?}")]
    Port { row: usize, value: String },

    #[error("row {row}: invalid optional flag {value:?}")]
    Optional { row: usize, value: String },

    #[error("row {row}: {source}")]
    Protocol {
        row: usize,
        #[source]
        source: InvalidProtocol,
    },

    #[error("row {row}: {source}")]
    Direction {
        row: usize,
        #[source]
        source: InvalidDirection,
    },

    #[error("invalid JSON matrix: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid YAML matrix: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// A single serialized matrix row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Row {
    direction: Direction,
    protocol: Protocol,
    port: PortSpec,
    #[serde(default)]
    namespace: String,
    #[serde(default)]
    service: String,
    #[serde(default)]
    pod: String,
    #[serde(default)]
    container: String,
    #[serde(default)]
    node_group: String,
    #[serde(default)]
    optional: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
enum PortSpec {
    Port(u16),
    Range(String),
}

enum Entry {
    Flow(FlowRecord),
    Range(DynamicRange),
}

// === impl Format ===

impl Format {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Json => "json",
            Self::Yaml => "yaml",
        }
    }

    /// Infers the format from a file's extension.
    pub fn from_path(path: &Path) -> Result<Self, ParseError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .ok_or_else(|| ParseError::UnknownFormat(path.display().to_string()))?;
        ext.parse()
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for Format {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(Self::Csv),
            "json" => Ok(Self::Json),
            "yaml" | "yml" => Ok(Self::Yaml),
            _ => Err(ParseError::UnknownFormat(s.to_string())),
        }
    }
}

// === impl FlowMatrix ===

impl FlowMatrix {
    /// Serializes records, in matrix order, followed by dynamic ranges.
    pub fn encode(&self, format: Format) -> anyhow::Result<Vec<u8>> {
        match format {
            Format::Csv => {
                let mut out = String::new();
                write_row(&mut out, &COLUMNS)?;
                out.push('\n');
                for record in self.records.iter() {
                    write_row(&mut out, &record.fields())?;
                    out.push('\n');
                }
                for range in self.dynamic_ranges.iter() {
                    write_row(&mut out, &range.fields())?;
                    out.push('\n');
                }
                Ok(out.into_bytes())
            }
            Format::Json => {
                let mut out = serde_json::to_vec_pretty(&self.rows())?;
                out.push(b'\n');
                Ok(out)
            }
            Format::Yaml => Ok(serde_yaml::to_string(&self.rows())?.into_bytes()),
        }
    }

    /// Parses a matrix. The result is not canonicalized.
    pub fn decode(bytes: &[u8], format: Format) -> Result<Self, ParseError> {
        let rows = match format {
            Format::Csv => parse_csv(&String::from_utf8_lossy(bytes))?,
            Format::Json => serde_json::from_slice::<Vec<Row>>(bytes)?,
            Format::Yaml => serde_yaml::from_slice::<Vec<Row>>(bytes)?,
        };

        let mut matrix = FlowMatrix::default();
        for (i, row) in rows.into_iter().enumerate() {
            match row.into_entry(i + 1)? {
                Entry::Flow(record) => matrix.records.push(record),
                Entry::Range(range) => matrix.dynamic_ranges.push(range),
            }
        }
        Ok(matrix)
    }

    fn rows(&self) -> Vec<Row> {
        self.records
            .iter()
            .map(Row::from_record)
            .chain(self.dynamic_ranges.iter().map(Row::from_range))
            .collect()
    }
}

// === impl Row ===

impl Row {
    fn from_record(r: &FlowRecord) -> Self {
        Self {
            direction: r.direction,
            protocol: r.protocol,
            port: PortSpec::Port(r.port),
            namespace: r.namespace.clone(),
            service: r.service.clone(),
            pod: r.pod.clone(),
            container: r.container.clone(),
            node_group: r.node_group.clone(),
            optional: r.optional,
        }
    }

    fn from_range(r: &DynamicRange) -> Self {
        Self {
            direction: r.direction,
            protocol: r.protocol,
            port: PortSpec::Range(r.port_spec()),
            namespace: String::new(),
            service: r.description.clone(),
            pod: String::new(),
            container: String::new(),
            node_group: String::new(),
            optional: r.optional,
        }
    }

    fn from_fields(row: usize, fields: Vec<String>) -> Result<Self, ParseError> {
        if fields.len() != COLUMNS.len() {
            return Err(ParseError::Columns {
                row,
                got: fields.len(),
            });
        }
        let mut next = fields.into_iter();
        let mut take = || next.next().unwrap_or_default();

        let direction = take()
            .parse()
            .map_err(|source| ParseError::Direction { row, source })?;
        let protocol = take()
            .parse()
            .map_err(|source| ParseError::Protocol { row, source })?;
        let port = PortSpec::Range(take());
        let namespace = take();
        let service = take();
        let pod = take();
        let container = take();
        let node_group = take();
        let optional = match take().to_ascii_lowercase().as_str() {
            "" | "false" => false,
            "true" => true,
            value => {
                return Err(ParseError::Optional {
                    row,
                    value: value.to_string(),
                })
            }
        };

        Ok(Self {
            direction,
            protocol,
            port,
            namespace,
            service,
            pod,
            container,
            node_group,
            optional,
        })
    }

    fn into_entry(self, row: usize) -> Result<Entry, ParseError> {
        let port = match self.port {
            PortSpec::Port(port) => port,
            PortSpec::Range(spec) => match parse_port_spec(&spec) {
                Some((port, None)) => port,
                Some((min, Some(max))) => {
                    return Ok(Entry::Range(DynamicRange {
                        direction: self.direction,
                        protocol: self.protocol,
                        min_port: min,
                        max_port: max,
                        description: self.service,
                        optional: self.optional,
                    }));
                }
                None => return Err(ParseError::Port { row, value: spec }),
            },
        };

        Ok(Entry::Flow(FlowRecord {
            direction: self.direction,
            protocol: self.protocol,
            port,
            namespace: self.namespace,
            service: self.service,
            pod: self.pod,
            container: self.container,
            node_group: self.node_group,
            optional: self.optional,
        }))
    }
}

/// Parses `<port>` or `<min>-<max>`.
fn parse_port_spec(spec: &str) -> Option<(u16, Option<u16>)> {
    match spec.trim().split_once('-') {
        None => Some((spec.trim().parse().ok()?, None)),
        Some((min, max)) => {
            let min = min.trim().parse::<u16>().ok()?;
            let max = max.trim().parse::<u16>().ok()?;
            (min <= max).then_some((min, Some(max)))
        }
    }
}

// === CSV ===

/// Writes one CSV row, quoting fields that need it.
pub(crate) fn write_row<W, S>(w: &mut W, fields: &[S]) -> fmt::Result
where
    W: fmt::Write + ?Sized,
    S: AsRef<str>,
{
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            w.write_char(',')?;
        }
        let field = field.as_ref();
        if field.contains([',', '"', '\n', '\r']) || field.trim() != field {
            write!(w, "\"{}\"", field.replace('"', "\"\""))?;
        } else {
            w.write_str(field)?;
        }
    }
    Ok(())
}

/// Splits CSV text into records. Quoted fields may span lines; unquoted
/// fields are trimmed and blank lines are skipped.
fn split_records(text: &str) -> Result<Vec<Vec<String>>, ParseError> {
    let mut records = Vec::new();
    let mut fields = Vec::with_capacity(COLUMNS.len());
    let mut field = String::new();
    let mut quoted = false;
    let mut field_quoted = false;
    let mut record_quoted = false;

    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match (c, quoted) {
            ('"', true) if chars.peek() == Some(&'"') => {
                chars.next();
                field.push('"');
            }
            ('"', true) => quoted = false,
            ('"', false) if field.trim().is_empty() => {
                field.clear();
                quoted = true;
                field_quoted = true;
                record_quoted = true;
            }
            (',', false) => {
                fields.push(end_field(&mut field, &mut field_quoted));
            }
            ('\r', false) if chars.peek() == Some(&'\n') => {}
            ('\n', false) => {
                fields.push(end_field(&mut field, &mut field_quoted));
                end_record(&mut records, std::mem::take(&mut fields), record_quoted);
                record_quoted = false;
            }
            (c, false) if field_quoted && c.is_whitespace() => {}
            (c, _) => field.push(c),
        }
    }
    if quoted {
        return Err(ParseError::Unterminated { row: records.len() });
    }
    fields.push(end_field(&mut field, &mut field_quoted));
    end_record(&mut records, fields, record_quoted);
    Ok(records)
}

fn end_field(field: &mut String, quoted: &mut bool) -> String {
    let field = std::mem::take(field);
    if std::mem::take(quoted) {
        field
    } else {
        field.trim().to_string()
    }
}

fn end_record(records: &mut Vec<Vec<String>>, fields: Vec<String>, quoted: bool) {
    let blank = !quoted && fields.len() == 1 && fields[0].is_empty();
    if !blank {
        records.push(fields);
    }
}

fn parse_csv(text: &str) -> Result<Vec<Row>, ParseError> {
    let mut records = split_records(text)?.into_iter();

    let names = records.next().ok_or(ParseError::MissingHeader)?;
    let matches = names.len() == COLUMNS.len()
        && names
            .iter()
            .zip(COLUMNS.iter())
            .all(|(n, c)| n.eq_ignore_ascii_case(c));
    if !matches {
        return Err(ParseError::Header(names.join(",")));
    }

    records
        .enumerate()
        .map(|(i, fields)| Row::from_fields(i + 1, fields))
        .collect()
}
