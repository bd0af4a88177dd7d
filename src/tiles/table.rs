//! Minimal CSV reader/writer for tile lists: comma separated, RFC 4180
//! quoting, header row required.

use std::path::Path;

use crate::error::{MaskError, MaskResult};

#[derive(Clone, Debug, PartialEq)]
pub struct CsvRecord {
    /// 1-based line where the record starts.
    pub line: usize,
    pub fields: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CsvTable {
    pub header: Vec<String>,
    pub records: Vec<CsvRecord>,
}

impl CsvTable {
    /// Parse `text`; `source` only labels errors. Blank lines are skipped.
    pub fn parse(text: &str, source: &Path) -> MaskResult<CsvTable> {
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        let mut records = split_records(text, source)?;
        if records.is_empty() {
            return Err(MaskError::format(source, None, "file is empty, a header row is required"));
        }
        let header_record = records.remove(0);
        let header: Vec<String> = header_record.fields.iter().map(|f| f.trim().to_string()).collect();

        for (i, name) in header.iter().enumerate() {
            if header[..i].contains(name) {
                return Err(MaskError::format(
                    source,
                    Some(header_record.line),
                    format!("column '{}' appears twice", name),
                ));
            }
        }
        for rec in &records {
            if rec.fields.len() != header.len() {
                return Err(MaskError::format(
                    source,
                    Some(rec.line),
                    format!("expected {} fields, found {}", header.len(), rec.fields.len()),
                ));
            }
        }
        Ok(CsvTable { header, records })
    }

    pub fn column(&self, name: &str) -> Option<usize> {
        self.header.iter().position(|h| h == name)
    }

    pub fn to_csv(&self) -> String {
        let mut out = String::new();
        write_record(&mut out, &self.header);
        for rec in &self.records {
            write_record(&mut out, &rec.fields);
        }
        out
    }
}

fn split_records(text: &str, source: &Path) -> MaskResult<Vec<CsvRecord>> {
    let mut records = Vec::new();
    let mut fields: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut was_quoted = false;
    let mut line = 1usize;
    let mut record_line = 1usize;
    let mut chars = text.chars().peekable();

    let finish_record = |fields: &mut Vec<String>, records: &mut Vec<CsvRecord>, record_line: usize| {
        let blank = fields.len() == 1 && fields[0].trim().is_empty();
        if !blank {
            records.push(CsvRecord { line: record_line, fields: std::mem::take(fields) });
        } else {
            fields.clear();
        }
    };

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                '\n' => {
                    line += 1;
                    field.push(c);
                }
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' if field.trim().is_empty() && !was_quoted => {
                field.clear();
                in_quotes = true;
                was_quoted = true;
            }
            ',' => {
                fields.push(std::mem::take(&mut field));
                was_quoted = false;
            }
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' | '\r' => {
                fields.push(std::mem::take(&mut field));
                was_quoted = false;
                finish_record(&mut fields, &mut records, record_line);
                line += 1;
                record_line = line;
            }
            _ if was_quoted && c.is_whitespace() => {}
            _ if was_quoted => {
                return Err(MaskError::format(
                    source,
                    Some(line),
                    format!("unexpected '{}' after a closing quote", c),
                ));
            }
            _ => field.push(c),
        }
    }

    if in_quotes {
        return Err(MaskError::format(source, Some(record_line), "unterminated quoted field"));
    }
    if !field.is_empty() || !fields.is_empty() || was_quoted {
        fields.push(field);
        finish_record(&mut fields, &mut records, record_line);
    }
    Ok(records)
}

fn write_record(out: &mut String, fields: &[String]) {
    for (i, f) in fields.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        let needs_quotes = f.contains([',', '"', '\n', '\r']) || f.starts_with(' ') || f.ends_with(' ');
        if needs_quotes {
            out.push('"');
            out.push_str(&f.replace('"', "\"\""));
            out.push('"');
        } else {
            out.push_str(f);
        }
    }
    out.push('\n');
}
