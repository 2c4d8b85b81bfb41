//! File encodings for the local file connector
//!
//! CSV goes through the `csv` crate with per-cell type coercion, JSON through
//! `serde_json`, Parquet through Polars, xlsx through `calamine` (read) and
//! `rust_xlsxwriter` (write), and XML through `quick-xml`.

use crate::config::{FileType, FileTypeOptions};
use crate::error::{Result, SyncError};
use crate::record::{RecordSet, Value};
use calamine::{open_workbook_auto, Data, Reader as _};
use csv::{ReaderBuilder, WriterBuilder};
use polars::prelude::*;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use rust_xlsxwriter::Workbook;
use serde_json::{Map, Value as JsonValue};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Largest magnitude an f64 holds without losing integer precision (2^53).
const MAX_EXACT_FLOAT_INT: f64 = 9_007_199_254_740_992.0;

const XML_ROOT: &str = "data";
const XML_ROW: &str = "row";

/// Reject options the codecs cannot honor.
pub fn validate(_file_type: FileType, options: &FileTypeOptions) -> Result<()> {
    if let Some(delimiter) = options.delimiter {
        if !delimiter.is_ascii() {
            return Err(SyncError::Config(format!(
                "CSV delimiter '{}' must be a single ASCII character",
                delimiter
            )));
        }
    }
    Ok(())
}

pub fn read(path: &Path, file_type: FileType, options: &FileTypeOptions) -> Result<RecordSet> {
    match file_type {
        FileType::Csv => read_csv(path, options),
        FileType::Json => read_json(path),
        FileType::Parquet => read_parquet(path),
        FileType::Xlsx => read_xlsx(path),
        FileType::Xml => read_xml(path),
    }
}

pub fn write(
    records: &RecordSet,
    path: &Path,
    file_type: FileType,
    options: &FileTypeOptions,
) -> Result<()> {
    match file_type {
        FileType::Csv => write_csv(records, path, options),
        FileType::Json => write_json(records, path, options),
        FileType::Parquet => write_parquet(records, path),
        FileType::Xlsx => write_xlsx(records, path),
        FileType::Xml => write_xml(records, path),
    }
}

// ---------------------------------------------------------------------------
// CSV
// ---------------------------------------------------------------------------

fn delimiter(options: &FileTypeOptions) -> u8 {
    options.delimiter.map(|c| c as u8).unwrap_or(b',')
}

fn coerce_cell(s: &str) -> Value {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }

    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }

    if let Ok(i) = trimmed.parse::<i64>() {
        return Value::Int(i);
    }

    if let Ok(f) = trimmed.parse::<f64>() {
        if f.is_finite() {
            return Value::Float(f);
        }
    }

    Value::Str(trimmed.to_string())
}

fn read_csv(path: &Path, options: &FileTypeOptions) -> Result<RecordSet> {
    let has_header = options.has_header.unwrap_or(true);
    let mut rdr = ReaderBuilder::new()
        .has_headers(has_header)
        .delimiter(delimiter(options))
        .from_path(path)?;

    let mut columns: Vec<String> = if has_header {
        rdr.headers()?.iter().map(|h| h.trim().to_string()).collect()
    } else {
        Vec::new()
    };

    // The reader is strict: a row wider or narrower than the first is a CSV error
    let mut raw = Vec::new();
    for result in rdr.records() {
        raw.push(result?);
    }

    if !has_header {
        let width = raw.first().map(|r| r.len()).unwrap_or(0);
        columns = (0..width).map(|i| i.to_string()).collect();
    }

    let mut records = RecordSet::new(columns)?;
    for record in raw {
        records.push_row(record.iter().map(coerce_cell).collect())?;
    }
    Ok(records)
}

fn write_csv(records: &RecordSet, path: &Path, options: &FileTypeOptions) -> Result<()> {
    let mut wtr = WriterBuilder::new()
        .delimiter(delimiter(options))
        .from_path(path)?;

    if options.has_header.unwrap_or(true) && !records.columns().is_empty() {
        wtr.write_record(records.columns())?;
    }
    for row in records.rows() {
        wtr.write_record(row.iter().map(|v| v.to_string()))?;
    }
    wtr.flush()?;
    Ok(())
}

// ---------------------------------------------------------------------------
// JSON
// ---------------------------------------------------------------------------

/// Accepts a single JSON array of objects or a stream of objects (one per line).
fn read_json(path: &Path) -> Result<RecordSet> {
    let content = std::fs::read_to_string(path)?;
    parse_json_records(&content)
}

pub(crate) fn parse_json_records(content: &str) -> Result<RecordSet> {
    let mut values = Vec::new();
    for value in serde_json::Deserializer::from_str(content).into_iter::<JsonValue>() {
        values.push(value?);
    }

    if values.len() == 1 && values[0].is_array() {
        if let Some(JsonValue::Array(rows)) = values.pop() {
            return RecordSet::from_json_rows(rows);
        }
    }
    RecordSet::from_json_rows(values)
}

fn write_json(records: &RecordSet, path: &Path, options: &FileTypeOptions) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    if options.lines.unwrap_or(true) {
        write_json_lines(records, &mut out)?;
    } else {
        serde_json::to_writer(&mut out, &records.to_json_rows())?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}

fn write_json_lines<W: Write>(records: &RecordSet, out: &mut W) -> Result<()> {
    for row in records.to_json_rows() {
        serde_json::to_writer(&mut *out, &row)?;
        out.write_all(b"\n")?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Parquet
// ---------------------------------------------------------------------------

fn read_parquet(path: &Path) -> Result<RecordSet> {
    let file = File::open(path)?;
    let mut df = ParquetReader::new(file).finish()?;
    dataframe_to_records(&mut df)
}

fn write_parquet(records: &RecordSet, path: &Path) -> Result<()> {
    let mut df = records_to_dataframe(records)?;
    let mut file = File::create(path)?;
    ParquetWriter::new(&mut file).finish(&mut df)?;
    Ok(())
}

pub fn dataframe_to_records(df: &mut DataFrame) -> Result<RecordSet> {
    let columns: Vec<String> = df
        .get_column_names()
        .iter()
        .map(|name| name.to_string())
        .collect();
    if df.height() == 0 {
        return RecordSet::new(columns);
    }

    let mut buf = Vec::new();
    JsonWriter::new(&mut buf)
        .with_json_format(JsonFormat::JsonLines)
        .finish(df)?;
    let text = String::from_utf8(buf)
        .map_err(|e| SyncError::Polars(format!("DataFrame produced invalid UTF-8: {}", e)))?;

    let parsed = parse_json_records(&text)?;
    // Realign to the frame column order
    let header = RecordSet::new(columns)?;
    header.concat(parsed)
}

/// One typed `Series` per column. Columns mixing scalar kinds, and nested
/// values, are stored as text so no cell is lost.
pub fn records_to_dataframe(records: &RecordSet) -> Result<DataFrame> {
    let series: Vec<Series> = records
        .columns()
        .iter()
        .enumerate()
        .map(|(idx, name)| column_series(records, idx, name))
        .collect();
    Ok(DataFrame::new(series)?)
}

fn column_series(records: &RecordSet, idx: usize, name: &str) -> Series {
    let cells = records.rows().iter().map(|row| &row[idx]);
    match records.column_type(idx) {
        "int64" => Series::new(
            name,
            cells
                .map(|v| match v {
                    Value::Int(i) => Some(*i),
                    _ => None,
                })
                .collect::<Vec<Option<i64>>>(),
        ),
        "float64" => Series::new(
            name,
            cells
                .map(|v| match v {
                    Value::Int(i) => Some(*i as f64),
                    Value::Float(f) => Some(*f),
                    _ => None,
                })
                .collect::<Vec<Option<f64>>>(),
        ),
        "bool" => Series::new(
            name,
            cells
                .map(|v| match v {
                    Value::Bool(b) => Some(*b),
                    _ => None,
                })
                .collect::<Vec<Option<bool>>>(),
        ),
        _ => Series::new(
            name,
            cells
                .map(|v| match v {
                    Value::Null => None,
                    other => Some(other.to_string()),
                })
                .collect::<Vec<Option<String>>>(),
        ),
    }
}

// ---------------------------------------------------------------------------
// XLSX
// ---------------------------------------------------------------------------

/// First worksheet, first row as the header.
fn read_xlsx(path: &Path) -> Result<RecordSet> {
    let mut workbook = open_workbook_auto(path)?;
    let range = match workbook.worksheet_range_at(0) {
        Some(range) => range?,
        None => return Ok(RecordSet::empty()),
    };

    let mut rows = range.rows();
    let columns: Vec<String> = match rows.next() {
        Some(header) => header.iter().map(|cell| cell.to_string()).collect(),
        None => return Ok(RecordSet::empty()),
    };
    let mut records = RecordSet::new(columns)?;
    for row in rows {
        records.push_row(row.iter().map(xlsx_cell).collect())?;
    }
    Ok(records)
}

fn xlsx_cell(cell: &Data) -> Value {
    match cell {
        Data::Empty => Value::Null,
        Data::Bool(b) => Value::Bool(*b),
        Data::Int(i) => Value::Int(*i),
        // Spreadsheets store every number as a float
        Data::Float(f) if f.fract() == 0.0 && f.abs() < MAX_EXACT_FLOAT_INT => Value::Int(*f as i64),
        Data::Float(f) => Value::Float(*f),
        Data::String(s) => Value::Str(s.clone()),
        other => Value::Str(other.to_string()),
    }
}

fn write_xlsx(records: &RecordSet, path: &Path) -> Result<()> {
    let mut workbook = Workbook::new();
    {
        let sheet = workbook.add_worksheet();
        for (col, name) in records.columns().iter().enumerate() {
            sheet.write_string(0, xlsx_col(col)?, name.as_str())?;
        }
        for (idx, row) in records.rows().iter().enumerate() {
            let r = u32::try_from(idx + 1)
                .map_err(|_| SyncError::ShapeMismatch(format!("{} rows exceed the xlsx limit", records.len())))?;
            for (col, value) in row.iter().enumerate() {
                let c = xlsx_col(col)?;
                match value {
                    Value::Null => {}
                    Value::Bool(b) => {
                        sheet.write_boolean(r, c, *b)?;
                    }
                    Value::Int(i) if (*i as f64).abs() < MAX_EXACT_FLOAT_INT => {
                        sheet.write_number(r, c, *i as f64)?;
                    }
                    Value::Float(f) if f.is_finite() => {
                        sheet.write_number(r, c, *f)?;
                    }
                    other => {
                        sheet.write_string(r, c, other.to_string())?;
                    }
                }
            }
        }
    }
    workbook.save(path)?;
    Ok(())
}

fn xlsx_col(col: usize) -> Result<u16> {
    u16::try_from(col).map_err(|_| SyncError::ShapeMismatch(format!("column {} exceeds the xlsx limit", col)))
}

// ---------------------------------------------------------------------------
// XML
// ---------------------------------------------------------------------------

/// Each child of the root element is a row. Its child elements and its
/// attributes are the cells; element text is coerced like a CSV cell.
fn read_xml(path: &Path) -> Result<RecordSet> {
    let mut reader = quick_xml::Reader::from_file(path)?;
    reader.trim_text(true);

    let mut buf = Vec::new();
    let mut depth = 0usize;
    let mut rows: Vec<Map<String, JsonValue>> = Vec::new();
    let mut row = Map::new();
    let mut field: Option<(String, String)> = None;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => {
                depth += 1;
                match depth {
                    2 => row = xml_attributes(&e, &reader)?,
                    3 => field = Some((xml_name(&e), String::new())),
                    _ => {}
                }
            }
            Event::Empty(e) => match depth + 1 {
                2 => rows.push(xml_attributes(&e, &reader)?),
                3 => {
                    row.insert(xml_name(&e), JsonValue::Null);
                }
                _ => {}
            },
            Event::Text(text) => {
                if let (3, Some((_, content))) = (depth, field.as_mut()) {
                    content.push_str(&text.unescape()?);
                }
            }
            Event::CData(data) => {
                if let (3, Some((_, content))) = (depth, field.as_mut()) {
                    content.push_str(&String::from_utf8_lossy(&data));
                }
            }
            Event::End(_) => {
                match depth {
                    2 => rows.push(std::mem::take(&mut row)),
                    3 => {
                        if let Some((name, content)) = field.take() {
                            row.insert(name, coerce_cell(&content).to_json());
                        }
                    }
                    _ => {}
                }
                depth = depth.saturating_sub(1);
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(RecordSet::from_json_objects(rows))
}

fn xml_name(element: &BytesStart) -> String {
    String::from_utf8_lossy(element.local_name().as_ref()).into_owned()
}

fn xml_attributes<B>(element: &BytesStart, reader: &quick_xml::Reader<B>) -> Result<Map<String, JsonValue>> {
    let mut out = Map::new();
    for attr in element.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        let value = attr.decode_and_unescape_value(reader)?;
        out.insert(
            String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned(),
            coerce_cell(&value).to_json(),
        );
    }
    Ok(out)
}

fn write_xml(records: &RecordSet, path: &Path) -> Result<()> {
    let mut writer = quick_xml::Writer::new_with_indent(BufWriter::new(File::create(path)?), b' ', 2);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;
    writer.write_event(Event::Start(BytesStart::new(XML_ROOT)))?;
    for row in records.rows() {
        writer.write_event(Event::Start(BytesStart::new(XML_ROW)))?;
        for (name, value) in records.columns().iter().zip(row) {
            if value.is_null() {
                writer.write_event(Event::Empty(BytesStart::new(name.as_str())))?;
                continue;
            }
            let text = value.to_string();
            writer.write_event(Event::Start(BytesStart::new(name.as_str())))?;
            writer.write_event(Event::Text(BytesText::new(&text)))?;
            writer.write_event(Event::End(BytesEnd::new(name.as_str())))?;
        }
        writer.write_event(Event::End(BytesEnd::new(XML_ROW)))?;
    }
    writer.write_event(Event::End(BytesEnd::new(XML_ROOT)))?;
    writer.into_inner().flush()?;
    Ok(())
}
