//! Parameter binding from the typed JSON envelope, placeholder rewriting,
//! and JSON row-shaping shared by every engine driver.

use std::collections::HashMap;
use std::fmt;

use serde_json::Value;

use crate::transaction::IsolationLevel;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    InvalidArgument,
    NoDriver,
    ConnectFailed,
    PrepareFailed,
    BindFailed,
    UnsupportedParameterType,
    ParameterOutOfRange,
    ExecuteFailed,
    Timeout,
    ApplyFailed,
    AllocationFailure,
    ShutdownInProgress,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::InvalidArgument => "InvalidArgument",
            ErrorKind::NoDriver => "NoDriver",
            ErrorKind::ConnectFailed => "ConnectFailed",
            ErrorKind::PrepareFailed => "PrepareFailed",
            ErrorKind::BindFailed => "BindFailed",
            ErrorKind::UnsupportedParameterType => "UnsupportedParameterType",
            ErrorKind::ParameterOutOfRange => "ParameterOutOfRange",
            ErrorKind::ExecuteFailed => "ExecuteFailed",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::ApplyFailed => "ApplyFailed",
            ErrorKind::AllocationFailure => "AllocationFailure",
            ErrorKind::ShutdownInProgress => "ShutdownInProgress",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug)]
pub struct QueryRequest {
    pub sql_template: String,
    pub parameters_json: Value,
    pub timeout_ms: u64,
    pub prepared_name: Option<String>,
    pub isolation_level: Option<IsolationLevel>,
}

impl QueryRequest {
    pub fn new(sql_template: impl Into<String>) -> Self {
        Self {
            sql_template: sql_template.into(),
            parameters_json: Value::Object(serde_json::Map::new()),
            timeout_ms: 30_000,
            prepared_name: None,
            isolation_level: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct QueryResult {
    pub success: bool,
    pub row_count: usize,
    pub column_count: usize,
    pub affected_rows: u64,
    pub column_names: Vec<String>,
    pub data_json: String,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
}

impl QueryResult {
    pub fn empty_success() -> Self {
        Self {
            success: true,
            row_count: 0,
            column_count: 0,
            affected_rows: 0,
            column_names: Vec::new(),
            data_json: "[]".to_string(),
            error_kind: None,
            error_message: None,
        }
    }

    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            row_count: 0,
            column_count: 0,
            affected_rows: 0,
            column_names: Vec::new(),
            data_json: "[]".to_string(),
            error_kind: Some(kind),
            error_message: Some(message.into()),
        }
    }
}

/// A parameter value after it has been classified by its JSON type tag and
/// is ready for positional binding. Date-like tags (`DATE`, `TIME`,
/// `DATETIME`, `TIMESTAMP`) collapse into `Text`, matching the binding rule
/// that they are UTF-8 strings like `STRING`/`TEXT`.
#[derive(Clone, Debug, PartialEq)]
pub enum BoundValue {
    Integer(i64),
    Text(String),
    Boolean(bool),
    Float(f64),
}

const KNOWN_TYPE_TAGS: &[&str] =
    &["INTEGER", "STRING", "TEXT", "BOOLEAN", "FLOAT", "DATE", "TIME", "DATETIME", "TIMESTAMP"];

/// Parses the `{ "<TYPE>": { "<name>": <value>, ... }, ... }` envelope into a
/// name-keyed map of [`BoundValue`]s.
pub fn parse_parameters_json(parameters_json: &Value) -> Result<HashMap<String, BoundValue>, (ErrorKind, String)> {
    let mut out = HashMap::new();

    let Value::Object(type_groups) = parameters_json else {
        return Err((ErrorKind::InvalidArgument, "parameters_json must be an object".to_string()));
    };

    for (type_tag, group) in type_groups {
        if !KNOWN_TYPE_TAGS.contains(&type_tag.as_str()) {
            return Err((ErrorKind::UnsupportedParameterType, format!("unrecognized parameter type `{type_tag}`")));
        }

        let Value::Object(entries) = group else {
            return Err((
                ErrorKind::InvalidArgument,
                format!("parameter group `{type_tag}` must be an object of name to value"),
            ));
        };

        for (name, value) in entries {
            let bound = bind_one(type_tag, value)?;
            out.insert(name.clone(), bound);
        }
    }

    Ok(out)
}

fn bind_one(type_tag: &str, value: &Value) -> Result<BoundValue, (ErrorKind, String)> {
    match type_tag {
        "INTEGER" => match value.as_i64() {
            Some(n) => Ok(BoundValue::Integer(n)),
            None if value.is_u64() || value.is_f64() => {
                Err((ErrorKind::ParameterOutOfRange, "integer parameter does not fit in i64".to_string()))
            }
            None => Err((ErrorKind::BindFailed, "INTEGER parameter was not a number".to_string())),
        },
        "BOOLEAN" => match value.as_bool() {
            Some(b) => Ok(BoundValue::Boolean(b)),
            None => Err((ErrorKind::BindFailed, "BOOLEAN parameter was not a bool".to_string())),
        },
        "FLOAT" => match value.as_f64() {
            Some(f) => Ok(BoundValue::Float(f)),
            None => Err((ErrorKind::BindFailed, "FLOAT parameter was not a number".to_string())),
        },
        "STRING" | "TEXT" | "DATE" | "TIME" | "DATETIME" | "TIMESTAMP" => match value.as_str() {
            Some(s) => Ok(BoundValue::Text(s.to_string())),
            None => Err((ErrorKind::BindFailed, format!("{type_tag} parameter was null or not a string"))),
        },
        other => Err((ErrorKind::UnsupportedParameterType, format!("unrecognized parameter type `{other}`"))),
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PlaceholderStyle {
    /// `$1`, `$2`, ... (PostgreSQL)
    Numbered,
    /// `?` repeated once per occurrence (MySQL, SQLite, DB2)
    Question,
}

/// Scans `template` left to right for `:name`-style placeholders and
/// rewrites each occurrence (including repeats of the same name) into the
/// engine's native positional syntax, returning the rewritten SQL alongside
/// the ordered list of parameter names to bind.
pub fn rewrite_placeholders(template: &str, style: PlaceholderStyle) -> (String, Vec<String>) {
    let mut sql = String::with_capacity(template.len());
    let mut names = Vec::new();
    // Byte offsets paired with their decoded char, so identifier scanning can
    // index by character position while slicing `template` stays UTF-8 safe.
    let chars: Vec<(usize, char)> = template.char_indices().collect();
    let mut i = 0;
    let mut ordinal = 0usize;

    while i < chars.len() {
        let (_, c) = chars[i];
        if c == ':' && i + 1 < chars.len() && is_ident_start(chars[i + 1].1) {
            let start = i + 1;
            let mut end = start;
            while end < chars.len() && is_ident_continue(chars[end].1) {
                end += 1;
            }
            let byte_start = chars[start].0;
            let byte_end = chars.get(end).map_or(template.len(), |&(b, _)| b);
            let name = template[byte_start..byte_end].to_string();
            ordinal += 1;
            match style {
                PlaceholderStyle::Numbered => sql.push_str(&format!("${ordinal}")),
                PlaceholderStyle::Question => sql.push('?'),
            }
            names.push(name);
            i = end;
        } else {
            sql.push(c);
            i += 1;
        }
    }

    (sql, names)
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Resolves the ordered placeholder names against the parsed parameter map,
/// failing with `BindFailed` if a name has no bound value.
pub fn order_bound_values(
    names: &[String],
    params: &HashMap<String, BoundValue>,
) -> Result<Vec<BoundValue>, (ErrorKind, String)> {
    names
        .iter()
        .map(|name| {
            params
                .get(name)
                .cloned()
                .ok_or_else(|| (ErrorKind::BindFailed, format!("no value bound for parameter `:{name}`")))
        })
        .collect()
}

/// Escapes a string for embedding as a JSON string body (the caller supplies
/// the surrounding quotes). Backslash and double-quote are escaped, and
/// control characters below 0x20 are emitted as `\uXXXX`.
pub fn json_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

/// A JSON cell value as rendered into a row object: integers/floats inline
/// unquoted, strings JSON-escaped, nulls literal.
#[derive(Clone, Debug)]
pub enum JsonCell {
    Null,
    Integer(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

impl JsonCell {
    fn render(&self) -> String {
        match self {
            JsonCell::Null => "null".to_string(),
            JsonCell::Integer(n) => n.to_string(),
            JsonCell::Float(f) => {
                if f.is_finite() {
                    f.to_string()
                } else {
                    "null".to_string()
                }
            }
            JsonCell::Bool(b) => b.to_string(),
            JsonCell::Text(s) => format!("\"{}\"", json_escape(s)),
        }
    }
}

/// Incrementally assembles the `data_json` array with the allocation-growth
/// truncation policy from the source preserved: growth failures truncate at
/// the last complete row and still report `success=true`; only the initial
/// reservation failing is a hard `AllocationFailure`.
pub struct JsonRowBuilder {
    buf: String,
    row_count: usize,
    truncated: bool,
}

impl JsonRowBuilder {
    pub fn with_row_count_hint(estimated_rows: usize) -> Result<Self, ()> {
        let mut buf = String::new();
        let initial_capacity = estimated_rows.saturating_mul(1024).max(64);
        buf.try_reserve(initial_capacity).map_err(|_| ())?;
        buf.push('[');
        Ok(Self { buf, row_count: 0, truncated: false })
    }

    /// Renders one row as a JSON object and appends it. Returns `false` (and
    /// marks the builder truncated) if growing the buffer failed; the
    /// caller should stop calling `push_row` afterwards.
    pub fn push_row(&mut self, column_names: &[String], cells: &[JsonCell]) -> bool {
        let mut row = String::with_capacity(cells.len() * 16);
        row.push('{');
        for (i, (name, cell)) in column_names.iter().zip(cells.iter()).enumerate() {
            if i > 0 {
                row.push(',');
            }
            row.push('"');
            row.push_str(&json_escape(name));
            row.push_str("\":");
            row.push_str(&cell.render());
        }
        row.push('}');

        let needed = row.len() + 1;
        if self.buf.try_reserve(needed).is_err() {
            self.truncated = true;
            return false;
        }
        if self.row_count > 0 {
            self.buf.push(',');
        }
        self.buf.push_str(&row);
        self.row_count += 1;
        true
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn finish(mut self) -> (String, usize) {
        self.buf.push(']');
        (self.buf, self.row_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_named_placeholders_to_postgres_style() {
        let (sql, names) = rewrite_placeholders("SELECT * FROM t WHERE id = :id AND name = :name", PlaceholderStyle::Numbered);
        assert_eq!(sql, "SELECT * FROM t WHERE id = $1 AND name = $2");
        assert_eq!(names, vec!["id".to_string(), "name".to_string()]);
    }

    #[test]
    fn repeated_placeholder_names_get_their_own_occurrence_slot() {
        let (sql, names) = rewrite_placeholders("WHERE a = :x OR b = :x", PlaceholderStyle::Question);
        assert_eq!(sql, "WHERE a = ? OR b = ?");
        assert_eq!(names, vec!["x".to_string(), "x".to_string()]);
    }

    #[test]
    fn multibyte_utf8_outside_a_placeholder_survives_intact() {
        let (sql, names) = rewrite_placeholders("SELECT name AS \"nombre\" /* café */ FROM t WHERE id = :id", PlaceholderStyle::Question);
        assert_eq!(sql, "SELECT name AS \"nombre\" /* café */ FROM t WHERE id = ?");
        assert_eq!(names, vec!["id".to_string()]);
    }

    #[test]
    fn parses_typed_parameter_envelope() {
        let json: Value = serde_json::from_str(r#"{"INTEGER":{"id":42},"STRING":{"name":"alice"}}"#).unwrap();
        let parsed = parse_parameters_json(&json).unwrap();
        assert_eq!(parsed.get("id"), Some(&BoundValue::Integer(42)));
        assert_eq!(parsed.get("name"), Some(&BoundValue::Text("alice".to_string())));
    }

    #[test]
    fn unknown_type_tag_is_rejected() {
        let json: Value = serde_json::from_str(r#"{"UUID":{"id":"x"}}"#).unwrap();
        let err = parse_parameters_json(&json).unwrap_err();
        assert_eq!(err.0, ErrorKind::UnsupportedParameterType);
    }

    #[test]
    fn null_text_parameter_is_a_bind_failure() {
        let json: Value = serde_json::from_str(r#"{"TEXT":{"name":null}}"#).unwrap();
        let err = parse_parameters_json(&json).unwrap_err();
        assert_eq!(err.0, ErrorKind::BindFailed);
    }

    #[test]
    fn missing_bound_value_fails_ordering() {
        let params = HashMap::new();
        let err = order_bound_values(&["missing".to_string()], &params).unwrap_err();
        assert_eq!(err.0, ErrorKind::BindFailed);
    }

    #[test]
    fn json_escape_handles_control_characters() {
        assert_eq!(json_escape("a\u{1}b"), "a\\u0001b");
        assert_eq!(json_escape("he said \"hi\""), "he said \\\"hi\\\"");
    }

    #[test]
    fn row_builder_emits_canonical_empty_array() {
        let builder = JsonRowBuilder::with_row_count_hint(0).unwrap();
        let (json, count) = builder.finish();
        assert_eq!(json, "[]");
        assert_eq!(count, 0);
    }

    #[test]
    fn row_builder_shapes_rows_in_column_order() {
        let mut builder = JsonRowBuilder::with_row_count_hint(1).unwrap();
        let cols = vec!["id".to_string(), "name".to_string()];
        builder.push_row(&cols, &[JsonCell::Integer(1), JsonCell::Text("a".to_string())]);
        let (json, count) = builder.finish();
        assert_eq!(json, r#"[{"id":1,"name":"a"}]"#);
        assert_eq!(count, 1);
    }
}
