use serde_json::Value;

/// Columns that name the sample, checked in this order.
pub const ID_COLUMNS: [&str; 4] = ["qr_code", "QR_qrCode", "id", "ID"];

const ECHO_PREFIX: &str = "echo-";

/// Canonical QR code form. Strips leading `ECHO-` prefixes (any case) and, when the rest
/// has no dash and at least 5 characters, inserts one after the leading letters
/// (`XYZ9999` -> `XYZ-9999`), or after the fourth character when the code does not start
/// with letters followed by a digit (`1234ABCD` -> `1234-ABCD`).
///
/// Idempotent: the output never starts with `ECHO-` and, unless the code is left
/// unchanged, always contains a dash.
pub fn normalize_qr(raw: &str) -> String {
    let mut code = raw.trim();
    while let Some(head) = code.get(..ECHO_PREFIX.len())
        && head.eq_ignore_ascii_case(ECHO_PREFIX)
    {
        code = code[ECHO_PREFIX.len()..].trim();
    }

    if code.contains('-') || code.chars().count() < 5 {
        return code.to_string();
    }

    let split = dash_position(code);
    // A dash at 4 would turn an `echo...` code into something that strips again.
    if code[..split].eq_ignore_ascii_case("echo") {
        return code.to_string();
    }

    format!("{}-{}", &code[..split], &code[split..])
}

fn dash_position(code: &str) -> usize {
    let letters = code
        .char_indices()
        .find(|(_, c)| !c.is_ascii_alphabetic())
        .map(|(idx, _)| idx)
        .unwrap_or(code.len());

    if letters > 0 && code[letters..].starts_with(|c: char| c.is_ascii_digit()) {
        return letters;
    }

    code.char_indices()
        .nth(4)
        .map(|(idx, _)| idx)
        .unwrap_or(code.len())
}

/// First non-empty identifier in the row, normalized.
pub fn row_identifier(row: &[(String, Value)]) -> Option<String> {
    ID_COLUMNS.iter().find_map(|id| {
        row.iter()
            .find(|(name, _)| name == id)
            .and_then(|(_, value)| cell_text(value))
            .map(|raw| normalize_qr(&raw))
            .filter(|qr| !qr.is_empty())
    })
}

pub fn is_identifier_column(name: &str) -> bool {
    ID_COLUMNS.contains(&name)
}

/// `unit...` prefix or `..._unit` suffix, any case.
pub fn is_unit_column(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.starts_with("unit") || lower.ends_with("_unit")
}

/// Unit for `column`: `<column>_unit` first, then a generic `unit` column.
pub fn paired_unit(row: &[(String, Value)], column: &str) -> Option<String> {
    let specific = format!("{column}_unit");
    row.iter()
        .find(|(name, _)| *name == specific)
        .and_then(|(_, value)| cell_text(value))
        .or_else(|| {
            row.iter()
                .find(|(name, _)| name.eq_ignore_ascii_case("unit"))
                .and_then(|(_, value)| cell_text(value))
        })
}

/// Text form of a cell; `None` for null and blank cells.
pub fn cell_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::Null => return None,
        Value::String(s) => s.trim().to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.to_string()
            } else if let Some(u) = n.as_u64() {
                u.to_string()
            } else {
                let f = n.as_f64()?;
                if f.fract() == 0.0 && f.abs() < 1e15 {
                    format!("{}", f as i64)
                } else {
                    f.to_string()
                }
            }
        }
        Value::Array(_) | Value::Object(_) => value.to_string(),
    };

    if text.is_empty() { None } else { Some(text) }
}
