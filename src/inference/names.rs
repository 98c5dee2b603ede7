//! Slot-name templating
//!
//! Templates are printf-style with exactly one integer conversion, e.g.
//! `"past_key_values.%d.key"`.

use crate::error::{Error, Result};

/// Formatted names must be strictly shorter than this many bytes.
pub const MAX_KV_NAME_LENGTH: usize = 64;

/// Format `template` for layer `index`.
///
/// Accepts one `%d` or `%i` conversion and any number of `%%` escapes.
pub fn compose_kv_name(template: &str, index: usize) -> Result<String> {
    let fail = |reason: String| Error::NameTemplate {
        template: template.to_string(),
        reason,
    };

    let mut out = String::with_capacity(template.len() + 4);
    let mut conversions = 0usize;
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => out.push('%'),
            Some('d' | 'i') => {
                conversions += 1;
                out.push_str(&index.to_string());
            }
            Some(other) => return Err(fail(format!("unsupported conversion '%{other}'"))),
            None => return Err(fail("template ends with a lone '%'".into())),
        }
    }

    if conversions != 1 {
        return Err(fail(format!(
            "expected exactly one integer conversion, found {conversions}"
        )));
    }
    if out.len() >= MAX_KV_NAME_LENGTH {
        return Err(fail(format!(
            "name '{out}' is {} bytes, limit is {}",
            out.len(),
            MAX_KV_NAME_LENGTH - 1
        )));
    }
    Ok(out)
}

/// Format `template` for layers `0..layers`.
pub(crate) fn compose_layer_names(template: &str, layers: usize) -> Result<Vec<String>> {
    (0..layers).map(|i| compose_kv_name(template, i)).collect()
}
