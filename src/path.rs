//! Dotted/indexed path lookup over JSON values.
//!
//! A path is a `.`-separated list of segments. Each segment is an
//! object key, optionally followed by one or more `[n]` array
//! indexes (`data.list[0].name`), or a bare number that indexes into
//! an array (`data.list.0.name`). A leading `$.` root marker is
//! ignored. Misses never error; they yield `None`.

use serde_json::Value;

/// Walk `data` along `path`. An empty path returns `data` itself.
pub fn extract<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    let path = strip_root(path.trim());
    let mut current = data;

    for part in path.split('.') {
        if part.is_empty() {
            continue;
        }

        let (name, indexes) = parse_segment(part)?;

        if !name.is_empty() {
            current = match current {
                Value::Object(map) => map.get(name)?,
                Value::Array(array) => {
                    let index = name.parse::<usize>().ok()?;
                    array.get(index)?
                }
                _ => return None,
            };
        }

        for index in indexes {
            current = current.as_array()?.get(index)?;
        }
    }

    Some(current)
}

/// Owned variant of [`extract`]: misses become `Value::Null`.
pub fn lookup(data: &Value, path: &str) -> Value {
    extract(data, path).cloned().unwrap_or(Value::Null)
}

fn strip_root(path: &str) -> &str {
    if path == "$" {
        ""
    } else {
        path.strip_prefix("$.").unwrap_or(path)
    }
}

/// Split `name[1][2]` into `("name", [1, 2])`. Malformed index
/// suffixes make the whole path unresolvable.
fn parse_segment(part: &str) -> Option<(&str, Vec<usize>)> {
    let Some(open) = part.find('[') else {
        return Some((part, Vec::new()));
    };

    let name = &part[..open];
    let mut indexes = Vec::new();
    let mut rest = &part[open..];

    while !rest.is_empty() {
        let inner = rest.strip_prefix('[')?;
        let close = inner.find(']')?;
        indexes.push(inner[..close].trim().parse::<usize>().ok()?);
        rest = &inner[close + 1..];
    }

    Some((name, indexes))
}
