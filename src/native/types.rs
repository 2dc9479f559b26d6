//! String-structured column type descriptors.
//!
//! Types arrive on the wire as strings such as `Int32`, `Array(String)`,
//! `DateTime('UTC')`, `Enum8('a' = 1, 'b' = 2)`, or
//! `Nullable(Decimal(76, 38))`. Equality between a bound column and a
//! server-echoed type is semantic, not textual: whitespace inside
//! parameterizations, `DateTime` timezone suffixes, enum definitions
//! versus their underlying integer, and decimal aliases are all
//! non-conflicting, while differing element types or bit widths conflict.

/// A column type descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ColumnType(String);

impl ColumnType {
    /// The type name up to its parameter list: `Array(String)` → `Array`.
    pub fn base(&self) -> &str {
        match self.0.find('(') {
            Some(idx) => &self.0[..idx],
            None => &self.0,
        }
    }

    /// The raw parameter list inside the outermost parentheses, if any.
    pub fn params(&self) -> Option<&str> {
        let open = self.0.find('(')?;
        let close = self.0.rfind(')')?;
        (close > open).then(|| &self.0[open + 1..close])
    }

    pub fn is_array(&self) -> bool { self.base() == "Array" }

    /// The single element type of `Array`, `Nullable`, or `LowCardinality`.
    pub fn elem(&self) -> Option<ColumnType> {
        match self.base() {
            "Array" | "Nullable" | "LowCardinality" => {
                self.params().map(|p| ColumnType::from(p.trim()))
            }
            _ => None,
        }
    }

    /// Compose this base with element types: `Map.sub(&[k, v])` → `Map(k,v)`.
    pub fn sub(&self, elems: &[ColumnType]) -> ColumnType {
        let params = elems.iter().map(|t| t.0.as_str()).collect::<Vec<_>>().join(",");
        self.with(&params)
    }

    /// Compose this base with a raw parameter string.
    pub fn with(&self, params: &str) -> ColumnType {
        ColumnType(format!("{}({params})", self.base()))
    }

    /// Whether two descriptors denote incompatible columns.
    pub fn conflicts(&self, other: &ColumnType) -> bool {
        if self == other {
            return false;
        }
        self.normalized() != other.normalized()
    }

    /// Canonical form used for conflict checks.
    fn normalized(&self) -> ColumnType {
        let base = self.base();
        match base {
            // An enum is its underlying integer for compatibility purposes.
            "Enum8" => ColumnType::from("Int8"),
            "Enum16" => ColumnType::from("Int16"),
            // The timezone argument does not change the wire format.
            "DateTime" => ColumnType::from("DateTime"),
            "DateTime64" => match self.params().map(split_params) {
                Some(params) if !params.is_empty() => {
                    ColumnType(format!("DateTime64({})", params[0].trim()))
                }
                _ => ColumnType::from("DateTime64"),
            },
            "Decimal32" | "Decimal64" | "Decimal128" | "Decimal256" => {
                let precision = match base {
                    "Decimal32" => 9,
                    "Decimal64" => 18,
                    "Decimal128" => 38,
                    _ => 76,
                };
                let scale = self
                    .params()
                    .map(|p| p.trim().to_string())
                    .unwrap_or_else(|| if base == "Decimal256" { "38".into() } else { "0".into() });
                ColumnType(format!("Decimal({precision},{scale})"))
            }
            "Array" | "Nullable" | "LowCardinality" | "Map" | "Tuple" => {
                match self.params() {
                    Some(params) => {
                        let inner = split_params(params)
                            .into_iter()
                            .map(|p| ColumnType::from(p.trim()).normalized().0)
                            .collect::<Vec<_>>()
                            .join(",");
                        ColumnType(format!("{base}({inner})"))
                    }
                    None => ColumnType::from(base),
                }
            }
            _ => match self.params() {
                Some(params) => ColumnType(format!("{base}({})", strip_spaces(params))),
                None => self.clone(),
            },
        }
    }
}

/// Split a parameter list at top-level commas, honoring nested parentheses
/// and single-quoted literals.
pub(crate) fn split_params(params: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut quoted = false;
    let mut escaped = false;
    let mut start = 0usize;
    for (i, c) in params.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if quoted => escaped = true,
            '\'' => quoted = !quoted,
            '(' if !quoted => depth += 1,
            ')' if !quoted => depth = depth.saturating_sub(1),
            ',' if !quoted && depth == 0 => {
                out.push(&params[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if !params[start..].trim().is_empty() || !out.is_empty() {
        out.push(&params[start..]);
    }
    out
}

/// Remove whitespace outside single-quoted literals.
fn strip_spaces(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut quoted = false;
    let mut escaped = false;
    for c in s.chars() {
        if escaped {
            escaped = false;
            out.push(c);
            continue;
        }
        match c {
            '\\' if quoted => {
                escaped = true;
                out.push(c);
            }
            '\'' => {
                quoted = !quoted;
                out.push(c);
            }
            c if c.is_whitespace() && !quoted => {}
            c => out.push(c),
        }
    }
    out
}

impl From<&str> for ColumnType {
    fn from(s: &str) -> Self { ColumnType(s.to_string()) }
}

impl From<String> for ColumnType {
    fn from(s: String) -> Self { ColumnType(s) }
}

impl AsRef<str> for ColumnType {
    fn as_ref(&self) -> &str { &self.0 }
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conflicts(a: &str, b: &str) -> bool {
        ColumnType::from(a).conflicts(&ColumnType::from(b))
    }

    #[test]
    fn accessors() {
        let t = ColumnType::from("Array(String)");
        assert!(t.is_array());
        assert_eq!(t.base(), "Array");
        assert_eq!(t.elem().unwrap().as_ref(), "String");

        let t = ColumnType::from("Map(String,UInt64)");
        assert_eq!(t.params(), Some("String,UInt64"));
        assert_eq!(ColumnType::from("Map").sub(&["String".into(), "UInt64".into()]), t);
        assert_eq!(ColumnType::from("FixedString").with("16").as_ref(), "FixedString(16)");
    }

    #[test]
    fn whitespace_in_params_does_not_conflict() {
        assert!(!conflicts("Map(String, String)", "Map(String,String)"));
        assert!(!conflicts("Decimal(76, 38)", "Decimal(76,38)"));
        assert!(!conflicts("Nullable( Int32 )", "Nullable(Int32)"));
    }

    #[test]
    fn datetime_timezone_does_not_conflict() {
        assert!(!conflicts("DateTime('UTC')", "DateTime"));
        assert!(!conflicts("DateTime('Europe/Berlin')", "DateTime('UTC')"));
        assert!(!conflicts("DateTime64(3, 'UTC')", "DateTime64(3)"));
        assert!(conflicts("DateTime64(3)", "DateTime64(6)"));
    }

    #[test]
    fn enums_match_their_underlying_integer() {
        assert!(!conflicts("Enum8('a' = 1, 'b' = 2)", "Enum8('x'=5)"));
        assert!(!conflicts("Enum8('a' = 1)", "Int8"));
        assert!(!conflicts("Enum16('a' = 1)", "Int16"));
        assert!(conflicts("Enum8('a' = 1)", "Enum16('a' = 1)"));
    }

    #[test]
    fn decimal_aliases_do_not_conflict() {
        assert!(!conflicts("Decimal256(38)", "Decimal(76, 38)"));
        assert!(!conflicts("Decimal256", "Decimal(76,38)"));
        assert!(!conflicts("Decimal32(4)", "Decimal(9,4)"));
        assert!(!conflicts("Decimal64(6)", "Decimal(18, 6)"));
        assert!(conflicts("Decimal32(4)", "Decimal64(4)"));
        assert!(conflicts("Decimal(9,4)", "Decimal(9,5)"));
    }

    #[test]
    fn differing_elements_and_widths_conflict() {
        assert!(conflicts("Int32", "Int64"));
        assert!(conflicts("UInt8", "Int8"));
        assert!(conflicts("Array(Int32)", "Array(String)"));
        assert!(conflicts("Nullable(Int32)", "Int32"));
        assert!(conflicts("Map(String,String)", "Map(String,UInt64)"));
    }

    #[test]
    fn nested_normalization_recurses() {
        assert!(!conflicts(
            "Nullable(Decimal(76,38))",
            "Nullable( Decimal256 )"
        ));
        assert!(!conflicts(
            "Array(Enum8('a' = 1))",
            "Array(Int8)"
        ));
        assert!(!conflicts(
            "LowCardinality(DateTime('UTC'))",
            "LowCardinality(DateTime)"
        ));
    }

    #[test]
    fn split_params_respects_nesting_and_quotes() {
        assert_eq!(split_params("String,UInt64"), vec!["String", "UInt64"]);
        assert_eq!(split_params("Map(String,String),Int8"), vec!["Map(String,String)", "Int8"]);
        assert_eq!(split_params("'a,b' = 1, 'c' = 2"), vec!["'a,b' = 1", " 'c' = 2"]);
        assert!(split_params("").is_empty());
    }
}
