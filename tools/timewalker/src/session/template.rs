//! `{{name}}` variable templates.

use std::collections::BTreeMap;

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Piece<'a> {
    Text(&'a str),
    Var(&'a str),
}

fn parse(text: &str) -> Result<Vec<Piece<'_>>, String> {
    let mut pieces = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find("{{") {
        if open > 0 {
            pieces.push(Piece::Text(&rest[..open]));
        }
        let after = &rest[open + 2..];
        let close = after
            .find("}}")
            .ok_or_else(|| format!("unterminated `{{{{` in {text:?}"))?;
        let name = after[..close].trim();
        if !is_valid_name(name) {
            return Err(format!("invalid variable reference `{{{{{}}}}}`", &after[..close]));
        }
        pieces.push(Piece::Var(name));
        rest = &after[close + 2..];
    }
    if !rest.is_empty() {
        pieces.push(Piece::Text(rest));
    }
    Ok(pieces)
}

/// Names referenced by `text`, in order of appearance.
pub fn references(text: &str) -> Result<Vec<String>, String> {
    Ok(parse(text)?
        .into_iter()
        .filter_map(|piece| match piece {
            Piece::Var(name) => Some(name.to_string()),
            Piece::Text(_) => None,
        })
        .collect())
}

/// Substitutes every reference. Unknown names are an error naming the variable.
pub fn render(text: &str, vars: &BTreeMap<String, String>) -> Result<String, String> {
    let mut out = String::with_capacity(text.len());
    for piece in parse(text)? {
        match piece {
            Piece::Text(chunk) => out.push_str(chunk),
            Piece::Var(name) => {
                let value = vars
                    .get(name)
                    .ok_or_else(|| format!("unresolved variable `{name}`"))?;
                out.push_str(value);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("name".to_string(), "world".to_string()),
            ("run_id".to_string(), "r1".to_string()),
        ])
    }

    #[test]
    fn renders_references_with_optional_spaces() {
        assert_eq!(
            render("hello {{name}} from {{ run_id }}", &vars()).expect("render"),
            "hello world from r1"
        );
        assert_eq!(render("no templates", &vars()).expect("render"), "no templates");
    }

    #[test]
    fn unresolved_and_malformed_references_fail() {
        assert_eq!(
            render("{{missing}}", &vars()),
            Err("unresolved variable `missing`".to_string())
        );
        assert!(references("{{open").is_err());
        assert!(references("{{1bad}}").is_err());
        assert_eq!(
            references("a {{x}} b {{y_2}}").expect("refs"),
            vec!["x".to_string(), "y_2".to_string()]
        );
    }
}
