//! Variable engine: extraction from responses and `[[name]]` substitution
//! into request templates.
//!
//! Both halves are pure functions of their inputs. Persisting extracted
//! values is the workflow executor's job.
use once_cell::sync::Lazy;
use rand::distributions::Alphanumeric;
use rand::Rng;
use regex::{Captures, Regex};
use std::collections::HashMap;
use tracing::warn;

use crate::http::{RequestTemplate, SetCookie};
use crate::model::{header_value, ExtractMethod, Header, Variable, VariableSource};

/// Variable values shared across workflow steps.
pub type Context = HashMap<String, String>;

static PLACEHOLDER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[\[(\w+)\]\]").expect("placeholder regex"));

static PATH_SEGMENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\w+)\[(\d+)\]$").expect("path segment regex"));

const DEFAULT_STRING_LENGTH: i64 = 16;
const DEFAULT_NUMBER_LENGTH: i64 = 10;

/// Extract a variable's value from a response.
///
/// Returns `None` when the source material is missing or the pattern
/// doesn't match; extraction failures never panic and never error.
pub fn extract(
    variable: &Variable,
    body: Option<&str>,
    headers: Option<&[Header]>,
    cookies: Option<&[SetCookie]>,
) -> Option<String> {
    match variable.source {
        VariableSource::Static => variable.static_value.clone(),

        VariableSource::Random => match variable.extract_method {
            ExtractMethod::RandomString => Some(random_string(
                variable.random_length.unwrap_or(DEFAULT_STRING_LENGTH),
                variable.random_format.as_deref(),
            )),
            ExtractMethod::RandomNumber => Some(random_number(
                variable.random_length.unwrap_or(DEFAULT_NUMBER_LENGTH),
                variable.random_format.as_deref(),
            )),
            ExtractMethod::RandomUuid => Some(uuid::Uuid::new_v4().to_string()),
            _ => None,
        },

        VariableSource::ResponseBody => {
            let body = body?;

            match variable.extract_method {
                ExtractMethod::FullBody => Some(body.to_string()),
                ExtractMethod::JsonPath => {
                    json_path(body, variable.extract_pattern.as_deref()?)
                }
                ExtractMethod::Regex => regex_capture(body, variable.extract_pattern.as_deref()?),
                _ => None,
            }
        }

        VariableSource::ResponseHeader => {
            let headers = headers?;
            let name = variable.extract_pattern.as_deref()?;
            header_value(headers, name).map(|value| value.to_string())
        }

        VariableSource::Cookie => {
            let cookies = cookies?;
            let name = variable.extract_pattern.as_deref()?;
            cookies
                .iter()
                .find(|cookie| cookie.name == name)
                .map(|cookie| cookie.value.clone())
        }
    }
}

/// Walk a JSON body along a dot-separated path with optional `[index]`
/// segments, e.g. `data.items[0].token`.
pub fn json_path(body: &str, path: &str) -> Option<String> {
    let data: serde_json::Value = serde_json::from_str(body).ok()?;
    let mut value = &data;

    for segment in path.split('.') {
        value = match PATH_SEGMENT_RE.captures(segment) {
            Some(caps) => {
                let index = caps[2].parse::<usize>().ok()?;
                value.get(&caps[1])?.get(index)?
            }
            None => value.get(segment)?,
        };
    }

    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(text) => Some(text.clone()),
        other => Some(other.to_string()),
    }
}

/// First regex match: capture group 1 if the pattern has one, else the
/// whole match.
pub fn regex_capture(text: &str, pattern: &str) -> Option<String> {
    let re = match Regex::new(pattern) {
        Ok(re) => re,
        Err(err) => {
            warn!("invalid extraction pattern \"{}\": {}", pattern, err);
            return None;
        }
    };

    let caps = re.captures(text)?;

    match caps.get(1) {
        Some(group) => Some(group.as_str().to_string()),
        None => Some(caps[0].to_string()),
    }
}

/// Random string. With a format, each char maps: `a` → lowercase letter,
/// `A` → uppercase letter, `n`/`#` → digit, anything else copies
/// literally. Without one, alphanumeric of the given length.
pub fn random_string(length: i64, format: Option<&str>) -> String {
    let mut rng = rand::thread_rng();

    match format {
        Some(format) => format
            .chars()
            .map(|c| match c {
                'a' => rng.gen_range(b'a'..=b'z') as char,
                'A' => rng.gen_range(b'A'..=b'Z') as char,
                'n' | '#' => rng.gen_range(b'0'..=b'9') as char,
                other => other,
            })
            .collect(),
        None => (&mut rng)
            .sample_iter(Alphanumeric)
            .take(length.max(0) as usize)
            .map(char::from)
            .collect(),
    }
}

/// Random digit string. With a format, `#` maps to a digit and anything
/// else copies literally.
pub fn random_number(length: i64, format: Option<&str>) -> String {
    let mut rng = rand::thread_rng();

    match format {
        Some(format) => format
            .chars()
            .map(|c| match c {
                '#' => rng.gen_range(b'0'..=b'9') as char,
                other => other,
            })
            .collect(),
        None => (0..length.max(0))
            .map(|_| rng.gen_range(b'0'..=b'9') as char)
            .collect(),
    }
}

/// Replace every `[[name]]` placeholder with its context value. Unknown
/// placeholders are left intact.
pub fn substitute(text: &str, context: &Context) -> String {
    PLACEHOLDER_RE
        .replace_all(text, |caps: &Captures| match context.get(&caps[1]) {
            Some(value) => value.clone(),
            None => {
                warn!("variable \"[[{}]]\" not found, leaving as-is", &caps[1]);
                caps[0].to_string()
            }
        })
        .into_owned()
}

/// Apply substitution over a request template: url, header values, and
/// UTF-8 bodies. Binary bodies pass through untouched.
pub fn substitute_template(template: &RequestTemplate, context: &Context) -> RequestTemplate {
    let headers = template
        .headers
        .iter()
        .map(|header| Header::new(header.name.clone(), substitute(&header.value, context)))
        .collect();

    let body = template.body.as_ref().map(|body| {
        match std::str::from_utf8(body) {
            Ok(text) => substitute(text, context).into_bytes(),
            Err(_) => body.clone(),
        }
    });

    RequestTemplate {
        url: substitute(&template.url, context),
        method: template.method,
        headers,
        body,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::{HttpMethod, VariableSource};
    use time::OffsetDateTime;

    fn variable(source: VariableSource, method: ExtractMethod) -> Variable {
        Variable {
            id: 1,
            workflow_id: 1,
            name: "var".into(),
            source,
            extract_method: method,
            extract_pattern: None,
            random_length: None,
            random_format: None,
            static_value: None,
            current_value: None,
            last_extracted_at: None,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn test_static_ignores_inputs() {
        let mut var = variable(VariableSource::Static, ExtractMethod::FullBody);
        var.static_value = Some("seed".into());

        // Static value comes back no matter what else is present.
        assert_eq!(
            extract(&var, Some("{\"a\":1}"), None, None),
            Some("seed".into())
        );
        assert_eq!(extract(&var, None, None, None), Some("seed".into()));
    }

    #[test]
    fn test_json_path() {
        let body = r#"{"data":{"items":[{"token":"T42"},{"token":"T43"}],"count":2}}"#;

        assert_eq!(json_path(body, "data.items[0].token"), Some("T42".into()));
        assert_eq!(json_path(body, "data.items[1].token"), Some("T43".into()));
        assert_eq!(json_path(body, "data.count"), Some("2".into()));
        assert_eq!(json_path(body, "data.items[5].token"), None);
        assert_eq!(json_path(body, "data.missing"), None);
        assert_eq!(json_path("not json", "a"), None);
        assert_eq!(json_path(r#"{"a":null}"#, "a"), None);
    }

    #[test]
    fn test_regex_capture() {
        let body = r#"{"token": "abc123", "other": 1}"#;

        assert_eq!(
            regex_capture(body, r#""token":\s*"([^"]+)""#),
            Some("abc123".into())
        );
        // No capture group returns the full match.
        assert_eq!(regex_capture("Bearer xyz", r"Bearer \S+"), Some("Bearer xyz".into()));
        assert_eq!(regex_capture(body, r#""nope":"(\w+)""#), None);
        // Invalid patterns are a miss, not a panic.
        assert_eq!(regex_capture(body, "("), None);
    }

    #[test]
    fn test_random_formats() {
        let formatted = random_string(0, Some("AAA-nnn-aaa"));
        assert_eq!(formatted.len(), 11);
        assert!(formatted[0..3].chars().all(|c| c.is_ascii_uppercase()));
        assert_eq!(&formatted[3..4], "-");
        assert!(formatted[4..7].chars().all(|c| c.is_ascii_digit()));
        assert!(formatted[8..11].chars().all(|c| c.is_ascii_lowercase()));

        assert_eq!(random_string(16, None).len(), 16);

        let number = random_number(0, Some("###-##"));
        assert_eq!(number.len(), 6);
        assert!(number[0..3].chars().all(|c| c.is_ascii_digit()));
        assert_eq!(&number[3..4], "-");

        assert!(random_number(10, None).chars().all(|c| c.is_ascii_digit()));
        assert_eq!(random_number(10, None).len(), 10);
    }

    #[test]
    fn test_random_uuid() {
        let mut var = variable(VariableSource::Random, ExtractMethod::RandomUuid);
        var.random_length = None;

        let value = extract(&var, None, None, None).unwrap();
        assert!(uuid::Uuid::parse_str(&value).is_ok());
    }

    #[test]
    fn test_header_and_cookie_lookup() {
        let headers = vec![Header::new("X-Auth-Token", "secret")];
        let cookies = vec![SetCookie::parse("sid=ABC").unwrap()];

        let mut var = variable(VariableSource::ResponseHeader, ExtractMethod::HeaderValue);
        var.extract_pattern = Some("x-auth-token".into());
        assert_eq!(
            extract(&var, None, Some(&headers), None),
            Some("secret".into())
        );

        let mut var = variable(VariableSource::Cookie, ExtractMethod::CookieValue);
        var.extract_pattern = Some("sid".into());
        assert_eq!(
            extract(&var, None, None, Some(&cookies)),
            Some("ABC".into())
        );

        // Cookie lookup is case-sensitive.
        var.extract_pattern = Some("SID".into());
        assert_eq!(extract(&var, None, None, Some(&cookies)), None);
    }

    #[test]
    fn test_substitute() {
        let mut context = Context::new();
        context.insert("auth".into(), "T42".into());

        assert_eq!(
            substitute(r#"{"k":"[[auth]]"}"#, &context),
            r#"{"k":"T42"}"#
        );
        // Unknown placeholders stay as-is.
        assert_eq!(substitute("[[missing]]", &context), "[[missing]]");
        // No placeholders, empty context: identity.
        assert_eq!(substitute("plain text", &Context::new()), "plain text");
    }

    #[test]
    fn test_substitute_template() {
        let mut context = Context::new();
        context.insert("token".into(), "xyz".into());
        context.insert("id".into(), "7".into());

        let template = RequestTemplate {
            url: "https://api.example.com/items/[[id]]".into(),
            method: HttpMethod::Post,
            headers: vec![Header::new("Authorization", "Bearer [[token]]")],
            body: Some(br#"{"item":"[[id]]"}"#.to_vec()),
        };

        let resolved = substitute_template(&template, &context);
        assert_eq!(resolved.url, "https://api.example.com/items/7");
        assert_eq!(resolved.headers[0].value, "Bearer xyz");
        assert_eq!(resolved.body.unwrap(), br#"{"item":"7"}"#.to_vec());

        // Binary bodies are passed through.
        let binary = RequestTemplate {
            url: "https://example.com".into(),
            method: HttpMethod::Post,
            headers: vec![],
            body: Some(vec![0u8, 159, 146, 150]),
        };
        let resolved = substitute_template(&binary, &context);
        assert_eq!(resolved.body.unwrap(), vec![0u8, 159, 146, 150]);
    }
}
