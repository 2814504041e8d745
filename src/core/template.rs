//! Parameter templating - renders run-scoped variables into operator config
//!
//! Placeholders are `{name}`. `{{` and `}}` produce literal braces, and a
//! lone brace of either kind is an error. Rendering happens when a task
//! executes, so values always reflect the current run.

use crate::error::TemplateError;
use chrono::{DateTime, Datelike, Timelike, Utc};
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

/// Template variables visible to a run
pub type Variables = HashMap<String, String>;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{|\}\}|\{([^{}]*)\}|\{|\}").expect("static regex"))
}

fn name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static regex"))
}

/// Render `template`, failing on any variable not present in `vars`
pub fn render(template: &str, vars: &Variables) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;

    for caps in placeholder_re().captures_iter(template) {
        let whole = caps.get(0).expect("group 0 always present");
        out.push_str(&template[last..whole.start()]);
        last = whole.end();

        match whole.as_str() {
            "{{" => out.push('{'),
            "}}" => out.push('}'),
            "}" => {
                return Err(TemplateError::Malformed {
                    placeholder: template[whole.start()..].to_string(),
                    template: template.to_string(),
                });
            }
            _ => {
                let Some(name) = caps.get(1) else {
                    // unclosed `{`
                    return Err(TemplateError::Malformed {
                        placeholder: template[whole.start()..].to_string(),
                        template: template.to_string(),
                    });
                };
                let name = name.as_str().trim();
                if !name_re().is_match(name) {
                    return Err(TemplateError::Malformed {
                        placeholder: whole.as_str().to_string(),
                        template: template.to_string(),
                    });
                }
                let value = vars.get(name).ok_or_else(|| TemplateError::UnknownVariable {
                    name: name.to_string(),
                    template: template.to_string(),
                })?;
                out.push_str(value);
            }
        }
    }

    out.push_str(&template[last..]);
    Ok(out)
}

/// Variables derived from the run's logical time
pub fn builtin_variables(logical_time: DateTime<Utc>, run_id: &str) -> Variables {
    let date = logical_time.format("%Y-%m-%d").to_string();
    let mut vars = Variables::new();
    vars.insert("execution_date".to_string(), date.clone());
    vars.insert("ds".to_string(), date);
    vars.insert(
        "ds_nodash".to_string(),
        logical_time.format("%Y%m%d").to_string(),
    );
    vars.insert("ts".to_string(), logical_time.to_rfc3339());
    vars.insert("year".to_string(), logical_time.year().to_string());
    vars.insert("month".to_string(), format!("{:02}", logical_time.month()));
    vars.insert("day".to_string(), format!("{:02}", logical_time.day()));
    vars.insert("hour".to_string(), format!("{:02}", logical_time.hour()));
    vars.insert("run_id".to_string(), run_id.to_string());
    vars
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn vars(pairs: &[(&str, &str)]) -> Variables {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_render_execution_date() {
        let v = vars(&[("execution_date", "2024-01-01")]);
        assert_eq!(
            render("log-data/{execution_date}", &v).unwrap(),
            "log-data/2024-01-01"
        );
    }

    #[test]
    fn test_unknown_variable_fails() {
        let v = vars(&[("execution_date", "2024-01-01")]);
        let err = render("log-data/{partition}", &v).unwrap_err();
        assert!(matches!(
            err,
            TemplateError::UnknownVariable { ref name, .. } if name == "partition"
        ));
    }

    #[test]
    fn test_escaped_braces() {
        let v = vars(&[("x", "1")]);
        assert_eq!(render("{{x}} = {x}", &v).unwrap(), "{x} = 1");
        assert_eq!(render("no placeholders", &v).unwrap(), "no placeholders");
    }

    #[test]
    fn test_malformed_placeholders() {
        let v = vars(&[("x", "1")]);
        assert!(matches!(
            render("{x", &v),
            Err(TemplateError::Malformed { .. })
        ));
        assert!(matches!(
            render("{not a name}", &v),
            Err(TemplateError::Malformed { .. })
        ));
        // a stray closing brace is as much a typo as a stray opening one
        assert!(matches!(
            render("x}", &v),
            Err(TemplateError::Malformed { placeholder, .. }) if placeholder == "}"
        ));
        assert!(matches!(
            render("{x}}", &v),
            Err(TemplateError::Malformed { .. })
        ));
        assert_eq!(render("{{x}}={x}", &v).unwrap(), "{x}=1");
    }

    #[test]
    fn test_builtin_variables() {
        let t = Utc.with_ymd_and_hms(2024, 3, 7, 5, 0, 0).unwrap();
        let v = builtin_variables(t, "run-1");
        assert_eq!(v["execution_date"], "2024-03-07");
        assert_eq!(v["ds_nodash"], "20240307");
        assert_eq!(v["month"], "03");
        assert_eq!(v["hour"], "05");
        assert_eq!(
            render("song-data/{year}/{month}/", &v).unwrap(),
            "song-data/2024/03/"
        );
    }
}
