use std::collections::HashMap;

use chrono::{Datelike, NaiveDate};
use uuid::Uuid;

use crate::metrics::{Metric, MetricValues};
use crate::models::{DataPoint, Demographics};
use crate::source::{RawValue, Record};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DemographicField {
    Country,
    Region,
    Sector,
    JobFunction,
    Role,
    Age,
    Gender,
    Education,
    Generation,
    Year,
    Month,
    Quarter,
    SurveyDate,
}

impl DemographicField {
    const ALIASES: [(DemographicField, &'static [&'static str]); 13] = [
        (DemographicField::Country, &["country", "country_name", "nation", "pais"]),
        (DemographicField::Region, &["region", "world_region", "area"]),
        (DemographicField::Sector, &["sector", "industry"]),
        (DemographicField::JobFunction, &["job_function", "function", "department"]),
        (DemographicField::Role, &["role", "job_role", "job_level", "position"]),
        (DemographicField::Age, &["age", "age_band", "age_group", "age_range"]),
        (DemographicField::Gender, &["gender", "sex"]),
        (DemographicField::Education, &["education", "education_level"]),
        (DemographicField::Generation, &["generation", "gen"]),
        (DemographicField::Year, &["year", "survey_year"]),
        (DemographicField::Month, &["month", "survey_month"]),
        (DemographicField::Quarter, &["quarter", "survey_quarter", "q"]),
        (DemographicField::SurveyDate, &["survey_date", "date", "completed_at", "completion_date"]),
    ];

    pub fn aliases(self) -> &'static [&'static str] {
        DemographicField::ALIASES
            .iter()
            .find(|(field, _)| *field == self)
            .map(|(_, aliases)| *aliases)
            .unwrap_or(&[])
    }
}

/// Lowercase, trim, and fold separators so `"Know Yourself"`,
/// `"know-yourself"` and `"KNOW_YOURSELF"` compare equal.
pub fn normalize_header(header: &str) -> String {
    let mut out = String::with_capacity(header.len());
    let mut last_was_sep = true;
    for ch in header.trim().chars() {
        if ch.is_alphanumeric() {
            out.extend(ch.to_lowercase());
            last_was_sep = false;
        } else if matches!(ch, ' ' | '-' | '_' | '.' | '/') && !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub point: DataPoint,
    pub has_signal: bool,
}

struct FieldLookup<'a> {
    values: HashMap<String, &'a RawValue>,
}

impl<'a> FieldLookup<'a> {
    fn new(record: &'a Record) -> Self {
        let mut values = HashMap::with_capacity(record.len());
        for (key, value) in record {
            if value.is_empty() {
                continue;
            }
            values.entry(normalize_header(key)).or_insert(value);
        }
        Self { values }
    }

    fn first<'b>(&self, aliases: impl IntoIterator<Item = &'b str>) -> Option<&'a RawValue> {
        aliases
            .into_iter()
            .find_map(|alias| self.values.get(&normalize_header(alias)).copied())
    }

    fn text(&self, field: DemographicField) -> Option<String> {
        self.first(field.aliases().iter().copied()).map(|value| match value {
            RawValue::Text(text) => text.trim().to_string(),
            RawValue::Number(n) if n.fract() == 0.0 => format!("{}", *n as i64),
            RawValue::Number(n) => n.to_string(),
            RawValue::Empty => String::new(),
        })
    }

    fn integer(&self, field: DemographicField) -> Option<i32> {
        self.first(field.aliases().iter().copied())
            .and_then(coerce_number)
            .filter(|n| n.fract() == 0.0 && n.abs() < i32::MAX as f64)
            .map(|n| n as i32)
    }
}

pub fn normalize_row(benchmark_id: Uuid, source_row: i64, record: &Record) -> Normalized {
    let lookup = FieldLookup::new(record);

    let mut metrics = MetricValues::default();
    for metric in Metric::ALL {
        let value = lookup.first(metric.aliases()).and_then(coerce_number);
        metrics.set(metric, value);
    }

    let demographics = normalize_demographics(&lookup);
    let has_signal = metrics.has_core_signal();

    Normalized {
        point: DataPoint {
            benchmark_id,
            source_row,
            demographics,
            metrics,
        },
        has_signal,
    }
}

fn normalize_demographics(lookup: &FieldLookup<'_>) -> Demographics {
    use DemographicField as F;

    let explicit_date = lookup.text(F::SurveyDate).and_then(|raw| parse_date(&raw));
    let year = lookup.integer(F::Year).filter(|y| (1900..=2200).contains(y));
    let month = lookup.integer(F::Month).filter(|m| (1..=12).contains(m));
    let quarter = lookup
        .text(F::Quarter)
        .and_then(|raw| parse_quarter(&raw));

    let survey_date = explicit_date.or_else(|| {
        year.and_then(|y| NaiveDate::from_ymd_opt(y, month.unwrap_or(1) as u32, 1))
    });

    Demographics {
        country: lookup.text(F::Country),
        region: lookup.text(F::Region),
        sector: lookup.text(F::Sector),
        job_function: lookup.text(F::JobFunction),
        role: lookup.text(F::Role),
        age: lookup.text(F::Age),
        gender: lookup.text(F::Gender),
        education: lookup.text(F::Education),
        generation: lookup.text(F::Generation),
        year: year.or_else(|| survey_date.map(|d| d.year())),
        month: month.or_else(|| survey_date.map(|d| d.month() as i32)),
        quarter: quarter.or_else(|| survey_date.map(|d| ((d.month() - 1) / 3 + 1) as i32)),
        survey_date,
    }
}

pub fn coerce_number(value: &RawValue) -> Option<f64> {
    match value {
        RawValue::Number(n) => Some(*n).filter(|n| n.is_finite()),
        RawValue::Text(text) => parse_localized(text),
        RawValue::Empty => None,
    }
}

fn parse_localized(raw: &str) -> Option<f64> {
    let compact: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, ' ' | '\u{a0}' | '\u{202f}' | '\'' | '_'))
        .collect();
    if compact.is_empty() {
        return None;
    }

    let last_comma = compact.rfind(',');
    let last_dot = compact.rfind('.');
    let canonical = match (last_comma, last_dot) {
        (Some(comma), Some(dot)) if comma > dot => compact.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => compact.replace(',', ""),
        (Some(comma), None) => {
            let decimals = compact.len() - comma - 1;
            if compact.matches(',').count() == 1 && (1..=2).contains(&decimals) {
                compact.replace(',', ".")
            } else {
                compact.replace(',', "")
            }
        }
        (None, _) => compact,
    };

    // `f64::from_str` accepts "inf" and "NaN"; only plain decimals count.
    if !canonical
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E'))
    {
        return None;
    }
    canonical.parse::<f64>().ok().filter(|n| n.is_finite())
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    let head = raw.get(..10).unwrap_or(raw);
    ["%Y-%m-%d", "%Y/%m/%d", "%d/%m/%Y", "%d.%m.%Y"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(head, fmt).ok())
}

fn parse_quarter(raw: &str) -> Option<i32> {
    let digits = raw.trim().trim_start_matches(['Q', 'q']);
    digits.parse::<i32>().ok().filter(|q| (1..=4).contains(q))
}
