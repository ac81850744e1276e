use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::models::{DataPoint, Demographics};
use crate::normalize::normalize_header;

/// Upper bound used for open-ended age bands such as `"65+"`.
const MAX_AGE: u32 = 99;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentField {
    Country,
    Region,
    Sector,
    JobFunction,
    Role,
    Age,
    Gender,
    Education,
    Generation,
    Month,
    Quarter,
}

impl SegmentField {
    pub fn column(self) -> &'static str {
        match self {
            SegmentField::Country => "country",
            SegmentField::Region => "region",
            SegmentField::Sector => "sector",
            SegmentField::JobFunction => "job_function",
            SegmentField::Role => "role",
            SegmentField::Age => "age",
            SegmentField::Gender => "gender",
            SegmentField::Education => "education",
            SegmentField::Generation => "generation",
            SegmentField::Month => "month",
            SegmentField::Quarter => "quarter",
        }
    }

    fn value_of(self, d: &Demographics) -> Option<FilterValue> {
        let text = |v: &Option<String>| v.clone().map(FilterValue::Text);
        match self {
            SegmentField::Country => text(&d.country),
            SegmentField::Region => text(&d.region),
            SegmentField::Sector => text(&d.sector),
            SegmentField::JobFunction => text(&d.job_function),
            SegmentField::Role => text(&d.role),
            SegmentField::Age => text(&d.age),
            SegmentField::Gender => text(&d.gender),
            SegmentField::Education => text(&d.education),
            SegmentField::Generation => text(&d.generation),
            SegmentField::Month => d.month.map(FilterValue::Int),
            SegmentField::Quarter => d.quarter.map(FilterValue::Int),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterValue {
    Text(String),
    Int(i32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    Equals { field: SegmentField, value: FilterValue },
    AnyOf { field: SegmentField, values: Vec<String> },
    /// Half-open `[start, end)` on the survey date.
    DateRange { start: NaiveDate, end: NaiveDate },
}

impl Condition {
    pub fn matches(&self, point: &DataPoint) -> bool {
        let d = &point.demographics;
        match self {
            Condition::Equals { field, value } => field.value_of(d).as_ref() == Some(value),
            Condition::AnyOf { field, values } => match field.value_of(d) {
                Some(FilterValue::Text(actual)) => values.iter().any(|v| *v == actual),
                _ => false,
            },
            Condition::DateRange { start, end } => d
                .survey_date
                .is_some_and(|date| date >= *start && date < *end),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sector: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_function: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age_range: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub education: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub month: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quarter: Option<i32>,
}

impl SegmentFilter {
    pub fn conditions(&self) -> Result<Vec<Condition>> {
        let mut conditions = Vec::new();
        let exact = [
            (SegmentField::Country, &self.country),
            (SegmentField::Region, &self.region),
            (SegmentField::Sector, &self.sector),
            (SegmentField::JobFunction, &self.job_function),
            (SegmentField::Role, &self.role),
            (SegmentField::Age, &self.age),
            (SegmentField::Gender, &self.gender),
            (SegmentField::Education, &self.education),
            (SegmentField::Generation, &self.generation),
        ];
        for (field, value) in exact {
            if let Some(value) = value {
                conditions.push(Condition::Equals {
                    field,
                    value: FilterValue::Text(value.clone()),
                });
            }
        }
        for (field, value) in [
            (SegmentField::Month, self.month),
            (SegmentField::Quarter, self.quarter),
        ] {
            if let Some(value) = value {
                conditions.push(Condition::Equals {
                    field,
                    value: FilterValue::Int(value),
                });
            }
        }
        if let Some(range) = &self.age_range {
            conditions.push(Condition::AnyOf {
                field: SegmentField::Age,
                values: expand_age_range(range)?,
            });
        }
        if let Some(year) = self.year {
            let (start, end) = year_bounds(year)?;
            conditions.push(Condition::DateRange { start, end });
        }
        Ok(conditions)
    }

    fn set(&mut self, key: &str, value: &str) -> std::result::Result<(), String> {
        let value = value.trim().to_string();
        let int = |v: &str| v.parse::<i32>().map_err(|_| format!("'{v}' is not a whole number"));
        match normalize_header(key).as_str() {
            "country" => self.country = Some(value),
            "region" => self.region = Some(value),
            "sector" => self.sector = Some(value),
            "job_function" | "function" => self.job_function = Some(value),
            "role" => self.role = Some(value),
            "age" => self.age = Some(value),
            "age_range" => self.age_range = Some(value),
            "gender" => self.gender = Some(value),
            "education" => self.education = Some(value),
            "generation" => self.generation = Some(value),
            "year" => self.year = Some(int(&value)?),
            "month" => self.month = Some(int(&value)?),
            "quarter" => self.quarter = Some(int(value.trim_start_matches(['Q', 'q']))?),
            other => return Err(format!("unknown filter field '{other}'")),
        }
        Ok(())
    }
}

/// `"25-29"` → `["25", "26", "27", "28", "29"]`; `"65+"` runs to the age cap.
pub fn expand_age_range(range: &str) -> Result<Vec<String>> {
    let invalid = |reason: &str| EngineError::InvalidSegment {
        segment: range.to_string(),
        reason: reason.to_string(),
    };
    let trimmed = range.trim();
    let (low, high) = if let Some(open) = trimmed.strip_suffix('+') {
        (open.trim(), None)
    } else {
        let (low, high) = trimmed
            .split_once('-')
            .ok_or_else(|| invalid("age range must look like 25-29 or 65+"))?;
        (low.trim(), Some(high.trim()))
    };
    let low: u32 = low.parse().map_err(|_| invalid("age bounds must be whole numbers"))?;
    let high: u32 = match high {
        Some(high) => high
            .parse()
            .map_err(|_| invalid("age bounds must be whole numbers"))?,
        None => MAX_AGE.max(low),
    };
    if low > high {
        return Err(invalid("lower bound exceeds upper bound"));
    }
    Ok((low..=high).map(|age| age.to_string()).collect())
}

pub fn year_bounds(year: i32) -> Result<(NaiveDate, NaiveDate)> {
    let start = NaiveDate::from_ymd_opt(year, 1, 1);
    let end = year.checked_add(1).and_then(|next| NaiveDate::from_ymd_opt(next, 1, 1));
    start.zip(end).ok_or_else(|| EngineError::InvalidSegment {
        segment: year.to_string(),
        reason: "year out of range".into(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Segment {
    pub name: String,
    #[serde(default)]
    pub filter: SegmentFilter,
}

impl Segment {
    pub fn new(name: impl Into<String>, filter: SegmentFilter) -> Self {
        Self {
            name: name.into(),
            filter,
        }
    }
}

impl FromStr for Segment {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        let (name, spec) = s.split_once(':').unwrap_or((s, ""));
        let name = name.trim();
        let invalid = |reason: String| EngineError::InvalidSegment {
            segment: s.to_string(),
            reason,
        };
        if name.is_empty() {
            return Err(invalid("segment name is empty".into()));
        }
        let mut filter = SegmentFilter::default();
        for pair in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| invalid(format!("expected key=value, got '{pair}'")))?;
            filter.set(key, value).map_err(invalid)?;
        }
        filter.conditions()?;
        Ok(Segment::new(name, filter))
    }
}

impl FromStr for SegmentFilter {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(format!("filter:{s}").parse::<Segment>()?.filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricValues;
    use uuid::Uuid;

    fn point_with(demographics: Demographics) -> DataPoint {
        DataPoint {
            benchmark_id: Uuid::nil(),
            source_row: 0,
            demographics,
            metrics: MetricValues::default(),
        }
    }

    fn aged(age: &str) -> DataPoint {
        point_with(Demographics {
            age: Some(age.to_string()),
            ..Demographics::default()
        })
    }

    #[test]
    fn age_range_expands_to_discrete_tokens() {
        assert_eq!(expand_age_range("25-29").unwrap(), vec!["25", "26", "27", "28", "29"]);
        assert_eq!(expand_age_range("65+").unwrap().len(), 35);
        assert!(expand_age_range("30-20").is_err());
        assert!(expand_age_range("young").is_err());
    }

    #[test]
    fn age_range_filter_matches_only_the_span() {
        let filter: SegmentFilter = "age_range=25-29".parse().unwrap();
        let conditions = filter.conditions().unwrap();
        let matches = |age: &str| conditions.iter().all(|c| c.matches(&aged(age)));
        for age in ["25", "26", "27", "28", "29"] {
            assert!(matches(age), "{age} should match");
        }
        for age in ["24", "30", "250", "25-29"] {
            assert!(!matches(age), "{age} should not match");
        }
    }

    #[test]
    fn year_filter_is_half_open() {
        let conditions = SegmentFilter {
            year: Some(2024),
            ..SegmentFilter::default()
        }
        .conditions()
        .unwrap();
        let dated = |y, m, d| {
            point_with(Demographics {
                survey_date: NaiveDate::from_ymd_opt(y, m, d),
                ..Demographics::default()
            })
        };
        assert!(conditions[0].matches(&dated(2024, 1, 1)));
        assert!(conditions[0].matches(&dated(2024, 12, 31)));
        assert!(!conditions[0].matches(&dated(2025, 1, 1)));
        assert!(!conditions[0].matches(&dated(2023, 12, 31)));
        assert!(!conditions[0].matches(&point_with(Demographics::default())));
    }

    #[test]
    fn parses_named_segments() {
        let segment: Segment = "EU:region=Europe, quarter=Q2".parse().unwrap();
        assert_eq!(segment.name, "EU");
        assert_eq!(segment.filter.region.as_deref(), Some("Europe"));
        assert_eq!(segment.filter.quarter, Some(2));

        let all: Segment = "Everyone".parse().unwrap();
        assert_eq!(all.filter, SegmentFilter::default());

        assert!("EU:planet=Mars".parse::<Segment>().is_err());
        assert!("EU:age_range=old".parse::<Segment>().is_err());
        assert!(":region=EU".parse::<Segment>().is_err());
    }

    #[test]
    fn exact_match_is_case_sensitive_and_total() {
        let conditions = SegmentFilter {
            country: Some("Italy".into()),
            month: Some(3),
            ..SegmentFilter::default()
        }
        .conditions()
        .unwrap();
        let point = point_with(Demographics {
            country: Some("Italy".into()),
            month: Some(3),
            ..Demographics::default()
        });
        assert!(conditions.iter().all(|c| c.matches(&point)));

        let other = point_with(Demographics {
            country: Some("italy".into()),
            month: Some(3),
            ..Demographics::default()
        });
        assert!(!conditions.iter().all(|c| c.matches(&other)));
    }

    #[test]
    fn filter_json_round_trip_omits_unset_fields() {
        let filter = SegmentFilter {
            region: Some("LatAm".into()),
            year: Some(2024),
            ..SegmentFilter::default()
        };
        let json = serde_json::to_value(&filter).unwrap();
        assert_eq!(json, serde_json::json!({"region": "LatAm", "year": 2024}));
    }
}
