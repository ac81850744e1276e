use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricCategory {
    Core,
    Outcome,
    Talent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Metric {
    EqTotal,
    Know,
    Choose,
    Give,
    EmotionalLiteracy,
    RecognizePatterns,
    ConsequentialThinking,
    NavigateEmotions,
    IntrinsicMotivation,
    Optimism,
    Empathy,
    NobleGoals,
    Effectiveness,
    Relationships,
    QualityOfLife,
    Wellbeing,
    Influence,
    DecisionMaking,
    Community,
    Network,
    Achievement,
    Satisfaction,
    Balance,
    Health,
    DataMining,
    Modeling,
    Prioritizing,
    Connection,
    EmotionalInsight,
    Collaboration,
}

struct MetricDef {
    key: &'static str,
    column: &'static str,
    label: &'static str,
    category: MetricCategory,
    aliases: &'static [&'static str],
}

use MetricCategory::{Core, Outcome, Talent};

// Indexed by `Metric as usize`; keep in declaration order.
const DEFS: [MetricDef; Metric::COUNT] = [
    MetricDef { key: "EQ", column: "eq_total", label: "Total EQ", category: Core, aliases: &["eq_total", "total_eq", "eq_score", "sei_total", "total"] },
    MetricDef { key: "K", column: "know_yourself", label: "Know Yourself", category: Core, aliases: &["know_yourself", "knowyourself", "know"] },
    MetricDef { key: "C", column: "choose_yourself", label: "Choose Yourself", category: Core, aliases: &["choose_yourself", "chooseyourself", "choose"] },
    MetricDef { key: "G", column: "give_yourself", label: "Give Yourself", category: Core, aliases: &["give_yourself", "giveyourself", "give"] },
    MetricDef { key: "EL", column: "emotional_literacy", label: "Enhance Emotional Literacy", category: Core, aliases: &["emotional_literacy", "enhance_emotional_literacy"] },
    MetricDef { key: "RP", column: "recognize_patterns", label: "Recognize Patterns", category: Core, aliases: &["recognize_patterns", "recognise_patterns"] },
    MetricDef { key: "ACT", column: "consequential_thinking", label: "Apply Consequential Thinking", category: Core, aliases: &["consequential_thinking", "apply_consequential_thinking", "ct"] },
    MetricDef { key: "NE", column: "navigate_emotions", label: "Navigate Emotions", category: Core, aliases: &["navigate_emotions"] },
    MetricDef { key: "IM", column: "intrinsic_motivation", label: "Engage Intrinsic Motivation", category: Core, aliases: &["intrinsic_motivation", "engage_intrinsic_motivation"] },
    MetricDef { key: "OP", column: "optimism", label: "Exercise Optimism", category: Core, aliases: &["optimism", "exercise_optimism", "eo"] },
    MetricDef { key: "EMP", column: "empathy", label: "Increase Empathy", category: Core, aliases: &["empathy", "increase_empathy", "ie"] },
    MetricDef { key: "NG", column: "noble_goals", label: "Pursue Noble Goals", category: Core, aliases: &["noble_goals", "pursue_noble_goals", "png"] },
    MetricDef { key: "effectiveness", column: "effectiveness", label: "Effectiveness", category: Outcome, aliases: &["effectiveness", "eff"] },
    MetricDef { key: "relationships", column: "relationships", label: "Relationships", category: Outcome, aliases: &["relationships", "relationship", "rel"] },
    MetricDef { key: "quality_of_life", column: "quality_of_life", label: "Quality of Life", category: Outcome, aliases: &["quality_of_life", "qol"] },
    MetricDef { key: "wellbeing", column: "wellbeing", label: "Wellbeing", category: Outcome, aliases: &["wellbeing", "well_being", "wb"] },
    MetricDef { key: "influence", column: "influence", label: "Influence", category: Outcome, aliases: &["influence"] },
    MetricDef { key: "decision_making", column: "decision_making", label: "Decision Making", category: Outcome, aliases: &["decision_making", "decisionmaking", "decisions"] },
    MetricDef { key: "community", column: "community", label: "Community", category: Outcome, aliases: &["community"] },
    MetricDef { key: "network", column: "network", label: "Network", category: Outcome, aliases: &["network", "networking"] },
    MetricDef { key: "achievement", column: "achievement", label: "Achievement", category: Outcome, aliases: &["achievement"] },
    MetricDef { key: "satisfaction", column: "satisfaction", label: "Satisfaction", category: Outcome, aliases: &["satisfaction"] },
    MetricDef { key: "balance", column: "balance", label: "Balance", category: Outcome, aliases: &["balance"] },
    MetricDef { key: "health", column: "health", label: "Health", category: Outcome, aliases: &["health"] },
    MetricDef { key: "data_mining", column: "data_mining", label: "Data Mining", category: Talent, aliases: &["data_mining", "datamining"] },
    MetricDef { key: "modeling", column: "modeling", label: "Modeling", category: Talent, aliases: &["modeling", "modelling"] },
    MetricDef { key: "prioritizing", column: "prioritizing", label: "Prioritizing", category: Talent, aliases: &["prioritizing", "prioritising"] },
    MetricDef { key: "connection", column: "connection", label: "Connection", category: Talent, aliases: &["connection"] },
    MetricDef { key: "emotional_insight", column: "emotional_insight", label: "Emotional Insight", category: Talent, aliases: &["emotional_insight", "emotionalinsight"] },
    MetricDef { key: "collaboration", column: "collaboration", label: "Collaboration", category: Talent, aliases: &["collaboration"] },
];

impl Metric {
    pub const COUNT: usize = 30;

    pub const ALL: [Metric; Metric::COUNT] = [
        Metric::EqTotal,
        Metric::Know,
        Metric::Choose,
        Metric::Give,
        Metric::EmotionalLiteracy,
        Metric::RecognizePatterns,
        Metric::ConsequentialThinking,
        Metric::NavigateEmotions,
        Metric::IntrinsicMotivation,
        Metric::Optimism,
        Metric::Empathy,
        Metric::NobleGoals,
        Metric::Effectiveness,
        Metric::Relationships,
        Metric::QualityOfLife,
        Metric::Wellbeing,
        Metric::Influence,
        Metric::DecisionMaking,
        Metric::Community,
        Metric::Network,
        Metric::Achievement,
        Metric::Satisfaction,
        Metric::Balance,
        Metric::Health,
        Metric::DataMining,
        Metric::Modeling,
        Metric::Prioritizing,
        Metric::Connection,
        Metric::EmotionalInsight,
        Metric::Collaboration,
    ];

    fn def(self) -> &'static MetricDef {
        &DEFS[self.index()]
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn key(self) -> &'static str {
        self.def().key
    }

    /// Storage column. Only ever interpolated into SQL from this table.
    pub fn column(self) -> &'static str {
        self.def().column
    }

    pub fn label(self) -> &'static str {
        self.def().label
    }

    pub fn category(self) -> MetricCategory {
        self.def().category
    }

    pub fn is_core(self) -> bool {
        self.category() == MetricCategory::Core
    }

    pub fn aliases(self) -> impl Iterator<Item = &'static str> {
        std::iter::once(self.def().key).chain(self.def().aliases.iter().copied())
    }

    pub fn core() -> impl Iterator<Item = Metric> {
        Metric::ALL.into_iter().filter(|m| m.is_core())
    }

    pub fn from_key(value: &str) -> Option<Metric> {
        let wanted = crate::normalize::normalize_header(value);
        Metric::ALL.into_iter().find(|metric| {
            metric
                .aliases()
                .any(|alias| crate::normalize::normalize_header(alias) == wanted)
        })
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for Metric {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Metric::from_key(s).ok_or_else(|| EngineError::UnknownMetric(s.to_string()))
    }
}

impl TryFrom<String> for Metric {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Metric> for String {
    fn from(metric: Metric) -> Self {
        metric.key().to_string()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MetricValues([Option<f64>; Metric::COUNT]);

impl MetricValues {
    pub fn get(&self, metric: Metric) -> Option<f64> {
        self.0[metric.index()]
    }

    pub fn set(&mut self, metric: Metric, value: Option<f64>) {
        self.0[metric.index()] = value;
    }

    pub fn has_core_signal(&self) -> bool {
        Metric::core().any(|metric| self.get(metric).is_some())
    }

    pub fn iter(&self) -> impl Iterator<Item = (Metric, Option<f64>)> + '_ {
        Metric::ALL.into_iter().map(|metric| (metric, self.get(metric)))
    }
}
